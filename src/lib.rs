pub mod auth;
pub mod config;
pub mod core;
pub mod errors;
pub mod metrics;
pub mod handlers;
pub mod routes;
pub mod state;

// Re-export commonly used items for convenience
pub use config::ServerConfig;
pub use core::*;
pub use errors::app_error::{AppError, AppResult};
pub use errors::ErrorKind;
pub use state::AppState;
