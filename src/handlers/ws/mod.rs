//! WebSocket gateway: the authenticated duplex transport that carries one
//! call per connection.
//!
//! Binary messages are 12-byte-header audio frames; text messages are the
//! typed JSON protocol of `messages.rs`.

pub mod handler;
pub mod messages;
pub mod processor;
pub mod rate_limit;

pub use handler::ws_call_handler;
pub use messages::{ClientMessage, ServerMessage};
pub use rate_limit::RateLimiter;
