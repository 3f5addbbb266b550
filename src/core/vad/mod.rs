//! Energy-based voice activity detection.
//!
//! Examines inbound frames and turns raw energy into speech start/end
//! events with the debounce the turn logic needs: speech must persist
//! before `SpeechStart` fires, and silence must persist before `TurnEnd`.

mod tracker;

pub use tracker::{SpeechTracker, VadConfig, VadEvent};
