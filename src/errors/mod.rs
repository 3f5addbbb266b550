pub mod app_error;

use serde::{Deserialize, Serialize};

/// Error classification shared by the transport, the call state machine and
/// the session backends.
///
/// Every error that crosses a module boundary is mapped onto one of these
/// kinds; the wire representation (`code()`) is part of the client protocol
/// and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Token invalid, expired, nonce replayed or call-id mismatch.
    Auth,
    /// Per-connection message budget exhausted.
    RateLimited,
    /// Inbound binary message above the configured frame limit.
    FrameTooLarge,
    /// Malformed JSON or a field outside its contractual range.
    Validation,
    /// A session backend refused to open or is gone.
    BackendUnavailable,
    /// A session backend missed its response deadline.
    BackendTimeout,
    /// Unexpected internal failure.
    Internal,
    /// Bandit/deploy/feedback state could not be written.
    Persistence,
    /// Both backends are down; the call cannot continue.
    Terminal,
}

impl ErrorKind {
    /// Stable wire code used in `error` messages sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::FrameTooLarge => "frame_too_large",
            ErrorKind::Validation => "validation",
            ErrorKind::BackendUnavailable => "backend_unavailable",
            ErrorKind::BackendTimeout => "backend_timeout",
            ErrorKind::Internal => "internal",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Terminal => "terminal",
        }
    }

    /// Whether the connection should be closed without creating a call.
    ///
    /// Transport-level failures never reach the FSM; the others are routed
    /// through it so the call can close gracefully.
    pub fn is_transport_level(&self) -> bool {
        matches!(
            self,
            ErrorKind::Auth
                | ErrorKind::RateLimited
                | ErrorKind::FrameTooLarge
                | ErrorKind::Validation
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes_are_stable() {
        assert_eq!(ErrorKind::Auth.code(), "auth");
        assert_eq!(ErrorKind::RateLimited.code(), "rate_limited");
        assert_eq!(ErrorKind::FrameTooLarge.code(), "frame_too_large");
        assert_eq!(ErrorKind::Validation.code(), "validation");
        assert_eq!(ErrorKind::BackendUnavailable.code(), "backend_unavailable");
        assert_eq!(ErrorKind::BackendTimeout.code(), "backend_timeout");
        assert_eq!(ErrorKind::Internal.code(), "internal");
        assert_eq!(ErrorKind::Persistence.code(), "persistence");
        assert_eq!(ErrorKind::Terminal.code(), "terminal");
    }

    #[test]
    fn test_transport_level_split() {
        assert!(ErrorKind::Auth.is_transport_level());
        assert!(ErrorKind::RateLimited.is_transport_level());
        assert!(ErrorKind::FrameTooLarge.is_transport_level());
        assert!(ErrorKind::Validation.is_transport_level());
        assert!(!ErrorKind::BackendUnavailable.is_transport_level());
        assert!(!ErrorKind::Terminal.is_transport_level());
    }

    #[test]
    fn test_serde_round_trip() {
        let json = serde_json::to_string(&ErrorKind::FrameTooLarge).unwrap();
        assert_eq!(json, "\"frame_too_large\"");
        let back: ErrorKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorKind::FrameTooLarge);
    }
}
