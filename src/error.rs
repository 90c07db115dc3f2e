//! Error taxonomy for the emergency response engine
//!
//! Every failure the engine can report is one of these variants. Adapters
//! surface them to the UI collaborator; the alert lifecycle absorbs them.

use thiserror::Error;

/// Typed engine error, surfaced to callers and observers
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("permission denied")]
    PermissionDenied,

    #[error("position unavailable: {reason}")]
    PositionUnavailable { reason: String },

    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    #[error("{capability} is not supported on this device")]
    Unsupported { capability: String },

    #[error("speech recognition error: {message}")]
    RecognitionError { message: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        EngineError::InvalidConfiguration { reason: reason.into() }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        EngineError::PositionUnavailable { reason: reason.into() }
    }

    /// Whether continuous tracking may keep running after this error
    ///
    /// Transient fix failures keep the watch alive; everything else forces
    /// the mode inactive until an explicit restart.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, EngineError::PositionUnavailable { .. } | EngineError::Timeout { .. })
    }

    /// Short snake_case tag for logs and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::PermissionDenied => "permission_denied",
            EngineError::PositionUnavailable { .. } => "position_unavailable",
            EngineError::Timeout { .. } => "timeout",
            EngineError::Unsupported { .. } => "unsupported",
            EngineError::RecognitionError { .. } => "recognition_error",
            EngineError::InvalidConfiguration { .. } => "invalid_configuration",
        }
    }

    /// Message shown to the user by the display collaborator
    pub fn user_message(&self) -> String {
        match self {
            EngineError::PermissionDenied => {
                "Location access denied. Please enable location services in your device settings."
                    .to_string()
            }
            EngineError::PositionUnavailable { .. } => {
                "Location information is unavailable. Please check your device settings."
                    .to_string()
            }
            EngineError::Timeout { .. } => {
                "Location request timed out. Please try again.".to_string()
            }
            EngineError::Unsupported { capability } => {
                format!("{} is not supported on this device", capability)
            }
            EngineError::RecognitionError { message } => {
                format!("Speech recognition error: {}", message)
            }
            EngineError::InvalidConfiguration { reason } => {
                format!("Invalid configuration: {}", reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        assert!(EngineError::Timeout { duration_ms: 10_000 }.is_recoverable());
        assert!(EngineError::unavailable("no fix").is_recoverable());
        assert!(!EngineError::PermissionDenied.is_recoverable());
        assert!(!EngineError::Unsupported { capability: "geolocation".into() }.is_recoverable());
        assert!(!EngineError::RecognitionError { message: "network".into() }.is_recoverable());
    }

    #[test]
    fn test_display_and_kind() {
        let err = EngineError::Timeout { duration_ms: 5000 };
        assert_eq!(err.to_string(), "operation timed out after 5000ms");
        assert_eq!(err.kind(), "timeout");

        let err = EngineError::invalid_config("zone z1 radius must be positive");
        assert_eq!(err.kind(), "invalid_configuration");
        assert!(err.user_message().contains("zone z1"));
    }
}
