//! Top-level error type for the supervisor binary
//!
//! Component errors stay typed in their own modules. `CoopError` only exists
//! where they meet: startup, wiring, and shutdown.

use crate::config::ConfigError;
use crate::link::LinkError;
use crate::session::SessionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoopError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Network link error: {0}")]
    Link(#[from] LinkError),

    #[error("MQTT session error: {0}")]
    Session(#[from] SessionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),
}

impl CoopError {
    /// Process exit code for this error
    ///
    /// Follows sysexits(3): 78 for configuration, 69 for an unavailable service,
    /// 74 for I/O, 70 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            CoopError::Config(_) => 78,
            CoopError::Link(_) | CoopError::Session(_) => 69,
            CoopError::Io(_) => 74,
            CoopError::Serialization(_) => 70,
        }
    }
}

pub type CoopResult<T> = Result<T, CoopError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions_and_messages() {
        let error: CoopError = ConfigError::EnvVarNotFound("AIO_KEY".to_string()).into();
        assert!(error.to_string().starts_with("Configuration error"));
        assert_eq!(error.exit_code(), 78);

        let error: CoopError = SessionError::AuthRejected.into();
        assert_eq!(
            error.to_string(),
            "MQTT session error: Broker rejected credentials"
        );
        assert_eq!(error.exit_code(), 69);

        let error: CoopError = LinkError::NoCarrier.into();
        assert_eq!(error.exit_code(), 69);
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let error: CoopError = io.into();
        assert_eq!(error.exit_code(), 74);
    }
}
