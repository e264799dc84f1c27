//! Error taxonomy for the session engine
//!
//! Classification happens once, in the session manager. Every other component
//! only looks at `ConnectionState` and never re-reads error strings.

use thiserror::Error;

use crate::model::PlayerCommand;

/// User-facing message surfaced when a credential is classified as expired.
pub const SESSION_EXPIRED_MESSAGE: &str = "Session expired. Please connect again.";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The authorization provider cannot be reached. Not retryable.
    #[error("{0}")]
    DeviceUnavailable(String),

    /// The stored credential was rejected. Not retryable until re-authorized.
    #[error("session expired: {0}")]
    ExpiredCredential(String),

    /// Connectivity hiccup, retried up to the configured maximum.
    #[error("{0}")]
    Transient(String),

    /// A single device command failed. Never changes the connection state.
    #[error("{command} failed: {message}")]
    CommandFailure {
        command: &'static str,
        message: String,
    },
}

impl EngineError {
    /// Build the error for a failure message according to its class.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        match ErrorClass::classify(&message) {
            ErrorClass::ExpiredCredential => EngineError::ExpiredCredential(message),
            ErrorClass::Transient => EngineError::Transient(message),
        }
    }

    pub fn command(command: &PlayerCommand, message: impl Into<String>) -> Self {
        EngineError::CommandFailure {
            command: command.name(),
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}

/// Connection-level failure class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    ExpiredCredential,
    Transient,
}

impl ErrorClass {
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        let invalid_grant = lower.contains("invalid") && lower.contains("grant");
        let expired_token = lower.contains("token") && lower.contains("expired");
        if invalid_grant || expired_token {
            ErrorClass::ExpiredCredential
        } else {
            ErrorClass::Transient
        }
    }
}
