//! Error types for node operations

use crate::link::LinkError;
use crate::security::AuthError;
use crate::select::SelectError;
use crate::wire::{ErrorCode, ErrorReply};

/// Reasons a login is refused. Every login failure ends the connection.
#[derive(thiserror::Error, Debug)]
pub enum LoginError {
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolMismatch { expected: u16, actual: u16 },

    #[error("Unknown role '{0}'")]
    UnknownRole(String),

    #[error("Missing host name")]
    MissingHost,

    #[error("Invalid port {0}")]
    InvalidPort(u16),

    #[error("Login rejected: {0}")]
    Auth(#[from] AuthError),

    #[error("Too many nodes, no free slot for {0}")]
    RegistryFull(String),

    #[error("Expected a login, got {0}")]
    NotLogin(String),
}

/// Rejection of a single command.
#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    #[error("Invalid request: {0}")]
    Invalid(String),

    #[error("{0}")]
    Unavailable(#[from] SelectError),

    #[error("Node already logged in")]
    AlreadyLoggedIn,

    #[error("Unable to reach node: {0}")]
    Link(#[from] LinkError),
}

impl HandlerError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        HandlerError::Invalid(reason.into())
    }

    /// Fatal errors end the connection, all others only reject the command.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HandlerError::AlreadyLoggedIn)
    }

    pub fn to_reply(&self) -> ErrorReply {
        let code = match self {
            HandlerError::Invalid(_) => ErrorCode::Invalid,
            HandlerError::Unavailable(_) | HandlerError::Link(_) => ErrorCode::Unavailable,
            HandlerError::AlreadyLoggedIn => ErrorCode::Fatal,
        };
        ErrorReply {
            code,
            message: self.to_string(),
        }
    }
}

impl LoginError {
    pub fn to_reply(&self) -> ErrorReply {
        let code = match self {
            LoginError::Auth(auth) if auth.is_fatal() => ErrorCode::Fatal,
            LoginError::Auth(_) => ErrorCode::NotAuthorized,
            LoginError::RegistryFull(_) => ErrorCode::Unavailable,
            _ => ErrorCode::Fatal,
        };
        ErrorReply {
            code,
            message: self.to_string(),
        }
    }
}
