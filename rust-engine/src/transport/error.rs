//! Error types for SMTP submission.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse SMTP response: {0}")]
    Parse(String),

    /// The server answered a command with an unexpected status code.
    #[error("{command} rejected: {code} {message}")]
    Rejected {
        command: &'static str,
        code: u16,
        message: String,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Invalid sending profile: {0}")]
    InvalidProfile(String),

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}

impl TransportError {
    /// Whether the server itself refused the message with a 5xx code.
    pub fn is_permanent(&self) -> bool {
        matches!(self, TransportError::Rejected { code, .. } if *code >= 500)
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
