//! Bulk sink error types.
//!
//! This module defines the error types that can occur while building or
//! submitting bulk requests.

use thiserror::Error;

/// Errors that can occur during bulk sink operations.
#[derive(Error, Debug, Clone)]
pub enum SinkError {
    /// Failed to reach the sink (transport-level failure).
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The sink rejected the bulk request as a whole.
    #[error("Bulk request rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    /// Failed to parse the response from the sink.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// A payload could not be appended to a bulk request.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

impl SinkError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::ConnectionError(msg.into())
    }

    /// Create a rejection error.
    pub fn rejected(status: u16, body: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            body: body.into(),
        }
    }

    /// Create a parse error.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::ParseError(msg.into())
    }

    /// Create a malformed payload error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedPayload(msg.into())
    }

    /// Whether re-submitting the same request could plausibly succeed.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::ConnectionError(_) | Self::ParseError(_) => true,
            Self::Rejected { status, .. } => *status == 429 || *status >= 500,
            Self::MalformedPayload(_) => false,
        }
    }
}
