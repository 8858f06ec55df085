/*
 * SPDX-FileCopyrightText: 2026 Unifeed Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::time::Duration;
use thiserror::Error;

/// Classified failure of a protocol operation.
///
/// The dispatcher's retry policy keys off the variant: `Transient` and
/// `RateLimited` wait for the next natural cycle (or the provider-given
/// delay), `AuthExpired` suspends automatic refresh for the account until an
/// external re-authorization signal, everything else is logged and dropped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("transient network error: {0}")]
    Transient(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("authorization expired")]
    AuthExpired,

    #[error("unsupported action: {0}")]
    UnsupportedAction(String),

    #[error("{0}")]
    Permanent(String),
}

impl ProtocolError {
    /// Map an HTTP status to the standard classification.
    pub fn from_status(status: u16, retry_after: Option<Duration>) -> Self {
        match status {
            401 | 403 => Self::AuthExpired,
            429 => Self::RateLimited { retry_after },
            500..=599 => Self::Transient(format!("server returned {status}")),
            _ => Self::Permanent(format!("server returned {status}")),
        }
    }

    /// True when the next scheduled cycle may retry this account.
    pub fn retry_next_cycle(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }
}

impl From<TransportError> for ProtocolError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => Self::Transient("request timed out".to_string()),
            TransportError::Connect(msg) => Self::Transient(msg),
            TransportError::Other(msg) => Self::Permanent(msg),
        }
    }
}

/// Failure of the raw fetch capability, before any protocol-level reading of
/// the response body.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() || err.is_request() {
            Self::Connect(err.to_string())
        } else {
            Self::Other(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(matches!(
            ProtocolError::from_status(401, None),
            ProtocolError::AuthExpired
        ));
        assert!(matches!(
            ProtocolError::from_status(429, None),
            ProtocolError::RateLimited { .. }
        ));
        assert!(matches!(
            ProtocolError::from_status(503, None),
            ProtocolError::Transient(_)
        ));
        assert!(matches!(
            ProtocolError::from_status(404, None),
            ProtocolError::Permanent(_)
        ));
    }

    #[test]
    fn retry_policy() {
        assert!(ProtocolError::Transient("x".into()).retry_next_cycle());
        assert!(ProtocolError::RateLimited { retry_after: None }.retry_next_cycle());
        assert!(!ProtocolError::AuthExpired.retry_next_cycle());
        assert!(!ProtocolError::Permanent("x".into()).retry_next_cycle());
    }
}
