// SPDX-License-Identifier: MIT
//! Error taxonomy shared across the tunnel engine (spec §7).
//!
//! Library code returns [`Result<T>`]; binaries wrap the top-level call in
//! `anyhow::Context` the way the teacher crate's service entry points do.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SsError>;

#[derive(Debug, Error)]
pub enum SsError {
    #[error("configuration invalid: {reason}")]
    ConfigInvalid { reason: String },

    #[error("certificate error: {reason}")]
    CertLoad { reason: String },

    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("dial to {addr} exhausted retries")]
    DialExhausted { addr: String },

    #[error("tls handshake failed: {reason}")]
    TlsHandshake { reason: String },

    #[error("tun adapter create failed: {reason}")]
    AdapterCreate { reason: String },

    #[error("tun adapter configure failed: {reason}")]
    AdapterConfigure { reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("circuit open, retry after {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("cancelled")]
    Cancelled,
}

impl SsError {
    /// Classification used by the resilience kit's default error classifier (§4.4).
    pub fn category(&self) -> ErrorCategory {
        match self {
            SsError::Bind { .. } | SsError::DialExhausted { .. } => ErrorCategory::Network,
            SsError::Timeout(_) => ErrorCategory::Timeout,
            SsError::CircuitOpen { .. } => ErrorCategory::CircuitOpen,
            SsError::ConfigInvalid { .. } => ErrorCategory::Configuration,
            SsError::Cancelled => ErrorCategory::NonRetryable,
            SsError::CertLoad { .. } => ErrorCategory::Validation,
            SsError::Io(e) => match e.kind() {
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::NotConnected => ErrorCategory::Network,
                std::io::ErrorKind::TimedOut => ErrorCategory::Timeout,
                _ => ErrorCategory::Recoverable,
            },
            SsError::TlsHandshake { .. }
            | SsError::AdapterCreate { .. }
            | SsError::AdapterConfigure { .. } => ErrorCategory::Recoverable,
        }
    }
}

/// Error categories used by the circuit breaker's default classifier (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Timeout,
    RateLimit,
    ResourceExhaustion,
    Validation,
    Configuration,
    CircuitOpen,
    NonRetryable,
    Recoverable,
}

/// Whether the retry executor should keep trying, give up, or skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    Fatal,
    Skip,
}

impl ErrorCategory {
    /// Default classification used when the caller does not supply one (§4.4).
    pub fn default_disposition(self) -> RetryDisposition {
        match self {
            ErrorCategory::Network | ErrorCategory::Timeout | ErrorCategory::Recoverable => {
                RetryDisposition::Retryable
            }
            ErrorCategory::RateLimit | ErrorCategory::CircuitOpen => RetryDisposition::Retryable,
            ErrorCategory::ResourceExhaustion => RetryDisposition::Retryable,
            ErrorCategory::Validation | ErrorCategory::Configuration => RetryDisposition::Fatal,
            ErrorCategory::NonRetryable => RetryDisposition::Skip,
        }
    }
}
