//! Remote API boundary
//!
//! The engine consumes this request/response trait and never sees the
//! transport behind it. [`super::HttpRemote`] talks to the hosted service;
//! [`super::MockRemote`] is an in-memory stand-in for tests.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Ack, Delta, Mutation, SyncCursor};

/// Whether a failure is worth retrying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Retryable => "retryable",
            ErrorClass::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote API errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    /// Connection failed, timed out, or the service returned a 5xx
    #[error("network error: {0}")]
    Network(String),

    #[error("rate limited by the remote")]
    RateLimited {
        /// Server-provided wait hint, if any
        retry_after: Option<Duration>,
    },

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The response could not be decoded
    #[error("malformed response: {0}")]
    Malformed(String),

    /// The remote refused the request
    #[error("request rejected: {0}")]
    Rejected(String),

    /// The request went through but the remote refused this one command
    #[error("command rejected: {0}")]
    CommandRejected(String),
}

impl ApiError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ApiError::Network(_) | ApiError::RateLimited { .. } => ErrorClass::Retryable,
            ApiError::Unauthorized(_)
            | ApiError::Malformed(_)
            | ApiError::Rejected(_)
            | ApiError::CommandRejected(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

/// Request/response access to the hosted service
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Fetches everything changed since `cursor`
    async fn pull(&self, cursor: &SyncCursor) -> Result<Delta, ApiError>;

    /// Submits one mutation
    ///
    /// The remote deduplicates by `mutation.token`, so pushing the same
    /// mutation twice has the effect of pushing it once.
    async fn push(&self, mutation: &Mutation) -> Result<Ack, ApiError>;
}

/// Stand-in for commands that never talk to the service
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineRemote;

#[async_trait]
impl RemoteApi for OfflineRemote {
    async fn pull(&self, _cursor: &SyncCursor) -> Result<Delta, ApiError> {
        Err(ApiError::Rejected("no remote configured".to_string()))
    }

    async fn push(&self, _mutation: &Mutation) -> Result<Ack, ApiError> {
        Err(ApiError::Rejected("no remote configured".to_string()))
    }
}
