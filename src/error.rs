//! Error types for the app-framework scheduler

use thiserror::Error;

/// Main error type for scheduler operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Filesystem error on the staging volume
    #[error("staging volume error: {0}")]
    Io(#[from] std::io::Error),

    /// Validation error for app-framework configuration
    #[error("validation error: {0}")]
    Validation(String),

    /// A remote listing referenced an app source that is not configured
    #[error("unknown app source: {0}")]
    UnknownAppSource(String),

    /// Remote object store failure (listing or download)
    #[error("remote store error: {0}")]
    RemoteStore(String),

    /// Pod exec transport failure (copy or install)
    #[error("pod transport error: {0}")]
    PodTransport(String),

    /// Persisted status context could not be migrated
    #[error("status migration error: {0}")]
    Migration(String),

    /// Not enough free bytes on the staging volume
    #[error("insufficient staging disk space: need {needed} bytes, {available} available")]
    InsufficientDiskSpace {
        /// Bytes the caller asked to reserve
        needed: u64,
        /// Bytes currently unreserved
        available: u64,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a remote-store error with the given message
    pub fn remote_store(msg: impl Into<String>) -> Self {
        Self::RemoteStore(msg.into())
    }

    /// Create a pod-transport error with the given message
    pub fn pod_transport(msg: impl Into<String>) -> Self {
        Self::PodTransport(msg.into())
    }

    /// Create a migration error with the given message
    pub fn migration(msg: impl Into<String>) -> Self {
        Self::Migration(msg.into())
    }
}
