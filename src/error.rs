//! Error types for the convergence harness
//!
//! Provides structured error types for the driver registries, the node
//! registry, the retry engine and the convergence recipes built on it.

use crate::registry::DriverCategory;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the harness
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Driver Registry Errors
    // =========================================================================
    #[error("{category} driver already registered: {name}")]
    DriverAlreadyRegistered {
        category: DriverCategory,
        name: String,
    },

    #[error("{category} driver not found: {id}")]
    DriverNotFound { id: String, category: DriverCategory },

    #[error("{category} registry does not allow replacing entries: {name}")]
    ReplaceNotAllowed {
        category: DriverCategory,
        name: String,
    },

    // =========================================================================
    // Node Registry Errors
    // =========================================================================
    #[error("Invalid node: {0}")]
    InvalidNode(String),

    #[error("Node not found in node registry: {node}")]
    NodeNotFound { node: String },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Backend unavailable: {backend}")]
    BackendUnavailable { backend: String },

    #[error("Backend operation failed: {backend} - {operation}: {reason}")]
    BackendOperationFailed {
        backend: String,
        operation: String,
        reason: String,
    },

    // =========================================================================
    // Probe Observations
    // =========================================================================
    #[error("{resource} has not converged yet [{state}]: {message}")]
    NotConverged {
        resource: String,
        state: String,
        message: String,
    },

    #[error("{resource} reported failure [{state}]: {message}")]
    OperationFailed {
        resource: String,
        state: String,
        message: String,
    },

    #[error("{resource} is not progressing, status unchanged: {message}")]
    Stalled { resource: String, message: String },

    // =========================================================================
    // Convergence Results
    // =========================================================================
    #[error(
        "{resource} did not converge within {elapsed:?} after {attempts} attempts: {}",
        describe_last(.last_error)
    )]
    ConvergenceTimeout {
        resource: String,
        elapsed: Duration,
        attempts: u32,
        last_error: Option<Box<Error>>,
    },

    #[error("{resource} failed to converge after {attempts} attempts: {source}")]
    ConvergenceFailed {
        resource: String,
        attempts: u32,
        source: Box<Error>,
    },

    #[error(
        "wait for {resource} cancelled after {attempts} attempts: {}",
        describe_last(.last_error)
    )]
    ConvergenceCancelled {
        resource: String,
        attempts: u32,
        last_error: Option<Box<Error>>,
    },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_last(last: &Option<Box<Error>>) -> String {
    match last {
        Some(err) => err.to_string(),
        None => "no status observed".to_string(),
    }
}

/// How an error should be treated by whoever receives it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Programmer or environment fixable, never retried
    Configuration,
    /// The infrastructure has not converged yet, polling again may help
    Transient,
    /// Terminal failure, polling again will not help
    Fatal,
}

impl Error {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            // Not yet converged - poll again
            Error::BackendUnavailable { .. } | Error::NotConverged { .. } => {
                ErrorClass::Transient
            }

            // Configuration/validation errors - surface immediately
            Error::Configuration(_)
            | Error::DriverAlreadyRegistered { .. }
            | Error::DriverNotFound { .. }
            | Error::ReplaceNotAllowed { .. }
            | Error::InvalidNode(_)
            | Error::NodeNotFound { .. }
            | Error::Yaml(_)
            | Error::JsonParse(_) => ErrorClass::Configuration,

            // Everything else ends the operation
            _ => ErrorClass::Fatal,
        }
    }

    /// Check if this error is worth polling again for
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        self.is_retryable()
    }

    /// Whether a convergence wait ran out of time
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::ConvergenceTimeout { .. })
    }

    /// Whether a convergence wait was ended by an explicit failure
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ConvergenceFailed { .. })
    }

    /// Resource a convergence error refers to
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::ConvergenceTimeout { resource, .. }
            | Error::ConvergenceFailed { resource, .. }
            | Error::ConvergenceCancelled { resource, .. }
            | Error::NotConverged { resource, .. }
            | Error::OperationFailed { resource, .. }
            | Error::Stalled { resource, .. } => Some(resource.as_str()),
            _ => None,
        }
    }

    /// Last probe error observed before a convergence wait ended
    pub fn last_observed(&self) -> Option<&Error> {
        match self {
            Error::ConvergenceTimeout { last_error, .. }
            | Error::ConvergenceCancelled { last_error, .. } => last_error.as_deref(),
            Error::ConvergenceFailed { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }

    /// Number of probe invocations made before a convergence wait ended
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Error::ConvergenceTimeout { attempts, .. }
            | Error::ConvergenceFailed { attempts, .. }
            | Error::ConvergenceCancelled { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

/// Result type alias for the harness
pub type Result<T> = std::result::Result<T, Error>;
