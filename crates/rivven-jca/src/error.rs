//! Error types for rivven-jca
//!
//! Errors are classified so callers can tell a transient condition from a
//! permanent one:
//! - Retriable errors (blocking timeout, connection creation)
//! - Permanent errors (pool shut down, configuration, detached handles)

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for rivven-jca operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Blocking acquisition exceeded the configured timeout (retriable)
    Timeout,
    /// Factory failed to create a managed connection (retriable)
    Creation,
    /// Connection failed a health check
    Validation,
    /// Connection refused to close cleanly
    Destruction,
    /// Invalid pool configuration
    Configuration,
    /// Operation not permitted in the current state
    IllegalState,
    /// Handle no longer backed by a pooled connection
    NotAvailable,
    /// Pool is shut down or draining
    Shutdown,
    /// Transaction enlistment or delistment failed
    Transaction,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Timeout | Self::Creation)
    }
}

/// Main error type for rivven-jca
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// No permit became available before the blocking timeout elapsed
    #[error("resource timeout in pool '{pool}' for key {key}: waited {waited_ms} ms")]
    ResourceTimeout {
        pool: String,
        key: String,
        waited_ms: u64,
    },

    /// Managed connection could not be created
    #[error("connection creation failed: {message}")]
    Creation {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Managed connection failed validation
    #[error("validation failed: {message}")]
    Validation { message: String },

    /// Managed connection could not be destroyed
    #[error("destruction failed: {message}")]
    Destruction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Operation invalid in the current state
    #[error("illegal state: {message}")]
    IllegalState { message: String },

    /// Handle is closed or its connection was destroyed
    #[error("connection not available: {message}")]
    NotAvailable { message: String },

    /// Pool is shut down or a graceful shutdown is pending
    #[error("pool '{pool}' is shut down")]
    Shutdown { pool: String },

    /// Transaction integration error
    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Unsupported operation for this connection or strategy
    #[error("unsupported: {message}")]
    Unsupported { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::ResourceTimeout { .. } => ErrorCategory::Timeout,
            Self::Creation { .. } => ErrorCategory::Creation,
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::Destruction { .. } => ErrorCategory::Destruction,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::IllegalState { .. } => ErrorCategory::IllegalState,
            Self::NotAvailable { .. } => ErrorCategory::NotAvailable,
            Self::Shutdown { .. } => ErrorCategory::Shutdown,
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::Unsupported { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Create a resource timeout error
    pub fn timeout(pool: impl Into<String>, key: impl Into<String>, waited: Duration) -> Self {
        Self::ResourceTimeout {
            pool: pool.into(),
            key: key.into(),
            waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a creation error
    pub fn creation(message: impl Into<String>) -> Self {
        Self::Creation {
            message: message.into(),
            source: None,
        }
    }

    /// Create a creation error with source
    pub fn creation_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Creation {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a destruction error
    pub fn destruction(message: impl Into<String>) -> Self {
        Self::Destruction {
            message: message.into(),
            source: None,
        }
    }

    /// Create a destruction error with source
    pub fn destruction_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Destruction {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an illegal state error
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState {
            message: message.into(),
        }
    }

    /// Create a connection-not-available error
    pub fn not_available(message: impl Into<String>) -> Self {
        Self::NotAvailable {
            message: message.into(),
        }
    }

    /// Create a shutdown error
    pub fn shutdown(pool: impl Into<String>) -> Self {
        Self::Shutdown { pool: pool.into() }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transaction error with source
    pub fn transaction_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transaction {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Creation => write!(f, "creation"),
            Self::Validation => write!(f, "validation"),
            Self::Destruction => write!(f, "destruction"),
            Self::Configuration => write!(f, "configuration"),
            Self::IllegalState => write!(f, "illegal_state"),
            Self::NotAvailable => write!(f, "not_available"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::Transaction => write!(f, "transaction"),
            Self::Other => write!(f, "other"),
        }
    }
}
