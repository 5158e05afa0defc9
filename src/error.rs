//! Error types for the fake SQL server.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Query errors are reported back to the MySQL client as ERR packets, so every
//! variant carries a message that makes sense when shown in a GUI client.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Error reported by the target database through runops.
    #[error("{}", sql_error_text(*code, sql_state.as_deref(), message))]
    Sql {
        code: Option<u16>,
        sql_state: Option<String>,
        message: String,
    },

    #[error("runops failed: {message}")]
    Runops { message: String, suggestion: String },

    #[error("Timeout: {operation} exceeded {elapsed_secs}s")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    #[error("Type discovery failed: {message}")]
    TypeDiscovery { message: String },

    #[error("Unknown prepared statement: {statement_id}")]
    StatementNotFound { statement_id: u32 },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Failed to fetch result: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn sql_error_text(code: Option<u16>, sql_state: Option<&str>, message: &str) -> String {
    match (code, sql_state) {
        (Some(code), Some(state)) => format!("ERROR {} ({}): {}", code, state, message),
        (Some(code), None) => format!("ERROR {}: {}", code, message),
        _ => message.to_string(),
    }
}

impl ProxyError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a SQL error as reported by the target database.
    pub fn sql(code: Option<u16>, sql_state: Option<String>, message: impl Into<String>) -> Self {
        Self::Sql {
            code,
            sql_state,
            message: message.into(),
        }
    }

    /// Create a runops error with a helpful suggestion.
    pub fn runops(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Runops {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_secs: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs,
        }
    }

    /// Create a type discovery error.
    pub fn type_discovery(message: impl Into<String>) -> Self {
        Self::TypeDiscovery {
            message: message.into(),
        }
    }

    /// Create an unknown prepared statement error.
    pub fn statement_not_found(statement_id: u32) -> Self {
        Self::StatementNotFound { statement_id }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Runops { suggestion, .. } => Some(suggestion),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Fetch(_) | Self::Runops { .. }
        )
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::config(format!("Invalid YAML: {}", err))
    }
}

impl From<url::ParseError> for ProxyError {
    fn from(err: url::ParseError) -> Self {
        ProxyError::runops(
            format!("runops returned an invalid result URL: {}", err),
            "Check the runops CLI version",
        )
    }
}

impl From<sqlparser::parser::ParserError> for ProxyError {
    fn from(err: sqlparser::parser::ParserError) -> Self {
        ProxyError::type_discovery(format!("Failed to parse SQL: {}", err))
    }
}

/// Result type alias for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;
