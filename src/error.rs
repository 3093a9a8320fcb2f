//! Error types for dbkit.
//!
//! Every failure surfaces as one of two categories: connection-level
//! (network/session) or general (malformed call, driver-reported query
//! error). Both carry the name of the public operation that failed.

use thiserror::Error;

use crate::driver::DriverError;

#[derive(Error, Debug)]
pub enum Error {
    /// Network or session failure: connect refused, connection dropped
    /// mid-query, worker gone. Never retried internally.
    #[error("{operation}: {message}")]
    Connection {
        operation: &'static str,
        message: String,
    },

    /// Malformed call or driver-reported query error (syntax, constraint
    /// violation, missing option, invalid pool size). Never retried.
    #[error("{operation}: {message}")]
    General {
        operation: &'static str,
        message: String,
    },
}

impl Error {
    pub(crate) fn connection(operation: &'static str, message: impl Into<String>) -> Self {
        Error::Connection {
            operation,
            message: message.into(),
        }
    }

    pub(crate) fn general(operation: &'static str, message: impl Into<String>) -> Self {
        Error::General {
            operation,
            message: message.into(),
        }
    }

    /// Re-raise a driver failure under the public operation that hit it.
    pub(crate) fn from_driver(operation: &'static str, err: DriverError) -> Self {
        match err {
            DriverError::Connection(message) => Error::Connection { operation, message },
            DriverError::Query(message) => Error::General { operation, message },
        }
    }

    /// True for the connection-level category.
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_prefixes_operation() {
        let err = Error::general("Adapter#execute", "near \"SELEC\": syntax error");
        assert_eq!(
            err.to_string(),
            "Adapter#execute: near \"SELEC\": syntax error"
        );
        assert!(!err.is_connection());
    }

    #[test]
    fn test_driver_error_mapping() {
        let err = Error::from_driver("Pool#execute", DriverError::Connection("gone".into()));
        assert!(err.is_connection());
        assert_eq!(err.to_string(), "Pool#execute: gone");
    }
}
