//! Common error types for tunekeep

use thiserror::Error;

/// Common result type for tunekeep operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across tunekeep crates
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Ledger read, lock or rewrite failure
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Invalid user input (identifier list, credential source)
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
