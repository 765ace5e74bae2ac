//! # tunekeep Common Library
//!
//! Shared code for the tunekeep crates:
//! - Error type
//! - Configuration loading and root folder layout
//! - Identifier canonicalization
//! - Input list reading
//! - The durable processed-identifier ledger

pub mod config;
pub mod error;
pub mod identifier;
pub mod input;
pub mod ledger;

pub use error::{Error, Result};
pub use identifier::canonicalize;
pub use ledger::{AppendOutcome, Ledger, LedgerOptions, ReconcileReport};
