//! # Error Handling
//!
//! Crate-wide error type and result alias. Construction and validation
//! errors are returned synchronously; rotation errors are recorded on the
//! static account instead of being raised.

pub mod types;

pub use types::{DbSecretsError, Result};
