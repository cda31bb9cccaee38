//! Types shared across lparkit crates.

pub mod errors;

pub use errors::{LparkitError, LparkitResult, RevertFailure, StoragePoolError};
