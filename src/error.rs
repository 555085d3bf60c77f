//! Host-side error taxonomy shared by the loader, relocator, registry and bus
//! controller.
//!
//! Emulated bus faults are not host errors and are modelled separately by
//! [`crate::core::BusFault`].

use thiserror::Error;

/// Errors reported by the runtime.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// Malformed or missing caller input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Missing file, unknown entry symbol or unregistered module.
    #[error("not found: {0}")]
    NotFound(String),
    /// Allocation failure or a full fixed-capacity table.
    #[error("out of resources: {0}")]
    OutOfResources(String),
    /// File or image size outside its declared bounds.
    #[error("invalid size: {what} is {actual} bytes, limit {limit}")]
    InvalidSize {
        what: &'static str,
        actual: usize,
        limit: usize,
    },
    /// Format or interface version mismatch.
    #[error("invalid version: {what} is {found:#x}, expected {expected:#x}")]
    InvalidVersion {
        what: &'static str,
        found: u32,
        expected: u32,
    },
    /// Out-of-bounds relocation or illegal lifecycle ordering.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub(crate) fn out_of_resources(msg: impl Into<String>) -> Self {
        Self::OutOfResources(msg.into())
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
