// SPDX-License-Identifier: AGPL-3.0-or-later

use std::io;
use thiserror::Error;

/// Errors surfaced by the write path.
///
/// Validation errors (`InvalidArgument`, `Shape`, `State`) are returned
/// before any storage mutation; the writer stays in its prior state.
/// Data errors (`OutOfBounds`, `Duplicate`, `OutOfOrder`) and I/O errors
/// abort the write and remove the partially written fragment.
#[derive(Debug, Error)]
pub enum WriterError {
    /// Unknown name, bad enum value, or an otherwise malformed argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Buffer sizes inconsistent with the schema or with each other.
    #[error("buffer shape: {0}")]
    Shape(String),

    /// A coordinate lies outside the array domain.
    #[error("coordinate out of bounds: {0}")]
    OutOfBounds(String),

    /// Duplicate coordinates found while duplicate checking is enabled.
    #[error("duplicate coordinates: {0}")]
    Duplicate(String),

    /// Coordinates do not obey the global order in a global-order write.
    #[error("coordinates out of global order: {0}")]
    OutOfOrder(String),

    /// The underlying store failed.
    #[error("storage: {0}")]
    Storage(#[from] io::Error),

    /// A tile filter pipeline rejected its input.
    #[error("filter pipeline: {0}")]
    Filter(String),

    /// Operation invoked in the wrong lifecycle state.
    #[error("invalid writer state: {0}")]
    State(&'static str),
}

pub type Result<T> = std::result::Result<T, WriterError>;
