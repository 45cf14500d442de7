// SPDX-License-Identifier: AGPL-3.0-or-later
//
// GridStore
// An embeddable multi-dimensional array storage kernel: the write path
// that turns user column buffers into immutable, atomically committed
// fragments of filtered tiles.

pub mod buffer;
pub mod coords;
pub mod dense;
pub mod error;
pub mod filter;
pub mod hilbert;
pub mod meta;
pub mod schema;
pub mod storage;
pub mod tile;
pub mod writer;

pub use crate::error::{Result, WriterError};
pub use crate::filter::{FilterPipeline, TileKind};
pub use crate::meta::WrittenFragmentInfo;
pub use crate::schema::{
    ArraySchema, ArrayType, Attribute, CellOrder, Datatype, Dimension, Layout, COORDS,
};
pub use crate::storage::StorageManager;
pub use crate::writer::{Writer, WriterOptions, WriterStats};
