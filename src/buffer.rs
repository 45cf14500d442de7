// SPDX-License-Identifier: AGPL-3.0-or-later
//
// User buffer binding. Variable-length offsets arrive in whatever
// configuration the caller picked (32/64-bit, bytes/elements, optional
// trailing sentinel) and are normalized to one canonical form at
// binding time: absolute 64-bit byte offsets, one per cell, first at 0.

use crate::error::{Result, WriterError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetsMode {
    Bytes,
    Elements,
}

/// User-facing interpretation of variable-length offset buffers.
#[derive(Debug, Clone, Copy)]
pub struct OffsetsConfig {
    /// Width of one user offset: 32 or 64 bits.
    pub bitsize: u32,
    pub mode: OffsetsMode,
    /// Whether the buffer carries a trailing sentinel equal to the
    /// total value bytes (or elements).
    pub extra_element: bool,
}

impl Default for OffsetsConfig {
    fn default() -> Self {
        Self {
            bitsize: 64,
            mode: OffsetsMode::Bytes,
            extra_element: false,
        }
    }
}

/// One bound attribute/dimension buffer triple.
///
/// `values` and `validity` are borrowed from the caller; offsets are
/// stored in canonical form only. The original offsets configuration is
/// kept by the writer for error messages.
#[derive(Debug)]
pub struct QueryBuffer<'a> {
    pub values: &'a [u8],
    /// Canonical offsets: absolute byte positions, one per cell.
    pub offsets: Option<Vec<u64>>,
    pub validity: Option<&'a [u8]>,
}

impl<'a> QueryBuffer<'a> {
    pub fn fixed(values: &'a [u8]) -> Self {
        Self {
            values,
            offsets: None,
            validity: None,
        }
    }

    pub fn with_offsets(mut self, offsets: Vec<u64>) -> Self {
        self.offsets = Some(offsets);
        self
    }

    pub fn with_validity(mut self, validity: &'a [u8]) -> Self {
        self.validity = Some(validity);
        self
    }
}

/// Decodes and validates a user offsets buffer into canonical form.
///
/// `elem_size` is the size of one value element (used in `Elements`
/// mode) and `values_size` the length of the bound values buffer.
pub fn normalize_offsets(
    name: &str,
    raw: &[u8],
    cfg: OffsetsConfig,
    elem_size: usize,
    values_size: u64,
) -> Result<Vec<u64>> {
    let width = (cfg.bitsize / 8) as usize;
    if raw.len() % width != 0 {
        return Err(WriterError::Shape(format!(
            "`{name}`: offsets size {} is not a multiple of the {}-bit offset width",
            raw.len(),
            cfg.bitsize
        )));
    }

    let mut offsets: Vec<u64> = Vec::with_capacity(raw.len() / width);
    for chunk in raw.chunks_exact(width) {
        let v = match width {
            4 => u32::from_le_bytes(chunk.try_into().unwrap()) as u64,
            8 => u64::from_le_bytes(chunk.try_into().unwrap()),
            _ => unreachable!("offset bitsize is validated to 32 or 64"),
        };
        let v = match cfg.mode {
            OffsetsMode::Bytes => v,
            OffsetsMode::Elements => v.checked_mul(elem_size as u64).ok_or_else(|| {
                WriterError::Shape(format!("`{name}`: element offset {v} overflows"))
            })?,
        };
        offsets.push(v);
    }

    if cfg.extra_element {
        let last = offsets.pop().ok_or_else(|| {
            WriterError::Shape(format!(
                "`{name}`: extra-element offsets require at least the sentinel"
            ))
        })?;
        if last != values_size {
            return Err(WriterError::Shape(format!(
                "`{name}`: sentinel offset {last} does not match values size {values_size}"
            )));
        }
    }

    if let Some(&first) = offsets.first() {
        if first != 0 {
            return Err(WriterError::Shape(format!(
                "`{name}`: first offset must be 0, got {first}"
            )));
        }
    }
    for (i, pair) in offsets.windows(2).enumerate() {
        if pair[1] < pair[0] {
            return Err(WriterError::Shape(format!(
                "`{name}`: offsets decrease at cell {}: {} then {}",
                i + 1,
                pair[0],
                pair[1]
            )));
        }
    }
    if let Some(&last) = offsets.last() {
        if last > values_size {
            return Err(WriterError::Shape(format!(
                "`{name}`: offset {last} exceeds values size {values_size}"
            )));
        }
    }
    Ok(offsets)
}

/// Resolved, read-only view of one column used during tile preparation.
/// `values` either borrows the user buffer or a writer-owned split
/// coordinate buffer.
#[derive(Debug, Clone, Copy)]
pub struct ColumnView<'a> {
    pub name: &'a str,
    pub cell_size: usize,
    pub var: bool,
    pub nullable: bool,
    pub values: &'a [u8],
    pub offsets: Option<&'a [u64]>,
    pub validity: Option<&'a [u8]>,
}

impl ColumnView<'_> {
    pub fn cell_num(&self) -> u64 {
        if self.var {
            self.offsets.map(|o| o.len() as u64).unwrap_or(0)
        } else if self.cell_size == 0 {
            0
        } else {
            (self.values.len() / self.cell_size) as u64
        }
    }

    /// The value bytes of cell `i`.
    pub fn cell_bytes(&self, i: usize) -> &[u8] {
        if self.var {
            let offsets = self.offsets.expect("var column without offsets");
            let start = offsets[i] as usize;
            let end = offsets
                .get(i + 1)
                .map(|&o| o as usize)
                .unwrap_or(self.values.len());
            &self.values[start..end]
        } else {
            &self.values[i * self.cell_size..(i + 1) * self.cell_size]
        }
    }

    pub fn validity_byte(&self, i: usize) -> u8 {
        self.validity.map(|v| v[i]).unwrap_or(1)
    }
}
