// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Coordinate preparation for sparse writes: zipped-buffer splitting,
// out-of-bounds checks, global-order sorting and verification, and
// duplicate handling.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::buffer::ColumnView;
use crate::error::{Result, WriterError};
use crate::hilbert;
use crate::schema::{ArraySchema, CellOrder, Dimension};

/// Splits a zipped coordinates buffer into one owned buffer per
/// dimension, in dimension order.
pub fn split_zipped(coords: &[u8], schema: &ArraySchema) -> Result<Vec<Vec<u8>>> {
    let coords_size = schema.coords_size();
    if coords_size == 0 || coords.len() % coords_size != 0 {
        return Err(WriterError::Shape(format!(
            "zipped coordinates size {} is not a multiple of the tuple size {}",
            coords.len(),
            coords_size
        )));
    }
    let cell_num = coords.len() / coords_size;
    let mut out: Vec<Vec<u8>> = schema
        .dimensions
        .iter()
        .map(|d| Vec::with_capacity(cell_num * d.cell_size()))
        .collect();
    let mut pos = 0;
    for _ in 0..cell_num {
        for (d, dim) in schema.dimensions.iter().enumerate() {
            let size = dim.cell_size();
            out[d].extend_from_slice(&coords[pos..pos + size]);
            pos += size;
        }
    }
    Ok(out)
}

/// Per-dimension coordinate views plus the schema pieces the checks
/// need. All views hold the same cell count.
pub struct Coords<'a> {
    pub views: Vec<ColumnView<'a>>,
    pub dims: &'a [Dimension],
    pub order: CellOrder,
}

impl<'a> Coords<'a> {
    pub fn cell_num(&self) -> u64 {
        self.views.first().map(|v| v.cell_num()).unwrap_or(0)
    }

    /// Decodes the coordinate of cell `i` along dimension `d`.
    fn coord(&self, i: usize, d: usize) -> i64 {
        self.dims[d].datatype.decode_int(self.views[d].cell_bytes(i))
    }

    /// Renders cell `i` as `(c0, c1, ...)` for error messages.
    pub fn to_str(&self, i: usize) -> String {
        let parts: Vec<String> = (0..self.dims.len())
            .map(|d| self.coord(i, d).to_string())
            .collect();
        format!("({})", parts.join(", "))
    }

    fn cells_equal(&self, i: usize, j: usize) -> bool {
        (0..self.dims.len()).all(|d| self.coord(i, d) == self.coord(j, d))
    }

    /// Compares two cells in row- or column-major order.
    fn cmp_cells(&self, i: usize, j: usize) -> Ordering {
        let dim_num = self.dims.len();
        for k in 0..dim_num {
            let d = match self.order {
                CellOrder::ColMajor => dim_num - 1 - k,
                _ => k,
            };
            match self.coord(i, d).cmp(&self.coord(j, d)) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }

    /// Fails on the first coordinate outside the array domain.
    pub fn check_oob(&self) -> Result<()> {
        let cell_num = self.cell_num() as usize;
        for i in 0..cell_num {
            for (d, dim) in self.dims.iter().enumerate() {
                let c = self.coord(i, d);
                if c < dim.domain.0 || c > dim.domain.1 {
                    return Err(WriterError::OutOfBounds(format!(
                        "cell {} at {} exceeds domain [{}, {}] on dimension `{}`",
                        i,
                        self.to_str(i),
                        dim.domain.0,
                        dim.domain.1,
                        dim.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Hilbert value of every cell, in input order.
    pub fn hilbert_values(&self) -> Vec<u64> {
        let bits = hilbert::bits_per_dim(self.dims.len());
        let cell_num = self.cell_num() as usize;
        let mut axes = vec![0u64; self.dims.len()];
        let mut out = Vec::with_capacity(cell_num);
        for i in 0..cell_num {
            for (d, dim) in self.dims.iter().enumerate() {
                axes[d] = hilbert::coord_bucket(self.coord(i, d), dim.domain, bits);
            }
            out.push(hilbert::hilbert_index(&axes, bits));
        }
        out
    }

    /// Stable sort of `[0, cells)` by the global cell order. Hilbert
    /// ties break by original input index, so the first occurrence of
    /// equal coordinates stays first.
    pub fn sort(&self) -> Vec<u64> {
        let cell_num = self.cell_num() as usize;
        let mut cell_pos: Vec<u64> = (0..cell_num as u64).collect();
        match self.order {
            CellOrder::Hilbert => {
                let values = self.hilbert_values();
                cell_pos.sort_by(|&a, &b| {
                    values[a as usize]
                        .cmp(&values[b as usize])
                        .then(a.cmp(&b))
                });
            }
            _ => {
                cell_pos.sort_by(|&a, &b| self.cmp_cells(a as usize, b as usize));
            }
        }
        cell_pos
    }

    /// Positions of all-but-first occurrences among sorted cells.
    pub fn compute_dups_sorted(&self, cell_pos: &[u64]) -> HashSet<u64> {
        let mut dups = HashSet::new();
        for w in cell_pos.windows(2) {
            if self.cells_equal(w[0] as usize, w[1] as usize) {
                dups.insert(w[1]);
            }
        }
        dups
    }

    /// Positions of all-but-first occurrences among cells already laid
    /// out in the global order (global-order writes).
    pub fn compute_dups_global(&self) -> HashSet<u64> {
        let cell_num = self.cell_num();
        let mut dups = HashSet::new();
        for i in 1..cell_num {
            if self.cells_equal(i as usize - 1, i as usize) {
                dups.insert(i);
            }
        }
        dups
    }

    /// Errors on the first duplicate among sorted cells.
    pub fn check_dups_sorted(&self, cell_pos: &[u64]) -> Result<()> {
        for w in cell_pos.windows(2) {
            if self.cells_equal(w[0] as usize, w[1] as usize) {
                return Err(WriterError::Duplicate(format!(
                    "coordinates {} appear more than once",
                    self.to_str(w[1] as usize)
                )));
            }
        }
        Ok(())
    }

    /// Errors on the first duplicate among globally ordered cells.
    pub fn check_dups_global(&self) -> Result<()> {
        let cell_num = self.cell_num() as usize;
        for i in 1..cell_num {
            if self.cells_equal(i - 1, i) {
                return Err(WriterError::Duplicate(format!(
                    "coordinates {} appear more than once",
                    self.to_str(i)
                )));
            }
        }
        Ok(())
    }

    /// Verifies that cells are monotonically non-decreasing in the
    /// global order. For Hilbert order the Hilbert values are compared.
    pub fn check_global_order(&self) -> Result<()> {
        let cell_num = self.cell_num() as usize;
        if self.order == CellOrder::Hilbert {
            let values = self.hilbert_values();
            for i in 1..cell_num {
                if values[i] < values[i - 1] {
                    return Err(WriterError::OutOfOrder(format!(
                        "cell {} at {} succeeds {} in Hilbert order",
                        i,
                        self.to_str(i),
                        self.to_str(i - 1)
                    )));
                }
            }
            return Ok(());
        }
        for i in 1..cell_num {
            if self.cmp_cells(i - 1, i) == Ordering::Greater {
                return Err(WriterError::OutOfOrder(format!(
                    "cell {} at {} succeeds {} in the global order",
                    i,
                    self.to_str(i),
                    self.to_str(i - 1)
                )));
            }
        }
        Ok(())
    }
}
