// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Dense tiling: maps a one-range subarray onto the space-tile grid.
// Every intersecting space tile is produced full-shape; cells the
// subarray does not cover are staged with the attribute fill value.

use crate::buffer::ColumnView;
use crate::error::{Result, WriterError};
use crate::schema::{ArraySchema, CellOrder, Layout};
use crate::tile::TileGroup;

#[derive(Debug, Clone)]
struct DimSpan {
    domain_lo: i64,
    extent: u64,
    sub_lo: i64,
    sub_hi: i64,
}

/// Produces the dense tiles covering one subarray, in tile-grid order.
#[derive(Debug)]
pub struct DenseTiler {
    dims: Vec<DimSpan>,
    row_major_cells: bool,
    row_major_query: bool,
    grid_lo: Vec<i64>,
    grid_shape: Vec<u64>,
    sub_shape: Vec<u64>,
    tile_shape: Vec<u64>,
}

impl DenseTiler {
    pub fn new(schema: &ArraySchema, subarray: &[(i64, i64)], layout: Layout) -> Result<Self> {
        if subarray.len() != schema.dim_num() {
            return Err(WriterError::InvalidArgument(format!(
                "subarray has {} ranges for {} dimensions",
                subarray.len(),
                schema.dim_num()
            )));
        }
        let row_major_query = match layout {
            Layout::RowMajor | Layout::GlobalOrder => true,
            Layout::ColMajor => false,
            Layout::Unordered => {
                return Err(WriterError::InvalidArgument(
                    "dense tiling requires an ordered layout".to_string(),
                ))
            }
        };

        let mut dims = Vec::with_capacity(schema.dim_num());
        let mut grid_lo = Vec::new();
        let mut grid_shape = Vec::new();
        let mut sub_shape = Vec::new();
        let mut tile_shape = Vec::new();
        for (dim, &(lo, hi)) in schema.dimensions.iter().zip(subarray.iter()) {
            if lo > hi {
                return Err(WriterError::InvalidArgument(format!(
                    "subarray range [{lo}, {hi}] on dimension `{}` is empty",
                    dim.name
                )));
            }
            if lo < dim.domain.0 || hi > dim.domain.1 {
                return Err(WriterError::OutOfBounds(format!(
                    "subarray range [{lo}, {hi}] exceeds domain [{}, {}] on dimension `{}`",
                    dim.domain.0, dim.domain.1, dim.name
                )));
            }
            let extent = dim.tile_extent.unwrap_or(1);
            let g_lo = (lo - dim.domain.0).div_euclid(extent as i64);
            let g_hi = (hi - dim.domain.0).div_euclid(extent as i64);
            grid_lo.push(g_lo);
            grid_shape.push((g_hi - g_lo + 1) as u64);
            sub_shape.push((hi - lo + 1) as u64);
            tile_shape.push(extent);
            dims.push(DimSpan {
                domain_lo: dim.domain.0,
                extent,
                sub_lo: lo,
                sub_hi: hi,
            });
        }

        Ok(Self {
            dims,
            row_major_cells: schema.cell_order == CellOrder::RowMajor,
            row_major_query,
            grid_lo,
            grid_shape,
            sub_shape,
            tile_shape,
        })
    }

    pub fn tile_num(&self) -> u64 {
        self.grid_shape.iter().product()
    }

    pub fn cells_per_tile(&self) -> u64 {
        self.tile_shape.iter().product()
    }

    pub fn subarray_cell_num(&self) -> u64 {
        self.sub_shape.iter().product()
    }

    /// Region of tile `t` clipped to the subarray, per dimension.
    pub fn tile_mbr(&self, t: u64) -> Vec<(i64, i64)> {
        let grid = delinearize(t, &self.grid_shape, self.row_major_cells);
        self.dims
            .iter()
            .zip(grid.iter())
            .zip(self.grid_lo.iter())
            .map(|((dim, &g), &g_lo)| {
                let tile_lo = dim.domain_lo + (g_lo + g as i64) * dim.extent as i64;
                let tile_hi = tile_lo + dim.extent as i64 - 1;
                (tile_lo.max(dim.sub_lo), tile_hi.min(dim.sub_hi))
            })
            .collect()
    }

    /// Stages tile `t` for one column: covered cells are copied from
    /// the user buffer, the rest carry the fill value.
    pub fn prepare(&self, t: u64, view: &ColumnView<'_>, fill: &[u8]) -> TileGroup {
        let grid = delinearize(t, &self.grid_shape, self.row_major_cells);
        let dim_num = self.dims.len();

        // Global coordinate of the tile's first cell per dimension.
        let tile_origin: Vec<i64> = self
            .dims
            .iter()
            .zip(grid.iter())
            .zip(self.grid_lo.iter())
            .map(|((dim, &g), &g_lo)| dim.domain_lo + (g_lo + g as i64) * dim.extent as i64)
            .collect();

        let mut group = TileGroup::new(view.var, view.nullable);
        let mut sub_idx = vec![0u64; dim_num];
        for c in 0..self.cells_per_tile() {
            let local = delinearize(c, &self.tile_shape, self.row_major_cells);
            let mut covered = true;
            for d in 0..dim_num {
                let x = tile_origin[d] + local[d] as i64;
                if x < self.dims[d].sub_lo || x > self.dims[d].sub_hi {
                    covered = false;
                    break;
                }
                sub_idx[d] = (x - self.dims[d].sub_lo) as u64;
            }
            if covered {
                let src = linearize(&sub_idx, &self.sub_shape, self.row_major_query) as usize;
                group.push_cell(view.cell_bytes(src), view.validity_byte(src));
            } else {
                group.push_cell(fill, 0);
            }
        }
        group
    }
}

/// Whether a subarray starts and ends on space-tile boundaries on every
/// dimension. Global-order dense writes require this.
pub fn subarray_tile_aligned(schema: &ArraySchema, subarray: &[(i64, i64)]) -> bool {
    schema
        .dimensions
        .iter()
        .zip(subarray.iter())
        .all(|(dim, &(lo, hi))| {
            let extent = dim.tile_extent.unwrap_or(1) as i64;
            (lo - dim.domain.0).rem_euclid(extent) == 0
                && (hi - dim.domain.0 + 1).rem_euclid(extent) == 0
        })
}

fn linearize(idx: &[u64], shape: &[u64], row_major: bool) -> u64 {
    let mut out = 0u64;
    if row_major {
        for (i, s) in idx.iter().zip(shape.iter()) {
            out = out * s + i;
        }
    } else {
        for (i, s) in idx.iter().zip(shape.iter()).rev() {
            out = out * s + i;
        }
    }
    out
}

fn delinearize(mut t: u64, shape: &[u64], row_major: bool) -> Vec<u64> {
    let mut out = vec![0u64; shape.len()];
    if row_major {
        for d in (0..shape.len()).rev() {
            out[d] = t % shape[d];
            t /= shape[d];
        }
    } else {
        for d in 0..shape.len() {
            out[d] = t % shape[d];
            t /= shape[d];
        }
    }
    out
}
