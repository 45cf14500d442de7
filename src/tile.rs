// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Tile staging: cutting re-ordered user cells into fixed-capacity
// tiles. Var-sized columns stage an offsets tile and a values tile with
// shared cell boundaries; nullable columns stage a parallel validity
// tile. Global-order writes carry the trailing partial tile across
// submissions instead of emitting it.

use std::collections::HashSet;

use crate::buffer::ColumnView;

/// An in-memory tile: a byte buffer plus the number of cells staged.
#[derive(Debug, Default, Clone)]
pub struct Tile {
    pub data: Vec<u8>,
    pub cell_num: u64,
}

impl Tile {
    pub fn is_empty(&self) -> bool {
        self.cell_num == 0
    }
}

/// The tile streams of one attribute/dimension for one tile's worth of
/// cells. `main` holds values for fixed-size columns and relative
/// 64-bit offsets for var-sized ones.
#[derive(Debug, Default, Clone)]
pub struct TileGroup {
    pub main: Tile,
    pub var: Option<Tile>,
    pub validity: Option<Tile>,
}

impl TileGroup {
    pub fn new(var: bool, nullable: bool) -> Self {
        Self {
            main: Tile::default(),
            var: var.then(Tile::default),
            validity: nullable.then(Tile::default),
        }
    }

    pub fn cell_num(&self) -> u64 {
        self.main.cell_num
    }

    pub fn is_empty(&self) -> bool {
        self.main.is_empty()
    }

    /// Stages one cell. For var-sized columns the offset of the cell
    /// within the values tile is recorded; offsets restart at 0 in
    /// every tile.
    pub fn push_cell(&mut self, bytes: &[u8], validity: u8) {
        match &mut self.var {
            Some(var_tile) => {
                self.main
                    .data
                    .extend_from_slice(&(var_tile.data.len() as u64).to_le_bytes());
                var_tile.data.extend_from_slice(bytes);
                var_tile.cell_num += 1;
            }
            None => self.main.data.extend_from_slice(bytes),
        }
        self.main.cell_num += 1;
        if let Some(v) = &mut self.validity {
            v.data.push(validity);
            v.cell_num += 1;
        }
    }

    /// Stages `num` unwritten cells carrying the fill value. Fill cells
    /// of nullable columns are staged as null.
    pub fn push_fill_range(&mut self, fill: &[u8], num: u64) {
        for _ in 0..num {
            self.push_cell(fill, 0);
        }
    }
}

/// Cuts the cells selected by `cell_pos` (skipping `dups`) into tiles
/// of up to `capacity` cells. The final tile may be partial; it is
/// emitted like any other. Used by one-shot writes.
pub fn prepare_tiles(
    view: &ColumnView<'_>,
    cell_pos: &[u64],
    dups: &HashSet<u64>,
    capacity: u64,
) -> Vec<TileGroup> {
    let mut out = Vec::new();
    let mut current = TileGroup::new(view.var, view.nullable);
    for &pos in cell_pos {
        if dups.contains(&pos) {
            continue;
        }
        current.push_cell(view.cell_bytes(pos as usize), view.validity_byte(pos as usize));
        if current.cell_num() == capacity {
            out.push(std::mem::replace(
                &mut current,
                TileGroup::new(view.var, view.nullable),
            ));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Consumes cells in buffer order (skipping `dups`), first topping up
/// `last` from the previous submission, and emits only full tiles. The
/// trailing partial tile stays in `last` for the next submission or for
/// the final flush. Used by global-order writes.
pub fn prepare_full_tiles(
    view: &ColumnView<'_>,
    dups: &HashSet<u64>,
    last: &mut TileGroup,
    capacity: u64,
) -> Vec<TileGroup> {
    let mut out = Vec::new();
    let cell_num = view.cell_num();
    for pos in 0..cell_num {
        if dups.contains(&pos) {
            continue;
        }
        last.push_cell(view.cell_bytes(pos as usize), view.validity_byte(pos as usize));
        if last.cell_num() == capacity {
            out.push(std::mem::replace(
                last,
                TileGroup::new(view.var, view.nullable),
            ));
        }
    }
    out
}
