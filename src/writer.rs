// SPDX-License-Identifier: AGPL-3.0-or-later
//
// The writer: binds user buffers, sequences the three write modes and
// owns the fragment lifecycle. A fragment becomes visible only when its
// commit marker lands; every error past validation removes the partial
// fragment.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rayon::prelude::*;

use crate::buffer::{normalize_offsets, ColumnView, OffsetsConfig, OffsetsMode, QueryBuffer};
use crate::coords::{split_zipped, Coords};
use crate::dense::{subarray_tile_aligned, DenseTiler};
use crate::error::{Result, WriterError};
use crate::filter::{FilterPipeline, Passthrough, TileKind};
use crate::meta::{
    fragment_name, mbrs_from_dim_tiles, FragmentMetadata, WrittenFragmentInfo, METADATA_FILE,
};
use crate::schema::{ArraySchema, Layout, COORDS};
use crate::storage::StorageManager;
use crate::tile::{prepare_full_tiles, prepare_tiles, TileGroup};

static PASSTHROUGH: Passthrough = Passthrough;

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Query-level knobs recognized by `Writer::set_config`.
#[derive(Debug, Clone)]
pub struct WriterOptions {
    /// Raise on duplicate coordinates (sparse writes).
    pub check_coord_dups: bool,
    /// Drop duplicate coordinates instead of raising; wins over
    /// `check_coord_dups`.
    pub dedup_coords: bool,
    /// Raise on coordinates outside the array domain.
    pub check_coord_oob: bool,
    /// Verify monotonicity of coordinates in global-order writes.
    pub check_global_order: bool,
    /// Interpretation of user offset buffers.
    pub offsets: OffsetsConfig,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            check_coord_dups: true,
            dedup_coords: false,
            check_coord_oob: true,
            check_global_order: true,
            offsets: OffsetsConfig::default(),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(WriterError::InvalidArgument(format!(
            "`{key}` expects true or false, got `{value}`"
        ))),
    }
}

impl WriterOptions {
    /// Applies one key/value pair. Unknown keys and malformed values
    /// are rejected.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "check_coord_dups" => self.check_coord_dups = parse_bool(key, value)?,
            "dedup_coords" => self.dedup_coords = parse_bool(key, value)?,
            "check_coord_oob" => self.check_coord_oob = parse_bool(key, value)?,
            "disable_check_global_order" => self.check_global_order = !parse_bool(key, value)?,
            "offsets_extra_element" => self.offsets.extra_element = parse_bool(key, value)?,
            "offsets_format_mode" => {
                self.offsets.mode = match value {
                    "bytes" => OffsetsMode::Bytes,
                    "elements" => OffsetsMode::Elements,
                    _ => {
                        return Err(WriterError::InvalidArgument(format!(
                            "`{key}` expects bytes or elements, got `{value}`"
                        )))
                    }
                }
            }
            "offsets_bitsize" => {
                self.offsets.bitsize = match value {
                    "32" => 32,
                    "64" => 64,
                    _ => {
                        return Err(WriterError::InvalidArgument(format!(
                            "`{key}` expects 32 or 64, got `{value}`"
                        )))
                    }
                }
            }
            _ => {
                return Err(WriterError::InvalidArgument(format!(
                    "unrecognized config option `{key}`"
                )))
            }
        }
        Ok(())
    }
}

/// Counters exposed through `Writer::stats`.
#[derive(Debug, Default, Clone, Copy)]
pub struct WriterStats {
    pub write_num: u64,
    pub cells_written: u64,
    pub dups_dropped: u64,
    pub tiles_written: u64,
    pub bytes_written: u64,
}

/// Scratch carried across global-order submissions until `finalize`.
#[derive(Debug)]
struct GlobalWriteState {
    dir: PathBuf,
    /// Trailing partial tile per attribute/dimension.
    last_tiles: HashMap<String, TileGroup>,
    /// Cells accepted so far per attribute/dimension.
    cells_written: HashMap<String, u64>,
    meta: FragmentMetadata,
}

/// Writer lifecycle. The global-write scratch only exists in
/// `GlobalOpen`, so access to it is enforced by construction.
#[derive(Debug)]
enum WriterState {
    Uninit,
    Ready,
    GlobalOpen(Box<GlobalWriteState>),
    Committed,
    Failed,
}

#[derive(Debug, Clone)]
struct FieldSpec {
    name: String,
    cell_size: usize,
    var: bool,
    nullable: bool,
    is_dim: bool,
}

/// One tile's filtered streams, ready for appending.
struct FilteredGroup {
    main: Vec<u8>,
    var: Option<Vec<u8>>,
    validity: Option<Vec<u8>>,
}

/// Processes write queries against one array.
///
/// The writer borrows the schema, the storage handle and the user
/// buffers; its lifetime is bounded by the caller-level query object.
/// A single writer is one logical actor: it is not meant to be shared
/// across threads, although each `write` fans tile work out internally.
pub struct Writer<'a> {
    schema: &'a ArraySchema,
    storage: &'a StorageManager,
    options: WriterOptions,
    layout: Layout,
    state: WriterState,
    buffers: HashMap<String, QueryBuffer<'a>>,
    subarray: Option<Vec<(i64, i64)>>,
    pipelines: HashMap<(String, TileKind), Box<dyn FilterPipeline>>,
    written: Vec<WrittenFragmentInfo>,
    stats: WriterStats,
}

impl<'a> Writer<'a> {
    pub fn new(schema: &'a ArraySchema, storage: &'a StorageManager) -> Self {
        Self {
            schema,
            storage,
            options: WriterOptions::default(),
            layout: Layout::Unordered,
            state: WriterState::Uninit,
            buffers: HashMap::new(),
            subarray: None,
            pipelines: HashMap::new(),
            written: Vec::new(),
            stats: WriterStats::default(),
        }
    }

    pub fn schema(&self) -> &ArraySchema {
        self.schema
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    pub fn written_fragment_info(&self) -> &[WrittenFragmentInfo] {
        &self.written
    }

    pub fn buffer(&self, name: &str) -> Option<&QueryBuffer<'a>> {
        self.buffers.get(name)
    }

    pub fn buffer_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buffers.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Stores the layout without validating it; `init` validates.
    pub fn set_layout(&mut self, layout: Layout) -> Result<()> {
        if matches!(self.state, WriterState::GlobalOpen(_)) {
            return Err(WriterError::State("layout change during an open global write"));
        }
        self.layout = layout;
        Ok(())
    }

    /// Validates the layout against the array type and readies the
    /// writer. One-dimensional ordered layouts are calibrated to
    /// row-major, which is the cell order expressed in 1D.
    pub fn init(&mut self, layout: Layout) -> Result<()> {
        if matches!(self.state, WriterState::GlobalOpen(_)) {
            return Err(WriterError::State("init during an open global write"));
        }
        match layout {
            Layout::RowMajor | Layout::ColMajor if !self.schema.dense() => {
                return Err(WriterError::InvalidArgument(
                    "ordered writes apply to dense arrays only".to_string(),
                ))
            }
            Layout::Unordered if self.schema.dense() => {
                return Err(WriterError::InvalidArgument(
                    "unordered writes apply to sparse arrays only".to_string(),
                ))
            }
            _ => {}
        }
        self.layout = layout;
        if self.schema.dim_num() == 1 && matches!(layout, Layout::ColMajor) {
            log::debug!("calibrating 1D column-major layout to row-major");
            self.layout = Layout::RowMajor;
        }
        self.state = WriterState::Ready;
        Ok(())
    }

    pub fn set_config(&mut self, key: &str, value: &str) -> Result<()> {
        if key.starts_with("offsets_")
            && self.buffers.values().any(|b| b.offsets.is_some())
        {
            return Err(WriterError::State(
                "offsets configuration must precede var-sized buffer bindings",
            ));
        }
        self.options.set(key, value)
    }

    pub fn set_check_coord_dups(&mut self, b: bool) {
        self.options.check_coord_dups = b;
    }

    pub fn set_check_coord_oob(&mut self, b: bool) {
        self.options.check_coord_oob = b;
    }

    pub fn set_dedup_coords(&mut self, b: bool) {
        self.options.dedup_coords = b;
    }

    /// Skips the monotonicity check in global-order writes. Supersedes
    /// the config.
    pub fn disable_check_global_order(&mut self) {
        self.options.check_global_order = false;
    }

    /// Installs the filter pipeline for one tile stream of one
    /// attribute/dimension. Streams without an installed pipeline pass
    /// bytes through unchanged.
    pub fn set_filter_pipeline(
        &mut self,
        name: &str,
        kind: TileKind,
        pipeline: Box<dyn FilterPipeline>,
    ) -> Result<()> {
        if !self.schema.is_attr(name) && !self.schema.is_dim(name) {
            return Err(WriterError::InvalidArgument(format!(
                "unknown attribute/dimension `{name}`"
            )));
        }
        self.pipelines.insert((name.to_string(), kind), pipeline);
        Ok(())
    }

    /// Sets the one N-dimensional range a dense write covers.
    pub fn set_subarray(&mut self, subarray: Vec<(i64, i64)>) -> Result<()> {
        if !self.schema.dense() {
            return Err(WriterError::InvalidArgument(
                "subarrays apply to dense arrays only".to_string(),
            ));
        }
        if subarray.len() != self.schema.dim_num() {
            return Err(WriterError::InvalidArgument(format!(
                "subarray has {} ranges for {} dimensions",
                subarray.len(),
                self.schema.dim_num()
            )));
        }
        self.subarray = Some(subarray);
        Ok(())
    }

    /// Replaces the range of one dimension, starting from the full
    /// domain when no subarray is set yet.
    pub fn add_range(&mut self, dim_idx: usize, range: (i64, i64)) -> Result<()> {
        if !self.schema.dense() {
            return Err(WriterError::InvalidArgument(
                "subarrays apply to dense arrays only".to_string(),
            ));
        }
        if dim_idx >= self.schema.dim_num() {
            return Err(WriterError::InvalidArgument(format!(
                "dimension index {dim_idx} out of range"
            )));
        }
        let sub = self.subarray.get_or_insert_with(|| {
            self.schema.dimensions.iter().map(|d| d.domain).collect()
        });
        sub[dim_idx] = range;
        Ok(())
    }

    /// Binds a fixed-size attribute/dimension buffer, or the zipped
    /// coordinates buffer under the reserved name.
    pub fn set_buffer(&mut self, name: &str, values: &'a [u8]) -> Result<()> {
        self.bind(name, None, values, None)
    }

    /// Binds a var-sized attribute: user offsets plus values.
    pub fn set_buffer_var(
        &mut self,
        name: &str,
        offsets: &'a [u8],
        values: &'a [u8],
    ) -> Result<()> {
        self.bind(name, Some(offsets), values, None)
    }

    /// Binds a fixed-size nullable attribute: values plus one validity
    /// byte per cell.
    pub fn set_buffer_nullable(
        &mut self,
        name: &str,
        values: &'a [u8],
        validity: &'a [u8],
    ) -> Result<()> {
        self.bind(name, None, values, Some(validity))
    }

    /// Binds a var-sized nullable attribute.
    pub fn set_buffer_var_nullable(
        &mut self,
        name: &str,
        offsets: &'a [u8],
        values: &'a [u8],
        validity: &'a [u8],
    ) -> Result<()> {
        self.bind(name, Some(offsets), values, Some(validity))
    }

    fn bind(
        &mut self,
        name: &str,
        offsets: Option<&'a [u8]>,
        values: &'a [u8],
        validity: Option<&'a [u8]>,
    ) -> Result<()> {
        if name == COORDS {
            if offsets.is_some() || validity.is_some() {
                return Err(WriterError::InvalidArgument(
                    "zipped coordinates are fixed-size and non-nullable".to_string(),
                ));
            }
            if self.schema.dimensions.iter().any(|d| self.buffers.contains_key(&d.name)) {
                return Err(WriterError::InvalidArgument(
                    "zipped and per-dimension coordinate buffers are mutually exclusive"
                        .to_string(),
                ));
            }
            let coords_size = self.schema.coords_size();
            if values.len() % coords_size != 0 {
                return Err(WriterError::Shape(format!(
                    "zipped coordinates size {} is not a multiple of the tuple size {coords_size}",
                    values.len()
                )));
            }
            self.buffers.insert(name.to_string(), QueryBuffer::fixed(values));
            return Ok(());
        }

        if let Some(dim) = self.schema.dimension(name) {
            if offsets.is_some() || validity.is_some() {
                return Err(WriterError::InvalidArgument(format!(
                    "dimension `{name}` is fixed-size and non-nullable"
                )));
            }
            if self.buffers.contains_key(COORDS) {
                return Err(WriterError::InvalidArgument(
                    "zipped and per-dimension coordinate buffers are mutually exclusive"
                        .to_string(),
                ));
            }
            let cell_size = dim.cell_size();
            if values.len() % cell_size != 0 {
                return Err(WriterError::Shape(format!(
                    "`{name}`: values size {} is not a multiple of the cell size {cell_size}",
                    values.len()
                )));
            }
            self.buffers.insert(name.to_string(), QueryBuffer::fixed(values));
            return Ok(());
        }

        let attr = self.schema.attribute(name).ok_or_else(|| {
            WriterError::InvalidArgument(format!("unknown attribute/dimension `{name}`"))
        })?;
        if attr.var_sized != offsets.is_some() {
            return Err(WriterError::InvalidArgument(format!(
                "attribute `{name}` is {}var-sized",
                if attr.var_sized { "" } else { "not " }
            )));
        }
        if attr.nullable != validity.is_some() {
            return Err(WriterError::InvalidArgument(format!(
                "attribute `{name}` is {}nullable",
                if attr.nullable { "" } else { "not " }
            )));
        }

        let cell_size = attr.cell_size();
        let mut qb = QueryBuffer::fixed(values);
        let cell_num = match offsets {
            Some(raw) => {
                let canonical = normalize_offsets(
                    name,
                    raw,
                    self.options.offsets,
                    cell_size,
                    values.len() as u64,
                )?;
                let n = canonical.len() as u64;
                qb = qb.with_offsets(canonical);
                n
            }
            None => {
                if values.len() % cell_size != 0 {
                    return Err(WriterError::Shape(format!(
                        "`{name}`: values size {} is not a multiple of the cell size {cell_size}",
                        values.len()
                    )));
                }
                (values.len() / cell_size) as u64
            }
        };
        if let Some(v) = validity {
            if v.len() as u64 != cell_num {
                return Err(WriterError::Shape(format!(
                    "`{name}`: validity size {} does not match cell count {cell_num}",
                    v.len()
                )));
            }
            qb = qb.with_validity(v);
        }
        self.buffers.insert(name.to_string(), qb);
        Ok(())
    }

    /// Performs a write using the bound buffers. Global-order writes
    /// may be repeated until `finalize`; with `dedup_coords` enabled,
    /// duplicates are dropped within each submission (an equal-
    /// coordinate run split across submissions is kept).
    pub fn write(&mut self) -> Result<()> {
        let result = match (&self.state, self.layout) {
            (WriterState::Uninit, _) => Err(WriterError::State("write before init")),
            (WriterState::Committed, _) => {
                Err(WriterError::State("write after commit; reset first"))
            }
            (WriterState::Failed, _) => {
                Err(WriterError::State("write after failure; reset first"))
            }
            (WriterState::GlobalOpen(_), Layout::GlobalOrder)
            | (WriterState::Ready, Layout::GlobalOrder) => self.global_write(),
            (WriterState::GlobalOpen(_), _) => {
                Err(WriterError::State("non-global write during an open global write"))
            }
            (WriterState::Ready, Layout::RowMajor | Layout::ColMajor) => self.ordered_write(),
            (WriterState::Ready, Layout::Unordered) => self.unordered_write(),
        };
        if let Err(e) = &result {
            if data_error(e) {
                self.abort();
            }
        } else {
            self.stats.write_num += 1;
        }
        result
    }

    /// Finalizes a global-order write cycle: flushes the carried last
    /// tiles, writes the footer and commits. A no-op outside global
    /// mode.
    pub fn finalize(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, WriterState::Failed) {
            WriterState::GlobalOpen(st) => {
                let dir = st.dir.clone();
                match self.finalize_global_write_state(*st) {
                    Ok(info) => {
                        self.written.push(info);
                        self.state = WriterState::Committed;
                        Ok(())
                    }
                    Err(e) => {
                        self.storage.nuke(&dir);
                        Err(e)
                    }
                }
            }
            WriterState::Ready => {
                self.state = WriterState::Ready;
                Ok(())
            }
            WriterState::Committed => {
                self.state = WriterState::Committed;
                Ok(())
            }
            WriterState::Uninit => {
                self.state = WriterState::Uninit;
                Err(WriterError::State("finalize before init"))
            }
            WriterState::Failed => Err(WriterError::State("finalize after failure; reset first")),
        }
    }

    /// Returns the writer to `Ready`, nuking any open global fragment.
    /// Buffer bindings and options survive a reset.
    pub fn reset(&mut self) {
        match std::mem::replace(&mut self.state, WriterState::Ready) {
            WriterState::GlobalOpen(st) => self.storage.nuke(&st.dir),
            WriterState::Uninit => self.state = WriterState::Uninit,
            _ => {}
        }
    }

    fn abort(&mut self) {
        if let WriterState::GlobalOpen(st) =
            std::mem::replace(&mut self.state, WriterState::Failed)
        {
            self.storage.nuke(&st.dir);
        }
    }

    // ---- mode drivers ----

    fn unordered_write(&mut self) -> Result<()> {
        let split = self.split_coords()?;
        self.require_coords(&split)?;
        let cell_num = self.check_buffer_sizes(&split)?;

        let coords = self.coords_views(&split)?;
        if self.options.check_coord_oob {
            coords.check_oob()?;
        }
        let cell_pos = coords.sort();
        let dups = if self.options.dedup_coords {
            coords.compute_dups_sorted(&cell_pos)
        } else {
            if self.options.check_coord_dups {
                coords.check_dups_sorted(&cell_pos)?;
            }
            HashSet::new()
        };

        let specs = self.field_specs(true);
        let capacity = self.schema.capacity;
        let prepared: Vec<(FieldSpec, Vec<TileGroup>)> = {
            let split_ref = &split;
            let pos_ref = &cell_pos;
            let dups_ref = &dups;
            specs
                .par_iter()
                .map(|spec| {
                    let view = self.column_view(spec, split_ref)?;
                    Ok((spec.clone(), prepare_tiles(&view, pos_ref, dups_ref, capacity)))
                })
                .collect::<Result<_>>()?
        };

        let timestamp = now_millis();
        let mut meta = FragmentMetadata::new(false, self.schema.dim_num(), timestamp);
        for mbr in self.sparse_mbrs(&prepared) {
            meta.push_mbr(mbr);
        }
        meta.add_cells(cell_num - dups.len() as u64);

        let filtered = self.filter_all(prepared)?;
        self.persist_fragment(meta, filtered, dups.len() as u64)
    }

    fn ordered_write(&mut self) -> Result<()> {
        let subarray = self.subarray.clone().ok_or_else(|| {
            WriterError::InvalidArgument("dense ordered writes require a subarray".to_string())
        })?;
        if self.buffers.contains_key(COORDS)
            || self.schema.dimensions.iter().any(|d| self.buffers.contains_key(&d.name))
        {
            return Err(WriterError::InvalidArgument(
                "dense ordered writes take no coordinate buffers".to_string(),
            ));
        }
        let split = HashMap::new();
        let cell_num = self.check_buffer_sizes(&split)?;
        let tiler = DenseTiler::new(self.schema, &subarray, self.layout)?;
        if cell_num != tiler.subarray_cell_num() {
            return Err(WriterError::Shape(format!(
                "buffers hold {cell_num} cells but the subarray covers {}",
                tiler.subarray_cell_num()
            )));
        }

        let specs = self.field_specs(false);
        let tile_num = tiler.tile_num();
        let prepared: Vec<(FieldSpec, Vec<TileGroup>)> = {
            let tiler_ref = &tiler;
            let split_ref = &split;
            specs
                .par_iter()
                .map(|spec| {
                    let view = self.column_view(spec, split_ref)?;
                    let fill = &self.schema.attribute(&spec.name).unwrap().fill_value;
                    let tiles = (0..tile_num)
                        .map(|t| tiler_ref.prepare(t, &view, fill))
                        .collect();
                    Ok((spec.clone(), tiles))
                })
                .collect::<Result<_>>()?
        };

        let timestamp = now_millis();
        let mut meta = FragmentMetadata::new(true, self.schema.dim_num(), timestamp);
        for t in 0..tile_num {
            meta.push_mbr(tiler.tile_mbr(t));
        }
        meta.add_cells(cell_num);

        let filtered = self.filter_all(prepared)?;
        self.persist_fragment(meta, filtered, 0)
    }

    fn global_write(&mut self) -> Result<()> {
        let sparse = !self.schema.dense();
        let split = self.split_coords()?;
        if sparse {
            self.require_coords(&split)?;
        } else if self.buffers.contains_key(COORDS)
            || self.schema.dimensions.iter().any(|d| self.buffers.contains_key(&d.name))
        {
            return Err(WriterError::InvalidArgument(
                "dense global writes take no coordinate buffers".to_string(),
            ));
        }
        let cell_num = self.check_buffer_sizes(&split)?;

        let capacity = if sparse {
            self.schema.capacity
        } else {
            self.schema.cells_per_tile()
        };
        let subarray = self.global_dense_subarray()?;
        if !sparse && cell_num % capacity != 0 {
            return Err(WriterError::Shape(format!(
                "dense global submissions must be whole tiles: {cell_num} cells for \
                 {capacity}-cell tiles"
            )));
        }

        let mut dups = HashSet::new();
        if sparse {
            let coords = self.coords_views(&split)?;
            if self.options.check_coord_oob {
                coords.check_oob()?;
            }
            if self.options.check_global_order {
                coords.check_global_order()?;
            }
            if self.options.dedup_coords {
                dups = coords.compute_dups_global();
            } else if self.options.check_coord_dups {
                coords.check_dups_global()?;
            }
        }

        // Validation is done; open the fragment on the first call.
        let mut st = match std::mem::replace(&mut self.state, WriterState::Failed) {
            WriterState::GlobalOpen(st) => st,
            WriterState::Ready => Box::new(self.init_global_write_state()?),
            _ => unreachable!("guarded by write()"),
        };

        match self.global_write_into(&mut st, &split, &dups, capacity, subarray.as_deref()) {
            Ok(accepted) => {
                self.stats.cells_written += accepted;
                self.stats.dups_dropped += dups.len() as u64;
                self.state = WriterState::GlobalOpen(st);
                Ok(())
            }
            Err(e) => {
                self.storage.nuke(&st.dir);
                Err(e)
            }
        }
    }

    fn global_write_into(
        &mut self,
        st: &mut GlobalWriteState,
        split: &HashMap<String, Vec<u8>>,
        dups: &HashSet<u64>,
        capacity: u64,
        subarray: Option<&[(i64, i64)]>,
    ) -> Result<u64> {
        let sparse = !self.schema.dense();
        let specs = self.field_specs(sparse);

        // Top up the carried last tiles and emit only full tiles.
        let mut prepared: Vec<(FieldSpec, Vec<TileGroup>)> = Vec::with_capacity(specs.len());
        let mut accepted = 0u64;
        for spec in &specs {
            let view = self.column_view(spec, split)?;
            let mut last = st
                .last_tiles
                .remove(&spec.name)
                .unwrap_or_else(|| TileGroup::new(spec.var, spec.nullable));
            let full = prepare_full_tiles(&view, dups, &mut last, capacity);
            accepted = view.cell_num() - dups.len() as u64;
            *st.cells_written.entry(spec.name.clone()).or_insert(0) += accepted;
            st.last_tiles.insert(spec.name.clone(), last);
            prepared.push((spec.clone(), full));
        }

        if sparse {
            for mbr in self.sparse_mbrs(&prepared) {
                st.meta.push_mbr(mbr);
            }
        } else if let Some(sub) = subarray {
            let tiler = DenseTiler::new(self.schema, sub, Layout::GlobalOrder)?;
            let emitted = prepared.first().map(|(_, t)| t.len() as u64).unwrap_or(0);
            let base = st.meta.tile_num;
            for t in 0..emitted {
                st.meta.push_mbr(tiler.tile_mbr(base + t));
            }
        }
        st.meta.add_cells(accepted);

        let filtered = self.filter_all(prepared)?;
        let dir = st.dir.clone();
        self.write_all_tiles(&dir, filtered, &mut st.meta)?;
        Ok(accepted)
    }

    fn init_global_write_state(&self) -> Result<GlobalWriteState> {
        let timestamp = now_millis();
        let fragment = fragment_name(timestamp, timestamp);
        let dir = self.storage.create_fragment(&fragment)?;
        log::debug!("opened global write fragment {fragment}");
        Ok(GlobalWriteState {
            dir,
            last_tiles: HashMap::new(),
            cells_written: HashMap::new(),
            meta: FragmentMetadata::new(self.schema.dense(), self.schema.dim_num(), timestamp),
        })
    }

    fn finalize_global_write_state(
        &mut self,
        mut st: GlobalWriteState,
    ) -> Result<WrittenFragmentInfo> {
        let sparse = !self.schema.dense();
        let specs = self.field_specs(sparse);

        // Flush the residual tiles regardless of fullness.
        let mut prepared: Vec<(FieldSpec, Vec<TileGroup>)> = Vec::with_capacity(specs.len());
        let mut residual = 0u64;
        for spec in &specs {
            let last = st
                .last_tiles
                .remove(&spec.name)
                .unwrap_or_else(|| TileGroup::new(spec.var, spec.nullable));
            residual = last.cell_num();
            prepared.push((spec.clone(), if last.is_empty() { Vec::new() } else { vec![last] }));
        }
        if residual > 0 {
            if sparse {
                for mbr in self.sparse_mbrs(&prepared) {
                    st.meta.push_mbr(mbr);
                }
            }
            let filtered = self.filter_all(prepared)?;
            let dir = st.dir.clone();
            self.write_all_tiles(&dir, filtered, &mut st.meta)?;
        }

        st.meta.timestamp_range.1 = now_millis().max(st.meta.timestamp_range.0);
        self.storage
            .write_file(&st.dir, METADATA_FILE, &st.meta.serialize())?;
        self.storage.commit(&st.dir)?;
        Ok(WrittenFragmentInfo {
            uri: st.dir,
            timestamp_range: st.meta.timestamp_range,
        })
    }

    // ---- shared plumbing ----

    /// Attributes in schema order, then dimensions when the write
    /// carries coordinates.
    fn field_specs(&self, include_dims: bool) -> Vec<FieldSpec> {
        let mut out: Vec<FieldSpec> = self
            .schema
            .attributes
            .iter()
            .map(|a| FieldSpec {
                name: a.name.clone(),
                cell_size: a.cell_size(),
                var: a.var_sized,
                nullable: a.nullable,
                is_dim: false,
            })
            .collect();
        if include_dims {
            out.extend(self.schema.dimensions.iter().map(|d| FieldSpec {
                name: d.name.clone(),
                cell_size: d.cell_size(),
                var: false,
                nullable: false,
                is_dim: true,
            }));
        }
        out
    }

    fn split_coords(&self) -> Result<HashMap<String, Vec<u8>>> {
        let mut out = HashMap::new();
        if let Some(qb) = self.buffers.get(COORDS) {
            let split = split_zipped(qb.values, self.schema)?;
            for (dim, buf) in self.schema.dimensions.iter().zip(split) {
                out.insert(dim.name.clone(), buf);
            }
        }
        Ok(out)
    }

    /// Sparse writes need every dimension bound, either zipped or one
    /// buffer per dimension.
    fn require_coords(&self, split: &HashMap<String, Vec<u8>>) -> Result<()> {
        let bound = self
            .schema
            .dimensions
            .iter()
            .filter(|d| self.buffers.contains_key(&d.name) || split.contains_key(&d.name))
            .count();
        if bound == self.schema.dim_num() {
            return Ok(());
        }
        if bound == 0 {
            return Err(WriterError::InvalidArgument(
                "sparse writes require explicit coordinates".to_string(),
            ));
        }
        Err(WriterError::InvalidArgument(format!(
            "coordinates bound for {bound} of {} dimensions",
            self.schema.dim_num()
        )))
    }

    fn column_view<'s>(
        &'s self,
        spec: &'s FieldSpec,
        split: &'s HashMap<String, Vec<u8>>,
    ) -> Result<ColumnView<'s>> {
        if let Some(qb) = self.buffers.get(&spec.name) {
            return Ok(ColumnView {
                name: &spec.name,
                cell_size: spec.cell_size,
                var: spec.var,
                nullable: spec.nullable,
                values: qb.values,
                offsets: qb.offsets.as_deref(),
                validity: qb.validity,
            });
        }
        if let Some(buf) = split.get(&spec.name) {
            return Ok(ColumnView {
                name: &spec.name,
                cell_size: spec.cell_size,
                var: false,
                nullable: false,
                values: buf,
                offsets: None,
                validity: None,
            });
        }
        Err(WriterError::InvalidArgument(format!(
            "no buffer bound for `{}`",
            spec.name
        )))
    }

    fn coords_views<'s>(
        &'s self,
        split: &'s HashMap<String, Vec<u8>>,
    ) -> Result<Coords<'s>> {
        let mut views = Vec::with_capacity(self.schema.dim_num());
        for dim in &self.schema.dimensions {
            let values: &[u8] = match self.buffers.get(&dim.name) {
                Some(qb) => qb.values,
                None => split.get(&dim.name).ok_or_else(|| {
                    WriterError::InvalidArgument(format!(
                        "no coordinate buffer bound for `{}`",
                        dim.name
                    ))
                })?,
            };
            views.push(ColumnView {
                name: &dim.name,
                cell_size: dim.cell_size(),
                var: false,
                nullable: false,
                values,
                offsets: None,
                validity: None,
            });
        }
        Ok(Coords {
            views,
            dims: &self.schema.dimensions,
            order: self.schema.cell_order,
        })
    }

    /// Verifies that every attribute is bound and that every bound
    /// buffer derives the same cell count.
    fn check_buffer_sizes(&self, split: &HashMap<String, Vec<u8>>) -> Result<u64> {
        let mut counts: Vec<(String, u64)> = Vec::new();
        for attr in &self.schema.attributes {
            let qb = self.buffers.get(&attr.name).ok_or_else(|| {
                WriterError::InvalidArgument(format!(
                    "attribute `{}` has no buffer bound",
                    attr.name
                ))
            })?;
            let n = match &qb.offsets {
                Some(offsets) => offsets.len() as u64,
                None => (qb.values.len() / attr.cell_size()) as u64,
            };
            counts.push((attr.name.clone(), n));
        }
        if let Some(qb) = self.buffers.get(COORDS) {
            counts.push((
                COORDS.to_string(),
                (qb.values.len() / self.schema.coords_size()) as u64,
            ));
        }
        for dim in &self.schema.dimensions {
            if let Some(qb) = self.buffers.get(&dim.name) {
                counts.push((dim.name.clone(), (qb.values.len() / dim.cell_size()) as u64));
            } else if let Some(buf) = split.get(&dim.name) {
                counts.push((dim.name.clone(), (buf.len() / dim.cell_size()) as u64));
            }
        }

        let cell_num = counts.first().map(|(_, n)| *n).unwrap_or(0);
        for (name, n) in &counts {
            if *n != cell_num {
                return Err(WriterError::Shape(format!(
                    "`{name}` holds {n} cells but `{}` holds {cell_num}",
                    counts[0].0
                )));
            }
        }
        Ok(cell_num)
    }

    /// For dense global writes: the effective subarray (whole domain
    /// when unset), which must start and end on tile boundaries.
    fn global_dense_subarray(&self) -> Result<Option<Vec<(i64, i64)>>> {
        if !self.schema.dense() {
            return Ok(None);
        }
        let sub = self
            .subarray
            .clone()
            .unwrap_or_else(|| self.schema.dimensions.iter().map(|d| d.domain).collect());
        if !subarray_tile_aligned(self.schema, &sub) {
            return Err(WriterError::InvalidArgument(
                "dense global writes require a tile-aligned subarray".to_string(),
            ));
        }
        Ok(Some(sub))
    }

    /// MBR per emitted tile, decoded from the staged dimension tiles.
    fn sparse_mbrs(&self, prepared: &[(FieldSpec, Vec<TileGroup>)]) -> Vec<Vec<(i64, i64)>> {
        let mut per_dim: Vec<&[TileGroup]> = Vec::with_capacity(self.schema.dim_num());
        for dim in &self.schema.dimensions {
            match prepared.iter().find(|(s, _)| s.is_dim && s.name == dim.name) {
                Some((_, tiles)) => per_dim.push(tiles),
                None => return Vec::new(),
            }
        }
        mbrs_from_dim_tiles(&self.schema.dimensions, &per_dim)
    }

    fn pipeline(&self, name: &str, kind: TileKind) -> &dyn FilterPipeline {
        self.pipelines
            .get(&(name.to_string(), kind))
            .map(|p| p.as_ref())
            .unwrap_or(&PASSTHROUGH)
    }

    /// Runs every staged tile through the pipelines of its stream.
    fn filter_all(
        &self,
        prepared: Vec<(FieldSpec, Vec<TileGroup>)>,
    ) -> Result<Vec<(FieldSpec, Vec<FilteredGroup>)>> {
        prepared
            .into_par_iter()
            .map(|(spec, groups)| {
                let main_kind = if spec.var {
                    TileKind::Offsets
                } else {
                    TileKind::Values
                };
                let filtered = groups
                    .into_iter()
                    .map(|g| {
                        Ok(FilteredGroup {
                            main: self.pipeline(&spec.name, main_kind).filter(&g.main.data)?,
                            var: g
                                .var
                                .map(|t| {
                                    self.pipeline(&spec.name, TileKind::Values).filter(&t.data)
                                })
                                .transpose()?,
                            validity: g
                                .validity
                                .map(|t| {
                                    self.pipeline(&spec.name, TileKind::Validity).filter(&t.data)
                                })
                                .transpose()?,
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok((spec, filtered))
            })
            .collect()
    }

    /// Appends all filtered tiles, one file set per name, and records
    /// their offsets. Tile order within a file follows emit order.
    fn write_all_tiles(
        &mut self,
        dir: &Path,
        filtered: Vec<(FieldSpec, Vec<FilteredGroup>)>,
        meta: &mut FragmentMetadata,
    ) -> Result<()> {
        let storage = self.storage;
        let records: Vec<Vec<(String, u64, u64)>> = filtered
            .par_iter()
            .map(|(spec, groups)| {
                let mut recs = Vec::new();
                for g in groups {
                    let file = format!("{}.tdb", spec.name);
                    let off = storage.append(dir, &file, &g.main)?;
                    recs.push((file, off, g.main.len() as u64));
                    if let Some(var) = &g.var {
                        let file = format!("{}_var.tdb", spec.name);
                        let off = storage.append(dir, &file, var)?;
                        recs.push((file, off, var.len() as u64));
                    }
                    if let Some(validity) = &g.validity {
                        let file = format!("{}_validity.tdb", spec.name);
                        let off = storage.append(dir, &file, validity)?;
                        recs.push((file, off, validity.len() as u64));
                    }
                }
                Ok(recs)
            })
            .collect::<Result<_>>()?;

        for recs in records {
            for (file, off, len) in recs {
                meta.record_tile(&file, off, len);
                self.stats.bytes_written += len;
            }
        }
        self.stats.tiles_written += filtered
            .iter()
            .map(|(_, groups)| groups.len() as u64)
            .sum::<u64>();
        Ok(())
    }

    /// One-shot path: creates the fragment, writes tiles, footer and
    /// commit marker; nukes the fragment on any storage error.
    fn persist_fragment(
        &mut self,
        mut meta: FragmentMetadata,
        filtered: Vec<(FieldSpec, Vec<FilteredGroup>)>,
        dups_dropped: u64,
    ) -> Result<()> {
        let fragment = fragment_name(meta.timestamp_range.0, meta.timestamp_range.1);
        let dir = self.storage.create_fragment(&fragment)?;

        let result = (|| -> Result<()> {
            self.write_all_tiles(&dir, filtered, &mut meta)?;
            self.storage
                .write_file(&dir, METADATA_FILE, &meta.serialize())?;
            self.storage.commit(&dir)?;
            Ok(())
        })();
        match result {
            Ok(()) => {
                self.stats.cells_written += meta.cell_num;
                self.stats.dups_dropped += dups_dropped;
                self.written.push(WrittenFragmentInfo {
                    uri: dir,
                    timestamp_range: meta.timestamp_range,
                });
                self.state = WriterState::Committed;
                Ok(())
            }
            Err(e) => {
                self.storage.nuke(&dir);
                Err(e)
            }
        }
    }
}

impl Drop for Writer<'_> {
    /// An open global write never leaks a partial fragment.
    fn drop(&mut self) {
        if let WriterState::GlobalOpen(st) =
            std::mem::replace(&mut self.state, WriterState::Failed)
        {
            self.storage.nuke(&st.dir);
        }
    }
}

fn data_error(e: &WriterError) -> bool {
    matches!(
        e,
        WriterError::OutOfBounds(_)
            | WriterError::Duplicate(_)
            | WriterError::OutOfOrder(_)
            | WriterError::Storage(_)
            | WriterError::Filter(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Delta64;
    use crate::schema::{ArrayType, Attribute, CellOrder, Datatype, Dimension};
    use std::fs;

    fn fresh_root(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "gridstore_writer_test_{}_{}_{}",
            name,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        p
    }

    fn dense_2d(attr: Attribute) -> ArraySchema {
        ArraySchema::new(
            ArrayType::Dense,
            vec![
                Dimension::new("d0", Datatype::Int64, (0, 9)).with_tile_extent(2),
                Dimension::new("d1", Datatype::Int64, (0, 9)).with_tile_extent(2),
            ],
            vec![attr],
            CellOrder::RowMajor,
            1024,
        )
        .unwrap()
    }

    fn sparse_2d(capacity: u64, attrs: Vec<Attribute>) -> ArraySchema {
        ArraySchema::new(
            ArrayType::Sparse,
            vec![
                Dimension::new("d0", Datatype::Int64, (0, 9)),
                Dimension::new("d1", Datatype::Int64, (0, 9)),
            ],
            attrs,
            CellOrder::RowMajor,
            capacity,
        )
        .unwrap()
    }

    fn i32s(vals: &[i32]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn i64s(vals: &[i64]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn u64s(vals: &[u64]) -> Vec<u8> {
        vals.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn frag_dirs(root: &Path) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = match fs::read_dir(root) {
            Ok(it) => it
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect(),
            Err(_) => Vec::new(),
        };
        out.sort();
        out
    }

    fn read_meta(dir: &Path) -> FragmentMetadata {
        FragmentMetadata::deserialize(&fs::read(dir.join(METADATA_FILE)).unwrap()).unwrap()
    }

    #[test]
    fn test_dense_row_major_two_by_two() {
        let root = fresh_root("dense_2x2");
        let sm = StorageManager::new(&root).unwrap();
        let schema = dense_2d(Attribute::new("a", Datatype::Int32));
        let values = i32s(&[1, 2, 3, 4]);

        let mut w = Writer::new(&schema, &sm);
        w.init(Layout::RowMajor).unwrap();
        w.set_subarray(vec![(0, 1), (0, 1)]).unwrap();
        w.set_buffer("a", &values).unwrap();
        w.write().unwrap();
        w.finalize().unwrap();

        let dirs = frag_dirs(&root);
        assert_eq!(dirs.len(), 1);
        let dir = &dirs[0];
        assert!(StorageManager::is_committed(dir));
        // One 16-byte tile, cells in row-major order, no framing.
        assert_eq!(fs::read(dir.join("a.tdb")).unwrap(), values);

        let meta = read_meta(dir);
        assert!(meta.dense);
        assert_eq!(meta.cell_num, 4);
        assert_eq!(meta.tile_num, 1);
        assert_eq!(meta.mbrs, vec![vec![(0, 1), (0, 1)]]);
        assert_eq!(meta.non_empty_domain, Some(vec![(0, 1), (0, 1)]));
        assert_eq!(meta.files["a.tdb"].size, 16);
        assert_eq!(w.written_fragment_info().len(), 1);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_sparse_unordered_row_major() {
        let root = fresh_root("sparse_unordered");
        let sm = StorageManager::new(&root).unwrap();
        let schema = sparse_2d(2, vec![Attribute::new("a", Datatype::Int32)]);
        let d0 = i64s(&[1, 0, 1]);
        let d1 = i64s(&[1, 0, 0]);
        let a = i32s(&[30, 10, 20]);

        let mut w = Writer::new(&schema, &sm);
        w.init(Layout::Unordered).unwrap();
        w.set_buffer("d0", &d0).unwrap();
        w.set_buffer("d1", &d1).unwrap();
        w.set_buffer("a", &a).unwrap();
        w.write().unwrap();

        let dirs = frag_dirs(&root);
        assert_eq!(dirs.len(), 1);
        let dir = &dirs[0];
        assert!(StorageManager::is_committed(dir));
        // Sorted to (0,0), (1,0), (1,1): two tiles of 2 and 1 cells.
        assert_eq!(fs::read(dir.join("a.tdb")).unwrap(), i32s(&[10, 20, 30]));
        assert_eq!(fs::read(dir.join("d0.tdb")).unwrap(), i64s(&[0, 1, 1]));
        assert_eq!(fs::read(dir.join("d1.tdb")).unwrap(), i64s(&[0, 0, 1]));

        let meta = read_meta(dir);
        assert_eq!(meta.cell_num, 3);
        assert_eq!(meta.tile_num, 2);
        assert_eq!(
            meta.mbrs,
            vec![vec![(0, 1), (0, 0)], vec![(1, 1), (1, 1)]]
        );
        assert_eq!(meta.files["a.tdb"].tile_offsets, vec![0, 8]);
        // Every file the footer declares exists with the declared size.
        for (file, fm) in &meta.files {
            assert_eq!(fs::metadata(dir.join(file)).unwrap().len(), fm.size);
        }
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_zipped_coordinates_match_split_buffers() {
        let root = fresh_root("zipped");
        let sm = StorageManager::new(&root).unwrap();
        let schema = sparse_2d(2, vec![Attribute::new("a", Datatype::Int32)]);
        // (1,1), (0,0), (1,0) zipped.
        let coords = i64s(&[1, 1, 0, 0, 1, 0]);
        let a = i32s(&[30, 10, 20]);

        let mut w = Writer::new(&schema, &sm);
        w.init(Layout::Unordered).unwrap();
        w.set_buffer(COORDS, &coords).unwrap();
        w.set_buffer("a", &a).unwrap();
        w.write().unwrap();

        let dir = &frag_dirs(&root)[0];
        assert_eq!(fs::read(dir.join("a.tdb")).unwrap(), i32s(&[10, 20, 30]));
        assert_eq!(fs::read(dir.join("d0.tdb")).unwrap(), i64s(&[0, 1, 1]));
        assert_eq!(fs::read(dir.join("d1.tdb")).unwrap(), i64s(&[0, 0, 1]));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_sparse_global_two_submissions() {
        let root = fresh_root("global_two");
        let sm = StorageManager::new(&root).unwrap();
        let schema = sparse_2d(3, vec![Attribute::new("a", Datatype::Int32)]);
        let d0_a = i64s(&[0, 0]);
        let d1_a = i64s(&[0, 1]);
        let a_a = i32s(&[1, 2]);
        let d0_b = i64s(&[1, 1]);
        let d1_b = i64s(&[0, 1]);
        let a_b = i32s(&[3, 4]);

        let mut w = Writer::new(&schema, &sm);
        w.init(Layout::GlobalOrder).unwrap();
        w.set_buffer("d0", &d0_a).unwrap();
        w.set_buffer("d1", &d1_a).unwrap();
        w.set_buffer("a", &a_a).unwrap();
        w.write().unwrap();

        // Nothing is flushed while the first tile is short of capacity.
        let dir = frag_dirs(&root)[0].clone();
        assert!(!dir.join("a.tdb").exists());
        assert!(!StorageManager::is_committed(&dir));

        w.set_buffer("d0", &d0_b).unwrap();
        w.set_buffer("d1", &d1_b).unwrap();
        w.set_buffer("a", &a_b).unwrap();
        w.write().unwrap();
        // One full 3-cell tile is out; one residual cell is carried.
        assert_eq!(fs::read(dir.join("a.tdb")).unwrap(), i32s(&[1, 2, 3]));

        w.finalize().unwrap();
        assert!(StorageManager::is_committed(&dir));
        assert_eq!(fs::read(dir.join("a.tdb")).unwrap(), i32s(&[1, 2, 3, 4]));

        let meta = read_meta(&dir);
        assert_eq!(meta.tile_num, 2);
        assert_eq!(meta.cell_num, 4);
        assert_eq!(
            meta.mbrs,
            vec![vec![(0, 1), (0, 1)], vec![(1, 1), (1, 1)]]
        );
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_global_split_equals_single_submission() {
        // The same sorted input split across submissions produces
        // byte-identical tile files.
        let schema = sparse_2d(3, vec![Attribute::new("a", Datatype::Int32)]);
        let d0 = i64s(&[0, 0, 1, 1]);
        let d1 = i64s(&[0, 1, 0, 1]);
        let a = i32s(&[1, 2, 3, 4]);
        let d0_a = i64s(&[0, 0]);
        let d1_a = i64s(&[0, 1]);
        let a_a = i32s(&[1, 2]);
        let d0_b = i64s(&[1, 1]);
        let d1_b = i64s(&[0, 1]);
        let a_b = i32s(&[3, 4]);

        let root_one = fresh_root("global_one_shot");
        let sm_one = StorageManager::new(&root_one).unwrap();
        let mut w = Writer::new(&schema, &sm_one);
        w.init(Layout::GlobalOrder).unwrap();
        w.set_buffer("d0", &d0).unwrap();
        w.set_buffer("d1", &d1).unwrap();
        w.set_buffer("a", &a).unwrap();
        w.write().unwrap();
        w.finalize().unwrap();

        let root_two = fresh_root("global_split");
        let sm_two = StorageManager::new(&root_two).unwrap();
        let mut w = Writer::new(&schema, &sm_two);
        w.init(Layout::GlobalOrder).unwrap();
        w.set_buffer("d0", &d0_a).unwrap();
        w.set_buffer("d1", &d1_a).unwrap();
        w.set_buffer("a", &a_a).unwrap();
        w.write().unwrap();
        w.set_buffer("d0", &d0_b).unwrap();
        w.set_buffer("d1", &d1_b).unwrap();
        w.set_buffer("a", &a_b).unwrap();
        w.write().unwrap();
        w.finalize().unwrap();

        let dir_one = &frag_dirs(&root_one)[0];
        let dir_two = &frag_dirs(&root_two)[0];
        for file in ["a.tdb", "d0.tdb", "d1.tdb"] {
            assert_eq!(
                fs::read(dir_one.join(file)).unwrap(),
                fs::read(dir_two.join(file)).unwrap(),
                "{file} differs between one-shot and split submissions"
            );
        }
        let meta_one = read_meta(dir_one);
        let meta_two = read_meta(dir_two);
        assert_eq!(meta_one.mbrs, meta_two.mbrs);
        assert_eq!(meta_one.cell_num, meta_two.cell_num);
        assert_eq!(meta_one.files, meta_two.files);
        let _ = fs::remove_dir_all(&root_one);
        let _ = fs::remove_dir_all(&root_two);
    }

    #[test]
    fn test_duplicate_detection_and_dedup() {
        let root = fresh_root("dups");
        let sm = StorageManager::new(&root).unwrap();
        let schema = sparse_2d(2, vec![Attribute::new("a", Datatype::Int32)]);
        let d0 = i64s(&[0, 0, 1]);
        let d1 = i64s(&[0, 0, 1]);
        let a = i32s(&[10, 20, 30]);

        let mut w = Writer::new(&schema, &sm);
        w.init(Layout::Unordered).unwrap();
        w.set_buffer("d0", &d0).unwrap();
        w.set_buffer("d1", &d1).unwrap();
        w.set_buffer("a", &a).unwrap();
        assert!(matches!(w.write().unwrap_err(), WriterError::Duplicate(_)));
        assert!(frag_dirs(&root).is_empty());

        w.reset();
        w.set_dedup_coords(true);
        w.write().unwrap();
        let dir = &frag_dirs(&root)[0];
        let meta = read_meta(dir);
        assert_eq!(meta.cell_num, 2);
        // The first occurrence of (0,0) wins.
        assert_eq!(fs::read(dir.join("a.tdb")).unwrap(), i32s(&[10, 30]));
        assert_eq!(w.stats().dups_dropped, 1);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_out_of_bounds_leaves_no_fragment() {
        let root = fresh_root("oob");
        let sm = StorageManager::new(&root).unwrap();
        let schema = sparse_2d(2, vec![Attribute::new("a", Datatype::Int32)]);
        let d0 = i64s(&[10]);
        let d1 = i64s(&[0]);
        let a = i32s(&[1]);

        let mut w = Writer::new(&schema, &sm);
        w.init(Layout::Unordered).unwrap();
        w.set_buffer("d0", &d0).unwrap();
        w.set_buffer("d1", &d1).unwrap();
        w.set_buffer("a", &a).unwrap();
        assert!(matches!(w.write().unwrap_err(), WriterError::OutOfBounds(_)));
        assert!(frag_dirs(&root).is_empty());

        // The check can be disabled explicitly.
        w.reset();
        w.set_config("check_coord_oob", "false").unwrap();
        w.write().unwrap();
        assert_eq!(frag_dirs(&root).len(), 1);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_offsets_configurations_agree_on_disk() {
        // "ab", "", "cde" under three offset configurations produce
        // identical offset and value tiles.
        let schema = ArraySchema::new(
            ArrayType::Sparse,
            vec![Dimension::new("d", Datatype::Int64, (0, 9))],
            vec![Attribute::new("v", Datatype::StringAscii)],
            CellOrder::RowMajor,
            8,
        )
        .unwrap();
        let d = i64s(&[0, 1, 2]);
        let values = b"abcde";
        let off_bytes_64 = u64s(&[0, 2, 2]);
        let off_elem_32_extra: Vec<u8> =
            [0u32, 2, 2, 5].iter().flat_map(|o| o.to_le_bytes()).collect();
        let off_bytes_32: Vec<u8> = [0u32, 2, 2].iter().flat_map(|o| o.to_le_bytes()).collect();

        let configs: [(&[u8], &[(&str, &str)]); 3] = [
            (&off_bytes_64, &[]),
            (
                &off_elem_32_extra,
                &[
                    ("offsets_format_mode", "elements"),
                    ("offsets_bitsize", "32"),
                    ("offsets_extra_element", "true"),
                ],
            ),
            (&off_bytes_32, &[("offsets_bitsize", "32")]),
        ];

        let mut tiles: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        for (offsets, cfg) in configs {
            let root = fresh_root("offsets_cfg");
            let sm = StorageManager::new(&root).unwrap();
            let mut w = Writer::new(&schema, &sm);
            w.init(Layout::Unordered).unwrap();
            for &(k, v) in cfg {
                w.set_config(k, v).unwrap();
            }
            w.set_buffer("d", &d).unwrap();
            w.set_buffer_var("v", offsets, values).unwrap();
            w.write().unwrap();
            let dir = &frag_dirs(&root)[0];
            tiles.push((
                fs::read(dir.join("v.tdb")).unwrap(),
                fs::read(dir.join("v_var.tdb")).unwrap(),
            ));
            let _ = fs::remove_dir_all(&root);
        }
        assert_eq!(tiles[0].0, u64s(&[0, 2, 2]));
        assert_eq!(tiles[0].1, b"abcde");
        assert_eq!(tiles[0], tiles[1]);
        assert_eq!(tiles[0], tiles[2]);
    }

    #[test]
    fn test_global_order_violation_detected() {
        let root = fresh_root("global_order");
        let sm = StorageManager::new(&root).unwrap();
        let schema = sparse_2d(4, vec![Attribute::new("a", Datatype::Int32)]);
        let d0 = i64s(&[1, 0]);
        let d1 = i64s(&[0, 0]);
        let a = i32s(&[1, 2]);

        let mut w = Writer::new(&schema, &sm);
        w.init(Layout::GlobalOrder).unwrap();
        w.set_buffer("d0", &d0).unwrap();
        w.set_buffer("d1", &d1).unwrap();
        w.set_buffer("a", &a).unwrap();
        assert!(matches!(w.write().unwrap_err(), WriterError::OutOfOrder(_)));
        assert!(frag_dirs(&root).is_empty());

        // Disabling the check makes the caller's word final.
        w.reset();
        w.disable_check_global_order();
        w.write().unwrap();
        w.finalize().unwrap();
        assert_eq!(frag_dirs(&root).len(), 1);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_empty_global_write_emits_empty_fragment() {
        let root = fresh_root("global_empty");
        let sm = StorageManager::new(&root).unwrap();
        let schema = sparse_2d(4, vec![Attribute::new("a", Datatype::Int32)]);

        let mut w = Writer::new(&schema, &sm);
        w.init(Layout::GlobalOrder).unwrap();
        w.set_buffer("d0", &[]).unwrap();
        w.set_buffer("d1", &[]).unwrap();
        w.set_buffer("a", &[]).unwrap();
        w.write().unwrap();
        w.finalize().unwrap();

        let dirs = frag_dirs(&root);
        assert_eq!(dirs.len(), 1);
        assert!(StorageManager::is_committed(&dirs[0]));
        let meta = read_meta(&dirs[0]);
        assert_eq!(meta.cell_num, 0);
        assert_eq!(meta.tile_num, 0);
        assert_eq!(meta.non_empty_domain, None);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_drop_nukes_open_global_fragment() {
        let root = fresh_root("drop_nuke");
        let sm = StorageManager::new(&root).unwrap();
        let schema = sparse_2d(3, vec![Attribute::new("a", Datatype::Int32)]);
        let d0 = i64s(&[0]);
        let d1 = i64s(&[0]);
        let a = i32s(&[1]);

        {
            let mut w = Writer::new(&schema, &sm);
            w.init(Layout::GlobalOrder).unwrap();
            w.set_buffer("d0", &d0).unwrap();
            w.set_buffer("d1", &d1).unwrap();
            w.set_buffer("a", &a).unwrap();
            w.write().unwrap();
            assert_eq!(frag_dirs(&root).len(), 1);
        }
        assert!(frag_dirs(&root).is_empty());
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_lifecycle_state_errors() {
        let root = fresh_root("lifecycle");
        let sm = StorageManager::new(&root).unwrap();
        let schema = sparse_2d(2, vec![Attribute::new("a", Datatype::Int32)]);
        let d0 = i64s(&[0]);
        let d1 = i64s(&[0]);
        let a = i32s(&[1]);

        let mut w = Writer::new(&schema, &sm);
        assert!(matches!(w.write().unwrap_err(), WriterError::State(_)));
        assert!(matches!(w.finalize().unwrap_err(), WriterError::State(_)));

        w.init(Layout::Unordered).unwrap();
        w.set_buffer("d0", &d0).unwrap();
        w.set_buffer("d1", &d1).unwrap();
        w.set_buffer("a", &a).unwrap();
        w.write().unwrap();
        assert!(matches!(w.write().unwrap_err(), WriterError::State(_)));

        w.reset();
        w.write().unwrap();
        assert_eq!(w.written_fragment_info().len(), 2);
        assert_eq!(w.stats().write_num, 2);
        assert_eq!(w.stats().cells_written, 2);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_mixed_coordinate_buffers_rejected() {
        let root = fresh_root("mixed");
        let sm = StorageManager::new(&root).unwrap();
        let schema = sparse_2d(2, vec![Attribute::new("a", Datatype::Int32)]);
        let zipped = i64s(&[0, 0]);
        let d0 = i64s(&[0]);

        let mut w = Writer::new(&schema, &sm);
        w.init(Layout::Unordered).unwrap();
        w.set_buffer(COORDS, &zipped).unwrap();
        assert!(matches!(
            w.set_buffer("d0", &d0).unwrap_err(),
            WriterError::InvalidArgument(_)
        ));

        let mut w = Writer::new(&schema, &sm);
        w.init(Layout::Unordered).unwrap();
        w.set_buffer("d0", &d0).unwrap();
        assert!(matches!(
            w.set_buffer(COORDS, &zipped).unwrap_err(),
            WriterError::InvalidArgument(_)
        ));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_binding_validation() {
        let root = fresh_root("binding");
        let sm = StorageManager::new(&root).unwrap();
        let schema = sparse_2d(
            2,
            vec![
                Attribute::new("a", Datatype::Int32),
                Attribute::new("v", Datatype::StringAscii),
            ],
        );
        let d0 = i64s(&[0]);
        let d1 = i64s(&[0]);
        let mut w = Writer::new(&schema, &sm);
        w.init(Layout::Unordered).unwrap();

        assert!(matches!(
            w.set_buffer("nope", &[]).unwrap_err(),
            WriterError::InvalidArgument(_)
        ));
        // Wrong overload for a var-sized attribute.
        assert!(matches!(
            w.set_buffer("v", &[]).unwrap_err(),
            WriterError::InvalidArgument(_)
        ));
        // Fixed attribute with a ragged size.
        assert!(matches!(
            w.set_buffer("a", &[0u8; 5]).unwrap_err(),
            WriterError::Shape(_)
        ));
        // Missing attribute buffer surfaces at write.
        w.set_buffer("d0", &d0).unwrap();
        w.set_buffer("d1", &d1).unwrap();
        assert!(matches!(
            w.write().unwrap_err(),
            WriterError::InvalidArgument(_)
        ));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_inconsistent_cell_counts_rejected() {
        let root = fresh_root("counts");
        let sm = StorageManager::new(&root).unwrap();
        let schema = sparse_2d(2, vec![Attribute::new("a", Datatype::Int32)]);
        let d0 = i64s(&[0, 1]);
        let d1 = i64s(&[0, 1]);
        let a = i32s(&[1]);
        let a2 = i32s(&[1, 2]);

        let mut w = Writer::new(&schema, &sm);
        w.init(Layout::Unordered).unwrap();
        w.set_buffer("d0", &d0).unwrap();
        w.set_buffer("d1", &d1).unwrap();
        w.set_buffer("a", &a).unwrap();
        assert!(matches!(w.write().unwrap_err(), WriterError::Shape(_)));
        // Validation failures leave no fragment and the writer usable.
        assert!(frag_dirs(&root).is_empty());
        w.set_buffer("a", &a2).unwrap();
        w.write().unwrap();
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_nullable_attribute_validity_stream() {
        let root = fresh_root("nullable");
        let sm = StorageManager::new(&root).unwrap();
        let schema = sparse_2d(
            4,
            vec![Attribute::new("n", Datatype::Int32).nullable()],
        );
        let d0 = i64s(&[1, 0]);
        let d1 = i64s(&[0, 0]);
        let n = i32s(&[7, 8]);
        let validity = [0u8, 1];

        let mut w = Writer::new(&schema, &sm);
        w.init(Layout::Unordered).unwrap();
        w.set_buffer("d0", &d0).unwrap();
        w.set_buffer("d1", &d1).unwrap();
        w.set_buffer_nullable("n", &n, &validity).unwrap();
        w.write().unwrap();

        let dir = &frag_dirs(&root)[0];
        // Sorted to (0,0), (1,0): values and validity re-order together.
        assert_eq!(fs::read(dir.join("n.tdb")).unwrap(), i32s(&[8, 7]));
        assert_eq!(fs::read(dir.join("n_validity.tdb")).unwrap(), vec![1, 0]);
        let meta = read_meta(dir);
        assert!(meta.files.contains_key("n_validity.tdb"));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_config_parsing() {
        let root = fresh_root("config");
        let sm = StorageManager::new(&root).unwrap();
        let schema = sparse_2d(2, vec![Attribute::new("v", Datatype::StringAscii)]);
        let offsets = u64s(&[0]);
        let values = b"x";
        let mut w = Writer::new(&schema, &sm);

        assert!(matches!(
            w.set_config("no_such_option", "true").unwrap_err(),
            WriterError::InvalidArgument(_)
        ));
        assert!(matches!(
            w.set_config("dedup_coords", "yes").unwrap_err(),
            WriterError::InvalidArgument(_)
        ));
        assert!(matches!(
            w.set_config("offsets_bitsize", "48").unwrap_err(),
            WriterError::InvalidArgument(_)
        ));
        w.set_config("disable_check_global_order", "true").unwrap();
        assert!(!w.options().check_global_order);

        // Offsets options are frozen once a var-sized buffer is bound.
        w.set_buffer_var("v", &offsets, values).unwrap();
        assert!(matches!(
            w.set_config("offsets_bitsize", "32").unwrap_err(),
            WriterError::State(_)
        ));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_one_dimensional_layout_calibration() {
        let root = fresh_root("calibrate_1d");
        let sm = StorageManager::new(&root).unwrap();
        let schema = ArraySchema::new(
            ArrayType::Dense,
            vec![Dimension::new("d", Datatype::Int64, (0, 7)).with_tile_extent(4)],
            vec![Attribute::new("a", Datatype::Int32)],
            CellOrder::RowMajor,
            16,
        )
        .unwrap();
        let mut w = Writer::new(&schema, &sm);
        w.init(Layout::ColMajor).unwrap();
        assert_eq!(w.layout(), Layout::RowMajor);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_dense_global_whole_tiles() {
        let root = fresh_root("dense_global");
        let sm = StorageManager::new(&root).unwrap();
        let schema = ArraySchema::new(
            ArrayType::Dense,
            vec![
                Dimension::new("d0", Datatype::Int64, (0, 3)).with_tile_extent(2),
                Dimension::new("d1", Datatype::Int64, (0, 3)).with_tile_extent(2),
            ],
            vec![Attribute::new("a", Datatype::Int32)],
            CellOrder::RowMajor,
            1024,
        )
        .unwrap();
        // 16 cells in global order: tile by tile, row-major inside.
        let all = i32s(&(0..16).collect::<Vec<i32>>());
        let first_half = &all[..32];
        let second_half = &all[32..];

        let mut w = Writer::new(&schema, &sm);
        w.init(Layout::GlobalOrder).unwrap();
        // A submission that is not a whole number of tiles is rejected
        // before any storage mutation.
        w.set_buffer("a", &all[..12]).unwrap();
        assert!(matches!(w.write().unwrap_err(), WriterError::Shape(_)));

        w.set_buffer("a", first_half).unwrap();
        w.write().unwrap();
        w.set_buffer("a", second_half).unwrap();
        w.write().unwrap();
        w.finalize().unwrap();

        let dir = &frag_dirs(&root)[0];
        assert_eq!(fs::read(dir.join("a.tdb")).unwrap(), all);
        let meta = read_meta(dir);
        assert!(meta.dense);
        assert_eq!(meta.cell_num, 16);
        assert_eq!(meta.tile_num, 4);
        assert_eq!(meta.mbrs[0], vec![(0, 1), (0, 1)]);
        assert_eq!(meta.mbrs[3], vec![(2, 3), (2, 3)]);
        assert_eq!(meta.non_empty_domain, Some(vec![(0, 3), (0, 3)]));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_filter_pipeline_shapes_bytes_on_disk() {
        let root = fresh_root("filtered");
        let sm = StorageManager::new(&root).unwrap();
        let schema = sparse_2d(8, vec![Attribute::new("a", Datatype::Int64)]);
        let d0 = i64s(&[0, 1]);
        let d1 = i64s(&[0, 1]);
        let a = i64s(&[10, 30]);

        let mut w = Writer::new(&schema, &sm);
        w.init(Layout::Unordered).unwrap();
        w.set_filter_pipeline("a", TileKind::Values, Box::new(Delta64))
            .unwrap();
        w.set_buffer("d0", &d0).unwrap();
        w.set_buffer("d1", &d1).unwrap();
        w.set_buffer("a", &a).unwrap();
        w.write().unwrap();

        let dir = &frag_dirs(&root)[0];
        // Deltas, not raw values, land on disk.
        assert_eq!(fs::read(dir.join("a.tdb")).unwrap(), i64s(&[10, 20]));
        // Dimension tiles keep their default passthrough pipelines.
        assert_eq!(fs::read(dir.join("d0.tdb")).unwrap(), d0);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_filter_failure_nukes_fragment() {
        let root = fresh_root("filter_fail");
        let sm = StorageManager::new(&root).unwrap();
        let schema = sparse_2d(8, vec![Attribute::new("a", Datatype::Int32)]);
        let d0 = i64s(&[0]);
        let d1 = i64s(&[0]);
        let a = i32s(&[1]);

        let mut w = Writer::new(&schema, &sm);
        w.init(Layout::Unordered).unwrap();
        // Delta64 rejects the 4-byte tile of a single Int32 cell.
        w.set_filter_pipeline("a", TileKind::Values, Box::new(Delta64))
            .unwrap();
        w.set_buffer("d0", &d0).unwrap();
        w.set_buffer("d1", &d1).unwrap();
        w.set_buffer("a", &a).unwrap();
        assert!(matches!(w.write().unwrap_err(), WriterError::Filter(_)));
        assert!(frag_dirs(&root).is_empty());
        assert!(matches!(w.write().unwrap_err(), WriterError::State(_)));
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_var_sized_cells_split_across_tiles() {
        let root = fresh_root("var_tiles");
        let sm = StorageManager::new(&root).unwrap();
        let schema = ArraySchema::new(
            ArrayType::Sparse,
            vec![Dimension::new("d", Datatype::Int64, (0, 9))],
            vec![Attribute::new("v", Datatype::StringAscii)],
            CellOrder::RowMajor,
            2,
        )
        .unwrap();
        let d = i64s(&[0, 1, 2]);
        let offsets = u64s(&[0, 2, 2]);
        let values = b"abcde";

        let mut w = Writer::new(&schema, &sm);
        w.init(Layout::Unordered).unwrap();
        w.set_buffer("d", &d).unwrap();
        w.set_buffer_var("v", &offsets, values).unwrap();
        w.write().unwrap();

        let dir = &frag_dirs(&root)[0];
        // Tile 0: cells "ab" and ""; tile 1: "cde" with offsets reset.
        assert_eq!(fs::read(dir.join("v.tdb")).unwrap(), u64s(&[0, 2, 0]));
        assert_eq!(fs::read(dir.join("v_var.tdb")).unwrap(), b"abcde");
        let meta = read_meta(dir);
        assert_eq!(meta.files["v.tdb"].tile_offsets, vec![0, 16]);
        assert_eq!(meta.files["v_var.tdb"].tile_offsets, vec![0, 2]);
        let _ = fs::remove_dir_all(&root);
    }
}
