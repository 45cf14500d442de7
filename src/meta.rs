// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Fragment metadata: per-tile MBRs, the fragment non-empty domain,
// per-file tile offsets and byte sizes, cell/tile counts and the
// timestamp range. The accumulator owns the footer serialization.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;

use uuid::Uuid;

use crate::error::{Result, WriterError};
use crate::schema::Dimension;
use crate::storage::fnv1a32;
use crate::tile::TileGroup;

/// On-disk fragment format version; also the trailing component of the
/// fragment name.
pub const FORMAT_VERSION: u32 = 1;

/// Footer file name under the fragment prefix.
pub const METADATA_FILE: &str = "__fragment_metadata.tdb";

/// Commit marker name; a fragment is visible iff this file exists.
pub const COMMIT_FILE: &str = "__ok";

const FOOTER_MAGIC: &[u8; 4] = b"GSFM";

/// Builds a fragment name: `__<t_first>_<t_last>_<uuid32hex>_<version>`.
pub fn fragment_name(t_first: u64, t_last: u64) -> String {
    format!(
        "__{}_{}_{}_{}",
        t_first,
        t_last,
        Uuid::new_v4().simple(),
        FORMAT_VERSION
    )
}

/// Parses a fragment name back into
/// `(t_first, t_last, uuid, version)`.
pub fn parse_fragment_name(name: &str) -> Option<(u64, u64, String, u32)> {
    let rest = name.strip_prefix("__")?;
    let parts: Vec<&str> = rest.split('_').collect();
    if parts.len() != 4 {
        return None;
    }
    let uuid = parts[2];
    if uuid.len() != 32 || !uuid.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()) {
        return None;
    }
    Some((
        parts[0].parse().ok()?,
        parts[1].parse().ok()?,
        uuid.to_string(),
        parts[3].parse().ok()?,
    ))
}

/// Identity of a fragment a writer has committed.
#[derive(Debug, Clone)]
pub struct WrittenFragmentInfo {
    pub uri: PathBuf,
    pub timestamp_range: (u64, u64),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMetadata {
    /// Total bytes of the file as declared by the footer.
    pub size: u64,
    /// Byte offset of each filtered tile within the file.
    pub tile_offsets: Vec<u64>,
}

/// Incrementally accumulated fragment metadata, serialized as the
/// footer once all tiles are flushed.
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentMetadata {
    pub dense: bool,
    pub dim_num: usize,
    pub timestamp_range: (u64, u64),
    pub cell_num: u64,
    pub tile_num: u64,
    /// One `(min, max)` interval per dimension, per tile.
    pub mbrs: Vec<Vec<(i64, i64)>>,
    /// Union of all tile MBRs.
    pub non_empty_domain: Option<Vec<(i64, i64)>>,
    pub files: BTreeMap<String, FileMetadata>,
    pub has_consolidated_footer: bool,
}

impl FragmentMetadata {
    pub fn new(dense: bool, dim_num: usize, timestamp: u64) -> Self {
        Self {
            dense,
            dim_num,
            timestamp_range: (timestamp, timestamp),
            cell_num: 0,
            tile_num: 0,
            mbrs: Vec::new(),
            non_empty_domain: None,
            files: BTreeMap::new(),
            has_consolidated_footer: false,
        }
    }

    /// Registers the MBR of the next tile and grows the non-empty
    /// domain to enclose it.
    pub fn push_mbr(&mut self, mbr: Vec<(i64, i64)>) {
        debug_assert_eq!(mbr.len(), self.dim_num);
        match &mut self.non_empty_domain {
            Some(ned) => {
                for (n, m) in ned.iter_mut().zip(mbr.iter()) {
                    n.0 = n.0.min(m.0);
                    n.1 = n.1.max(m.1);
                }
            }
            None => self.non_empty_domain = Some(mbr.clone()),
        }
        self.mbrs.push(mbr);
        self.tile_num += 1;
    }

    /// Records one filtered tile appended to `file` at `offset`.
    pub fn record_tile(&mut self, file: &str, offset: u64, len: u64) {
        let entry = self.files.entry(file.to_string()).or_default();
        entry.tile_offsets.push(offset);
        entry.size = entry.size.max(offset + len);
    }

    pub fn add_cells(&mut self, cells: u64) {
        self.cell_num += cells;
    }

    /// Serializes the version-stamped footer with a checksum trailer.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(FOOTER_MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        out.push(self.dense as u8);
        out.push(self.has_consolidated_footer as u8);
        out.extend_from_slice(&(self.dim_num as u32).to_le_bytes());
        out.extend_from_slice(&self.timestamp_range.0.to_le_bytes());
        out.extend_from_slice(&self.timestamp_range.1.to_le_bytes());
        out.extend_from_slice(&self.cell_num.to_le_bytes());
        out.extend_from_slice(&self.tile_num.to_le_bytes());

        match &self.non_empty_domain {
            Some(ned) => {
                out.push(1);
                for (lo, hi) in ned {
                    out.extend_from_slice(&lo.to_le_bytes());
                    out.extend_from_slice(&hi.to_le_bytes());
                }
            }
            None => out.push(0),
        }
        for mbr in &self.mbrs {
            for (lo, hi) in mbr {
                out.extend_from_slice(&lo.to_le_bytes());
                out.extend_from_slice(&hi.to_le_bytes());
            }
        }

        out.extend_from_slice(&(self.files.len() as u32).to_le_bytes());
        for (name, fm) in &self.files {
            let name_bytes = name.as_bytes();
            out.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
            out.extend_from_slice(name_bytes);
            out.extend_from_slice(&fm.size.to_le_bytes());
            out.extend_from_slice(&(fm.tile_offsets.len() as u32).to_le_bytes());
            for off in &fm.tile_offsets {
                out.extend_from_slice(&off.to_le_bytes());
            }
        }

        let checksum = fnv1a32(&out);
        out.extend_from_slice(&checksum.to_le_bytes());
        out
    }

    /// Decodes and verifies a footer produced by `serialize`.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader { bytes, pos: 0 };
        if r.take(4)? != FOOTER_MAGIC {
            return Err(invalid("bad footer magic"));
        }
        let version = r.u32()?;
        if version != FORMAT_VERSION {
            return Err(invalid("unsupported footer version"));
        }
        let dense = r.u8()? != 0;
        let has_consolidated_footer = r.u8()? != 0;
        let dim_num = r.u32()? as usize;
        if dim_num == 0 {
            return Err(invalid("footer has zero dimensions"));
        }
        let timestamp_range = (r.u64()?, r.u64()?);
        let cell_num = r.u64()?;
        let tile_num = r.u64()?;

        // Counts must be backed by actual bytes before any allocation.
        let interval_bytes = (dim_num as u64).saturating_mul(16);
        if tile_num.saturating_mul(interval_bytes) > bytes.len() as u64 {
            return Err(invalid("footer truncated"));
        }

        let non_empty_domain = if r.u8()? != 0 {
            if interval_bytes > bytes.len() as u64 {
                return Err(invalid("footer truncated"));
            }
            let mut ned = Vec::with_capacity(dim_num);
            for _ in 0..dim_num {
                ned.push((r.i64()?, r.i64()?));
            }
            Some(ned)
        } else {
            None
        };
        let mut mbrs = Vec::with_capacity(tile_num as usize);
        for _ in 0..tile_num {
            let mut mbr = Vec::with_capacity(dim_num);
            for _ in 0..dim_num {
                mbr.push((r.i64()?, r.i64()?));
            }
            mbrs.push(mbr);
        }

        let file_num = r.u32()?;
        let mut files = BTreeMap::new();
        for _ in 0..file_num {
            let name_len = r.u16()? as usize;
            let name = std::str::from_utf8(r.take(name_len)?)
                .map_err(|_| invalid("footer file name is not utf-8"))?
                .to_string();
            let size = r.u64()?;
            let off_num = r.u32()? as usize;
            if (off_num as u64).saturating_mul(8) > bytes.len() as u64 {
                return Err(invalid("footer truncated"));
            }
            let mut tile_offsets = Vec::with_capacity(off_num);
            for _ in 0..off_num {
                tile_offsets.push(r.u64()?);
            }
            files.insert(name, FileMetadata { size, tile_offsets });
        }

        let body_len = r.pos;
        let checksum = r.u32()?;
        if fnv1a32(&bytes[..body_len]) != checksum {
            return Err(invalid("footer checksum mismatch"));
        }

        Ok(Self {
            dense,
            dim_num,
            timestamp_range,
            cell_num,
            tile_num,
            mbrs,
            non_empty_domain,
            files,
            has_consolidated_footer,
        })
    }
}

/// Computes one MBR per tile from the prepared dimension tiles.
///
/// Taking coordinates from the staged tiles (rather than the user
/// buffers) keeps cells carried over from earlier global submissions
/// inside their tile's MBR.
pub fn mbrs_from_dim_tiles(
    dims: &[Dimension],
    tiles_per_dim: &[&[TileGroup]],
) -> Vec<Vec<(i64, i64)>> {
    debug_assert_eq!(dims.len(), tiles_per_dim.len());
    let tile_num = tiles_per_dim.first().map(|t| t.len()).unwrap_or(0);
    let mut out = Vec::with_capacity(tile_num);
    for t in 0..tile_num {
        let mut mbr = Vec::with_capacity(dims.len());
        for (dim, tiles) in dims.iter().zip(tiles_per_dim.iter()) {
            let size = dim.cell_size();
            let mut lo = i64::MAX;
            let mut hi = i64::MIN;
            for cell in tiles[t].main.data.chunks_exact(size) {
                let c = dim.datatype.decode_int(cell);
                lo = lo.min(c);
                hi = hi.max(c);
            }
            mbr.push((lo, hi));
        }
        out.push(mbr);
    }
    out
}

fn invalid(msg: &str) -> WriterError {
    WriterError::Storage(io::Error::new(io::ErrorKind::InvalidData, msg.to_string()))
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(invalid("footer truncated"));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}
