// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Tile filter pipeline contract. The write path only orchestrates:
// every emitted tile runs through the pipeline configured for its
// attribute/dimension and tile kind, and the filtered bytes are what
// lands on disk.

use crate::error::{Result, WriterError};

/// Which of a column's tile streams a pipeline applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileKind {
    Values,
    Offsets,
    Validity,
}

/// Capability handle over a filter chain (compression, checksums,
/// encryption). Implementations never expose their stages.
pub trait FilterPipeline: Send + Sync {
    /// Transforms tile bytes into their on-disk form.
    fn filter(&self, tile: &[u8]) -> Result<Vec<u8>>;

    /// Inverse of `filter`.
    fn unfilter(&self, tile: &[u8]) -> Result<Vec<u8>>;

    /// A fresh pipeline with the same configuration.
    fn clone_config(&self) -> Box<dyn FilterPipeline>;
}

/// The default pipeline: tiles land on disk byte-identical.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl FilterPipeline for Passthrough {
    fn filter(&self, tile: &[u8]) -> Result<Vec<u8>> {
        Ok(tile.to_vec())
    }

    fn unfilter(&self, tile: &[u8]) -> Result<Vec<u8>> {
        Ok(tile.to_vec())
    }

    fn clone_config(&self) -> Box<dyn FilterPipeline> {
        Box::new(*self)
    }
}

/// Delta-codes a stream of little-endian `u64` words. The usual chain
/// head for offset tiles, where consecutive values are close.
#[derive(Debug, Clone, Copy, Default)]
pub struct Delta64;

impl FilterPipeline for Delta64 {
    fn filter(&self, tile: &[u8]) -> Result<Vec<u8>> {
        if tile.len() % 8 != 0 {
            return Err(WriterError::Filter(format!(
                "delta64 input of {} bytes is not u64-aligned",
                tile.len()
            )));
        }
        let mut out = Vec::with_capacity(tile.len());
        let mut prev = 0u64;
        for chunk in tile.chunks_exact(8) {
            let v = u64::from_le_bytes(chunk.try_into().unwrap());
            out.extend_from_slice(&v.wrapping_sub(prev).to_le_bytes());
            prev = v;
        }
        Ok(out)
    }

    fn unfilter(&self, tile: &[u8]) -> Result<Vec<u8>> {
        if tile.len() % 8 != 0 {
            return Err(WriterError::Filter(format!(
                "delta64 input of {} bytes is not u64-aligned",
                tile.len()
            )));
        }
        let mut out = Vec::with_capacity(tile.len());
        let mut acc = 0u64;
        for chunk in tile.chunks_exact(8) {
            acc = acc.wrapping_add(u64::from_le_bytes(chunk.try_into().unwrap()));
            out.extend_from_slice(&acc.to_le_bytes());
        }
        Ok(out)
    }

    fn clone_config(&self) -> Box<dyn FilterPipeline> {
        Box::new(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_is_identity() {
        let p = Passthrough;
        let data = vec![1u8, 2, 3, 4];
        assert_eq!(p.filter(&data).unwrap(), data);
        assert_eq!(p.unfilter(&data).unwrap(), data);
    }

    #[test]
    fn test_delta64_roundtrip() {
        let d = Delta64;
        let values: Vec<u8> = [0u64, 2, 2, 7, 40]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let filtered = d.filter(&values).unwrap();
        assert_ne!(filtered, values);
        assert_eq!(d.unfilter(&filtered).unwrap(), values);
    }

    #[test]
    fn test_delta64_rejects_unaligned() {
        let d = Delta64;
        assert!(matches!(
            d.filter(&[0u8; 7]).unwrap_err(),
            WriterError::Filter(_)
        ));
    }
}
