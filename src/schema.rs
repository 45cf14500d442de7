// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::error::{Result, WriterError};

/// Reserved buffer name for zipped coordinates (all dimensions
/// interleaved per cell).
pub const COORDS: &str = "__coords";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Datatype {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    StringAscii,
}

impl Datatype {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Int8),
            2 => Some(Self::Int16),
            3 => Some(Self::Int32),
            4 => Some(Self::Int64),
            5 => Some(Self::UInt8),
            6 => Some(Self::UInt16),
            7 => Some(Self::UInt32),
            8 => Some(Self::UInt64),
            9 => Some(Self::Float32),
            10 => Some(Self::Float64),
            11 => Some(Self::StringAscii),
            _ => None,
        }
    }

    pub fn to_tag(self) -> u8 {
        match self {
            Self::Int8 => 1,
            Self::Int16 => 2,
            Self::Int32 => 3,
            Self::Int64 => 4,
            Self::UInt8 => 5,
            Self::UInt16 => 6,
            Self::UInt32 => 7,
            Self::UInt64 => 8,
            Self::Float32 => 9,
            Self::Float64 => 10,
            Self::StringAscii => 11,
        }
    }

    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            Self::Int8 | Self::UInt8 | Self::StringAscii => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float32 => 4,
            Self::Int64 | Self::UInt64 | Self::Float64 => 8,
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Self::Int8
                | Self::Int16
                | Self::Int32
                | Self::Int64
                | Self::UInt8
                | Self::UInt16
                | Self::UInt32
                | Self::UInt64
        )
    }

    /// Decodes one little-endian element as a widened `i64`.
    ///
    /// Only meaningful for integer datatypes; `bytes` must hold exactly
    /// `self.size()` bytes.
    pub fn decode_int(self, bytes: &[u8]) -> i64 {
        match self {
            Self::Int8 => bytes[0] as i8 as i64,
            Self::Int16 => i16::from_le_bytes(bytes.try_into().unwrap()) as i64,
            Self::Int32 => i32::from_le_bytes(bytes.try_into().unwrap()) as i64,
            Self::Int64 => i64::from_le_bytes(bytes.try_into().unwrap()),
            Self::UInt8 => bytes[0] as i64,
            Self::UInt16 => u16::from_le_bytes(bytes.try_into().unwrap()) as i64,
            Self::UInt32 => u32::from_le_bytes(bytes.try_into().unwrap()) as i64,
            Self::UInt64 => u64::from_le_bytes(bytes.try_into().unwrap()) as i64,
            Self::Float32 | Self::Float64 | Self::StringAscii => {
                unreachable!("decode_int on non-integer datatype")
            }
        }
    }
}

/// The cell layout requested for a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    RowMajor,
    ColMajor,
    GlobalOrder,
    Unordered,
}

/// The schema-defined total order on cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellOrder {
    RowMajor,
    ColMajor,
    Hilbert,
}

impl CellOrder {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::RowMajor),
            2 => Some(Self::ColMajor),
            3 => Some(Self::Hilbert),
            _ => None,
        }
    }

    pub fn to_tag(self) -> u8 {
        match self {
            Self::RowMajor => 1,
            Self::ColMajor => 2,
            Self::Hilbert => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayType {
    Dense,
    Sparse,
}

#[derive(Debug, Clone)]
pub struct Dimension {
    pub name: String,
    pub datatype: Datatype,
    /// Inclusive `[lo, hi]` domain, widened to `i64`.
    pub domain: (i64, i64),
    /// Space-tile extent; required for dense arrays.
    pub tile_extent: Option<u64>,
}

impl Dimension {
    pub fn new(name: &str, datatype: Datatype, domain: (i64, i64)) -> Self {
        Self {
            name: name.to_string(),
            datatype,
            domain,
            tile_extent: None,
        }
    }

    pub fn with_tile_extent(mut self, extent: u64) -> Self {
        self.tile_extent = Some(extent);
        self
    }

    pub fn cell_size(&self) -> usize {
        self.datatype.size()
    }
}

#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub datatype: Datatype,
    pub var_sized: bool,
    pub nullable: bool,
    /// One cell's worth of bytes used to fill unwritten dense cells.
    pub fill_value: Vec<u8>,
}

impl Attribute {
    pub fn new(name: &str, datatype: Datatype) -> Self {
        let var_sized = datatype == Datatype::StringAscii;
        let fill_value = vec![0u8; datatype.size()];
        Self {
            name: name.to_string(),
            datatype,
            var_sized,
            nullable: false,
            fill_value,
        }
    }

    pub fn var_sized(mut self) -> Self {
        self.var_sized = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_fill_value(mut self, fill: Vec<u8>) -> Self {
        self.fill_value = fill;
        self
    }

    pub fn cell_size(&self) -> usize {
        self.datatype.size()
    }
}

/// Read-only description of the target array: dimensions, attributes,
/// cell order and tiling.
#[derive(Debug, Clone)]
pub struct ArraySchema {
    pub array_type: ArrayType,
    pub dimensions: Vec<Dimension>,
    pub attributes: Vec<Attribute>,
    pub cell_order: CellOrder,
    /// Cells per tile for sparse writes.
    pub capacity: u64,
}

impl ArraySchema {
    pub fn new(
        array_type: ArrayType,
        dimensions: Vec<Dimension>,
        attributes: Vec<Attribute>,
        cell_order: CellOrder,
        capacity: u64,
    ) -> Result<Self> {
        if dimensions.is_empty() {
            return Err(WriterError::InvalidArgument(
                "schema requires at least one dimension".to_string(),
            ));
        }
        if attributes.is_empty() {
            return Err(WriterError::InvalidArgument(
                "schema requires at least one attribute".to_string(),
            ));
        }
        if capacity == 0 {
            return Err(WriterError::InvalidArgument(
                "tile capacity must be positive".to_string(),
            ));
        }
        if array_type == ArrayType::Dense && cell_order == CellOrder::Hilbert {
            return Err(WriterError::InvalidArgument(
                "dense arrays do not support Hilbert cell order".to_string(),
            ));
        }
        let mut names: Vec<&str> = Vec::new();
        for d in &dimensions {
            if !d.datatype.is_integer() {
                return Err(WriterError::InvalidArgument(format!(
                    "dimension `{}` must have an integer datatype",
                    d.name
                )));
            }
            if d.domain.0 > d.domain.1 {
                return Err(WriterError::InvalidArgument(format!(
                    "dimension `{}` has an empty domain",
                    d.name
                )));
            }
            if array_type == ArrayType::Dense && d.tile_extent.unwrap_or(0) == 0 {
                return Err(WriterError::InvalidArgument(format!(
                    "dense dimension `{}` requires a tile extent",
                    d.name
                )));
            }
            names.push(&d.name);
        }
        for a in &attributes {
            names.push(&a.name);
        }
        let mut sorted = names.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != names.len() {
            return Err(WriterError::InvalidArgument(
                "dimension/attribute names must be unique".to_string(),
            ));
        }
        if names.iter().any(|n| *n == COORDS) {
            return Err(WriterError::InvalidArgument(format!(
                "`{COORDS}` is a reserved name"
            )));
        }
        Ok(Self {
            array_type,
            dimensions,
            attributes,
            cell_order,
            capacity,
        })
    }

    pub fn dense(&self) -> bool {
        self.array_type == ArrayType::Dense
    }

    pub fn dim_num(&self) -> usize {
        self.dimensions.len()
    }

    pub fn dimension(&self, name: &str) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.name == name)
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn is_dim(&self, name: &str) -> bool {
        self.dimension(name).is_some()
    }

    pub fn is_attr(&self, name: &str) -> bool {
        self.attribute(name).is_some()
    }

    /// Size in bytes of one zipped coordinate tuple.
    pub fn coords_size(&self) -> usize {
        self.dimensions.iter().map(|d| d.cell_size()).sum()
    }

    /// Cells per dense space tile (product of tile extents).
    pub fn cells_per_tile(&self) -> u64 {
        self.dimensions
            .iter()
            .map(|d| d.tile_extent.unwrap_or(1))
            .product()
    }
}
