use crate::spatial::Point;
use serde::{Deserialize, Serialize};

/// Dimension prepended to the native schema for sparse and celled bodies.
pub const TUBE_ID_DIM: &str = "TubeId";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DimType {
    Float64,
    Float32,
    Uint64,
    Uint32,
    Uint16,
    Uint8,
    Int64,
    Int32,
}

impl DimType {
    pub fn size(self) -> usize {
        match self {
            Self::Float64 | Self::Uint64 | Self::Int64 => 8,
            Self::Float32 | Self::Uint32 | Self::Int32 => 4,
            Self::Uint16 => 2,
            Self::Uint8 => 1,
        }
    }

    fn read_f64(self, bytes: &[u8]) -> f64 {
        match self {
            Self::Float64 => f64::from_le_bytes(bytes[..8].try_into().expect("8-byte dim")),
            Self::Float32 => f32::from_le_bytes(bytes[..4].try_into().expect("4-byte dim")) as f64,
            Self::Uint64 => u64::from_le_bytes(bytes[..8].try_into().expect("8-byte dim")) as f64,
            Self::Uint32 => u32::from_le_bytes(bytes[..4].try_into().expect("4-byte dim")) as f64,
            Self::Uint16 => u16::from_le_bytes(bytes[..2].try_into().expect("2-byte dim")) as f64,
            Self::Uint8 => bytes[0] as f64,
            Self::Int64 => i64::from_le_bytes(bytes[..8].try_into().expect("8-byte dim")) as f64,
            Self::Int32 => i32::from_le_bytes(bytes[..4].try_into().expect("4-byte dim")) as f64,
        }
    }

    fn write_f64(self, value: f64, out: &mut [u8]) {
        match self {
            Self::Float64 => out[..8].copy_from_slice(&value.to_le_bytes()),
            Self::Float32 => out[..4].copy_from_slice(&(value as f32).to_le_bytes()),
            Self::Uint64 => out[..8].copy_from_slice(&(value as u64).to_le_bytes()),
            Self::Uint32 => out[..4].copy_from_slice(&(value as u32).to_le_bytes()),
            Self::Uint16 => out[..2].copy_from_slice(&(value as u16).to_le_bytes()),
            Self::Uint8 => out[0] = value as u8,
            Self::Int64 => out[..8].copy_from_slice(&(value as i64).to_le_bytes()),
            Self::Int32 => out[..4].copy_from_slice(&(value as i32).to_le_bytes()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dim {
    pub name: String,
    pub dim_type: DimType,
}

impl Dim {
    pub fn new(name: &str, dim_type: DimType) -> Self {
        Self {
            name: name.to_string(),
            dim_type,
        }
    }

    pub fn size(&self) -> usize {
        self.dim_type.size()
    }
}

/// Ordered dimension list inducing a fixed-size packed record layout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    dims: Vec<Dim>,
}

impl Schema {
    pub fn new(dims: Vec<Dim>) -> Self {
        Self { dims }
    }

    /// The plain X/Y/Z double schema.
    pub fn xyz() -> Self {
        Self::new(vec![
            Dim::new("X", DimType::Float64),
            Dim::new("Y", DimType::Float64),
            Dim::new("Z", DimType::Float64),
        ])
    }

    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    pub fn point_size(&self) -> usize {
        self.dims.iter().map(Dim::size).sum()
    }

    pub fn has_dim(&self, name: &str) -> bool {
        self.dims.iter().any(|dim| dim.name == name)
    }

    fn locate(&self, name: &str) -> Option<(usize, DimType)> {
        let mut offset = 0;
        for dim in &self.dims {
            if dim.name == name {
                return Some((offset, dim.dim_type));
            }
            offset += dim.size();
        }
        None
    }

    /// The schema with a `TubeId: u64` key dimension prepended. Both the
    /// sparse and the celled on-disk bodies use this layout.
    pub fn with_tube_id(&self) -> Self {
        let mut dims = vec![Dim::new(TUBE_ID_DIM, DimType::Uint64)];
        dims.extend(self.dims.iter().cloned());
        Self::new(dims)
    }

    pub fn read_as_f64(&self, record: &[u8], name: &str) -> Option<f64> {
        let (offset, dim_type) = self.locate(name)?;
        record
            .get(offset..offset + dim_type.size())
            .map(|bytes| dim_type.read_f64(bytes))
    }

    pub fn write_f64(&self, record: &mut [u8], name: &str, value: f64) -> bool {
        let Some((offset, dim_type)) = self.locate(name) else {
            return false;
        };
        if record.len() < offset + dim_type.size() {
            return false;
        }
        dim_type.write_f64(value, &mut record[offset..]);
        true
    }

    /// X/Y/Z of one record; a dimension the schema lacks reads as zero.
    pub fn read_point(&self, record: &[u8]) -> Point {
        Point::new(
            self.read_as_f64(record, "X").unwrap_or(0.0),
            self.read_as_f64(record, "Y").unwrap_or(0.0),
            self.read_as_f64(record, "Z").unwrap_or(0.0),
        )
    }

    pub fn write_point(&self, record: &mut [u8], point: &Point) {
        self.write_f64(record, "X", point.x);
        self.write_f64(record, "Y", point.y);
        self.write_f64(record, "Z", point.z);
    }

    /// One record carrying the empty-coordinate sentinel in X/Y/Z and
    /// zeroes elsewhere, used for unpopulated dense slots.
    pub fn empty_record(&self) -> Vec<u8> {
        let mut record = vec![0u8; self.point_size()];
        self.write_point(&mut record, &Point::empty());
        record
    }

    /// Copy one dimension of `record` into `out` as `out_type`. A matching
    /// source type is copied bit-for-bit; otherwise the value converts
    /// numerically. Returns false when this schema lacks the dimension.
    pub fn copy_dim_into(
        &self,
        record: &[u8],
        name: &str,
        out_type: DimType,
        out: &mut [u8],
    ) -> bool {
        let Some((offset, dim_type)) = self.locate(name) else {
            return false;
        };
        let Some(src) = record.get(offset..offset + dim_type.size()) else {
            return false;
        };
        if dim_type == out_type {
            out[..dim_type.size()].copy_from_slice(src);
        } else {
            out_type.write_f64(dim_type.read_f64(src), out);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::EMPTY_COORD;

    fn mixed_schema() -> Schema {
        Schema::new(vec![
            Dim::new("X", DimType::Float64),
            Dim::new("Y", DimType::Float64),
            Dim::new("Z", DimType::Float64),
            Dim::new("Intensity", DimType::Uint16),
        ])
    }

    #[test]
    fn point_size_sums_dimension_sizes() {
        assert_eq!(Schema::xyz().point_size(), 24);
        assert_eq!(mixed_schema().point_size(), 26);
    }

    #[test]
    fn tube_id_schema_prepends_a_u64_key() {
        let celled = Schema::xyz().with_tube_id();
        assert_eq!(celled.point_size(), 32);
        assert_eq!(celled.dims()[0].name, TUBE_ID_DIM);
        assert_eq!(celled.read_as_f64(&[0u8; 32], TUBE_ID_DIM), Some(0.0));
    }

    #[test]
    fn point_round_trips_through_a_record() {
        let schema = mixed_schema();
        let mut record = vec![0u8; schema.point_size()];
        let point = Point::new(1.5, -2.25, 88.0);
        schema.write_point(&mut record, &point);
        schema.write_f64(&mut record, "Intensity", 41.0);

        assert_eq!(schema.read_point(&record), point);
        assert_eq!(schema.read_as_f64(&record, "Intensity"), Some(41.0));
        assert_eq!(schema.read_as_f64(&record, "Missing"), None);
    }

    #[test]
    fn empty_record_carries_the_sentinel() {
        let schema = Schema::xyz();
        let record = schema.empty_record();
        let point = schema.read_point(&record);
        assert_eq!(point.x, EMPTY_COORD);
        assert!(!point.exists());
    }

    #[test]
    fn copy_dim_is_bit_exact_for_matching_types() {
        let schema = Schema::xyz();
        let mut record = vec![0u8; schema.point_size()];
        schema.write_point(&mut record, &Point::new(0.1, 0.2, 0.3));

        let mut out = [0u8; 8];
        assert!(schema.copy_dim_into(&record, "Y", DimType::Float64, &mut out));
        assert_eq!(out, 0.2f64.to_le_bytes());

        let mut narrowed = [0u8; 4];
        assert!(schema.copy_dim_into(&record, "Y", DimType::Float32, &mut narrowed));
        assert_eq!(narrowed, 0.2f32.to_le_bytes());
    }
}
