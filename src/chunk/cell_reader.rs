use super::ChunkError;
use crate::codec::{self, ChunkMarker};
use crate::schema::Schema;
use crate::structure::ChunkIndex;
use std::collections::BTreeMap;

/// Read-only sparse form: native records keyed by raw cell index.
pub struct SparseReader {
    entries: BTreeMap<ChunkIndex, Vec<u8>>,
}

impl SparseReader {
    fn from_compressed(
        schema: &Schema,
        num_points: u64,
        body: &[u8],
    ) -> Result<Self, ChunkError> {
        let sparse_schema = schema.with_tube_id();
        let sparse_point_size = sparse_schema.point_size();
        let squashed = codec::decompress(
            body,
            &sparse_schema,
            num_points as usize * sparse_point_size,
        )?;

        let mut entries = BTreeMap::new();
        for record in squashed.chunks_exact(sparse_point_size) {
            let key = u64::from_le_bytes(record[..8].try_into().expect("8-byte key")) as u128;
            entries.insert(key, record[8..].to_vec());
        }
        Ok(Self { entries })
    }

    pub fn get_data(&self, raw_index: ChunkIndex) -> Option<&[u8]> {
        self.entries.get(&raw_index).map(Vec::as_slice)
    }
}

/// Read-only contiguous form: the dense record array, slots addressed by
/// offset from the chunk ID. Sentinel slots are returned as stored; callers
/// check point existence.
pub struct ContiguousReader {
    id: ChunkIndex,
    max_points: u64,
    point_size: usize,
    data: Vec<u8>,
}

impl ContiguousReader {
    fn from_compressed(
        schema: &Schema,
        id: ChunkIndex,
        max_points: u64,
        body: &[u8],
    ) -> Result<Self, ChunkError> {
        let point_size = schema.point_size();
        let data = codec::decompress(body, schema, max_points as usize * point_size)?;
        Ok(Self {
            id,
            max_points,
            point_size,
            data,
        })
    }

    pub fn get_data(&self, raw_index: ChunkIndex) -> Option<&[u8]> {
        if raw_index < self.id || raw_index >= self.id + self.max_points as u128 {
            return None;
        }
        let offset = (raw_index - self.id) as usize * self.point_size;
        Some(&self.data[offset..offset + self.point_size])
    }
}

/// Immutable cell-addressed view of a persisted chunk, dispatched on the
/// trailing marker.
pub enum CellReader {
    Sparse(SparseReader),
    Contiguous(ContiguousReader),
}

impl CellReader {
    pub fn create(
        schema: &Schema,
        id: ChunkIndex,
        max_points: u64,
        bytes: Vec<u8>,
    ) -> Result<Self, ChunkError> {
        let unsealed = codec::unseal(bytes)?;
        match unsealed.marker {
            ChunkMarker::Sparse => {
                let num_points = unsealed.num_points.unwrap_or(0);
                SparseReader::from_compressed(schema, num_points, &unsealed.body).map(Self::Sparse)
            }
            ChunkMarker::Contiguous => {
                ContiguousReader::from_compressed(schema, id, max_points, &unsealed.body)
                    .map(Self::Contiguous)
            }
        }
    }

    pub fn get_data(&self, raw_index: ChunkIndex) -> Option<&[u8]> {
        match self {
            Self::Sparse(reader) => reader.get_data(raw_index),
            Self::Contiguous(reader) => reader.get_data(raw_index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::spatial::Point;
    use crate::storage::{MemoryStorage, Storage};

    fn stored_chunk(chunk: &Chunk, indexes: &[ChunkIndex]) -> Vec<u8> {
        let schema = Schema::xyz();
        for &raw_index in indexes {
            let point = Point::new(raw_index as f64, 1.0, 2.0);
            let mut record = vec![0u8; schema.point_size()];
            schema.write_point(&mut record, &point);
            chunk
                .entry(raw_index)
                .expect("index should be in range")
                .store(point, &record);
        }
        let storage = MemoryStorage::new();
        chunk.save(&storage).expect("save should succeed");
        storage
            .get(&chunk.id().to_string())
            .expect("blob should exist")
    }

    #[test]
    fn sparse_reader_exposes_exactly_the_stored_keys() {
        let schema = Schema::xyz();
        let chunk = Chunk::new(schema.clone(), 1000, 64);
        let blob = stored_chunk(&chunk, &[1001, 1063]);

        let reader = CellReader::create(&schema, 1000, 64, blob).expect("create should succeed");
        assert!(matches!(reader, CellReader::Sparse(_)));
        let record = reader.get_data(1001).expect("stored key should resolve");
        assert_eq!(schema.read_point(record).x, 1001.0);
        assert!(reader.get_data(1002).is_none());
    }

    #[test]
    fn contiguous_reader_addresses_slots_by_offset() {
        let schema = Schema::xyz();
        let chunk = Chunk::contiguous(schema.clone(), 8, 8);
        let blob = stored_chunk(&chunk, &[10]);

        let reader = CellReader::create(&schema, 8, 8, blob).expect("create should succeed");
        assert!(matches!(reader, CellReader::Contiguous(_)));
        let record = reader.get_data(10).expect("slot should resolve");
        assert_eq!(schema.read_point(record).x, 10.0);
        // In-range sentinel slot still yields its record.
        let sentinel = reader.get_data(9).expect("slot should resolve");
        assert!(!schema.read_point(sentinel).exists());
        assert!(reader.get_data(16).is_none());
    }
}
