use crate::codec::CodecError;
use crate::schema::Schema;
use crate::spatial::Point;
use crate::storage::{Storage, StorageError};
use crate::structure::ChunkIndex;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

mod base;
mod cell_reader;
mod contiguous;
mod sparse;

pub use base::BaseChunk;
pub use cell_reader::{CellReader, ContiguousReader, SparseReader};
pub use contiguous::ContiguousChunk;
pub use sparse::SparseChunk;

/// Storage key of a chunk: the decimal form of its ID.
pub fn chunk_key(id: ChunkIndex) -> String {
    id.to_string()
}

/// Occupancy ratio above which a contiguous layout beats the per-entry key
/// overhead of the sparse form. Strictly inside (0, 1) for any schema.
pub fn sparse_occupancy_threshold(schema: &Schema) -> f64 {
    let point_size = schema.point_size() as f64;
    point_size / (point_size + std::mem::size_of::<u64>() as f64)
}

#[derive(Debug)]
pub enum ChunkError {
    Codec(CodecError),
    Storage(StorageError),
    SlotOutOfRange {
        index: ChunkIndex,
        id: ChunkIndex,
        max_points: u64,
    },
    /// A raw index too deep to persist as the u64 key of a sparse record.
    KeyOverflow(ChunkIndex),
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(error) => write!(f, "{error}"),
            Self::Storage(error) => write!(f, "{error}"),
            Self::SlotOutOfRange {
                index,
                id,
                max_points,
            } => write!(
                f,
                "raw index {index} outside chunk span [{id}, {})",
                id + *max_points as u128
            ),
            Self::KeyOverflow(index) => {
                write!(f, "raw index {index} does not fit a sparse record key")
            }
        }
    }
}

impl std::error::Error for ChunkError {}

impl From<CodecError> for ChunkError {
    fn from(value: CodecError) -> Self {
        Self::Codec(value)
    }
}

impl From<StorageError> for ChunkError {
    fn from(value: StorageError) -> Self {
        Self::Storage(value)
    }
}

/// One cell slot: record bytes plus occupancy, published under the slot
/// lock so builder threads may race on distinct cells.
#[derive(Debug)]
pub struct CellSlot {
    pub point: Option<Point>,
    pub data: Vec<u8>,
}

#[derive(Debug)]
pub struct CellEntry {
    slot: Mutex<CellSlot>,
}

impl CellEntry {
    fn with_record(data: Vec<u8>) -> Self {
        Self {
            slot: Mutex::new(CellSlot { point: None, data }),
        }
    }

    fn restored(point: Option<Point>, data: Vec<u8>) -> Self {
        Self {
            slot: Mutex::new(CellSlot { point, data }),
        }
    }

    pub fn store(&self, point: Point, record: &[u8]) {
        let mut slot = self.lock();
        slot.data.clear();
        slot.data.extend_from_slice(record);
        slot.point = Some(point);
    }

    pub fn load(&self) -> Option<(Point, Vec<u8>)> {
        let slot = self.lock();
        slot.point.map(|point| (point, slot.data.clone()))
    }

    pub fn is_populated(&self) -> bool {
        self.lock().point.is_some()
    }

    /// Record bytes regardless of occupancy; unpopulated slots keep their
    /// initial sentinel record.
    pub(crate) fn snapshot_record(&self) -> Vec<u8> {
        self.lock().data.clone()
    }

    fn lock(&self) -> MutexGuard<'_, CellSlot> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A fixed-capacity bucket of octree cells in one of its two in-memory
/// forms. New cold chunks start sparse; the contiguous form is restored
/// from storage or chosen explicitly.
pub enum Chunk {
    Sparse(SparseChunk),
    Contiguous(ContiguousChunk),
}

impl Chunk {
    pub fn new(schema: Schema, id: ChunkIndex, max_points: u64) -> Self {
        Self::Sparse(SparseChunk::new(schema, id, max_points))
    }

    pub fn contiguous(schema: Schema, id: ChunkIndex, max_points: u64) -> Self {
        Self::Contiguous(ContiguousChunk::new(schema, id, max_points))
    }

    /// Rebuild the in-memory form a persisted blob encodes, dispatching on
    /// its trailing marker.
    pub fn from_stored(
        schema: Schema,
        id: ChunkIndex,
        max_points: u64,
        bytes: Vec<u8>,
    ) -> Result<Self, ChunkError> {
        let unsealed = crate::codec::unseal(bytes)?;
        match unsealed.marker {
            crate::codec::ChunkMarker::Sparse => {
                let num_points = unsealed.num_points.unwrap_or(0);
                SparseChunk::from_compressed(schema, id, max_points, num_points, &unsealed.body)
                    .map(Self::Sparse)
            }
            crate::codec::ChunkMarker::Contiguous => {
                ContiguousChunk::from_compressed(schema, id, max_points, &unsealed.body)
                    .map(Self::Contiguous)
            }
        }
    }

    pub fn id(&self) -> ChunkIndex {
        match self {
            Self::Sparse(chunk) => chunk.id(),
            Self::Contiguous(chunk) => chunk.id(),
        }
    }

    pub fn max_points(&self) -> u64 {
        match self {
            Self::Sparse(chunk) => chunk.max_points(),
            Self::Contiguous(chunk) => chunk.max_points(),
        }
    }

    pub fn end_id(&self) -> ChunkIndex {
        self.id() + self.max_points() as u128
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, Self::Sparse(_))
    }

    pub fn num_points(&self) -> u64 {
        match self {
            Self::Sparse(chunk) => chunk.num_points(),
            Self::Contiguous(chunk) => chunk.num_points(),
        }
    }

    /// Slot handle for `raw_index`. The sparse form lazily inserts an
    /// empty entry on first access.
    pub fn entry(&self, raw_index: ChunkIndex) -> Result<Arc<CellEntry>, ChunkError> {
        match self {
            Self::Sparse(chunk) => chunk.entry(raw_index),
            Self::Contiguous(chunk) => chunk.entry(raw_index),
        }
    }

    /// Persist the whole chunk under its own ID.
    pub fn save(&self, storage: &dyn Storage) -> Result<(), ChunkError> {
        match self {
            Self::Sparse(chunk) => chunk.write_range(storage, chunk.id(), self.end_id()),
            Self::Contiguous(chunk) => chunk.write_range(storage, chunk.id(), self.end_id()),
        }
    }

    /// Split the chunk at `start`: an optional prefix `[id, start)` written
    /// under `id`, then slices of `chunk_points` cells each written under
    /// their first cell. Returns the produced IDs in write order; callers
    /// aggregate them, so finalizes of distinct chunks may run in parallel.
    pub fn finalize(
        &self,
        storage: &dyn Storage,
        start: ChunkIndex,
        chunk_points: u64,
    ) -> Result<Vec<ChunkIndex>, ChunkError> {
        let mut ids = Vec::new();
        for (begin, end) in finalize_ranges(self.id(), self.end_id(), start, chunk_points) {
            match self {
                Self::Sparse(chunk) => chunk.write_range(storage, begin, end)?,
                Self::Contiguous(chunk) => chunk.write_range(storage, begin, end)?,
            }
            ids.push(begin);
        }
        Ok(ids)
    }
}

/// `(begin, end)` write ranges for a finalize: the prefix before `start`,
/// then `chunk_points`-sized slices to the end of the span.
pub(crate) fn finalize_ranges(
    id: ChunkIndex,
    end_id: ChunkIndex,
    start: ChunkIndex,
    chunk_points: u64,
) -> Vec<(ChunkIndex, ChunkIndex)> {
    let mut ranges = Vec::new();
    if start > id {
        ranges.push((id, start.min(end_id)));
    }
    let mut begin = start.max(id);
    while begin < end_id {
        let end = (begin + chunk_points as u128).min(end_id);
        ranges.push((begin, end));
        begin = end;
    }
    ranges
}

pub(crate) fn range_check(
    raw_index: ChunkIndex,
    id: ChunkIndex,
    max_points: u64,
) -> Result<(), ChunkError> {
    if raw_index < id || raw_index >= id + max_points as u128 {
        return Err(ChunkError::SlotOutOfRange {
            index: raw_index,
            id,
            max_points,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Dim, DimType};

    #[test]
    fn threshold_stays_inside_the_unit_interval() {
        let schemas = [
            Schema::new(vec![Dim::new("X", DimType::Uint8)]),
            Schema::xyz(),
            Schema::xyz().with_tube_id(),
        ];
        for schema in &schemas {
            let threshold = sparse_occupancy_threshold(schema);
            assert!(threshold > 0.0 && threshold < 1.0, "threshold {threshold}");
        }
        // 24-byte records against an 8-byte key.
        assert_eq!(sparse_occupancy_threshold(&Schema::xyz()), 0.75);
    }

    #[test]
    fn finalize_ranges_split_prefix_then_slices() {
        assert_eq!(
            finalize_ranges(0, 73, 9, 64),
            vec![(0, 9), (9, 73)]
        );
        // No prefix when the split starts at the chunk.
        assert_eq!(finalize_ranges(9, 73, 9, 64), vec![(9, 73)]);
        // Multiple slices.
        assert_eq!(
            finalize_ranges(73, 585, 73, 256),
            vec![(73, 329), (329, 585)]
        );
    }

    #[test]
    fn finalize_writes_each_slice_under_its_first_cell() {
        let storage = crate::storage::MemoryStorage::new();
        let schema = Schema::xyz();
        let chunk = Chunk::contiguous(schema.clone(), 9, 128);

        let point = Point::new(90.0, 90.0, 90.0);
        let mut record = vec![0u8; schema.point_size()];
        schema.write_point(&mut record, &point);
        chunk
            .entry(100)
            .expect("index should be in range")
            .store(point, &record);

        let ids = chunk
            .finalize(&storage, 9, 64)
            .expect("finalize should succeed");
        assert_eq!(ids, vec![9, 73]);

        let second = Chunk::from_stored(
            schema,
            73,
            64,
            storage.get("73").expect("slice blob should exist"),
        )
        .expect("decode should succeed");
        assert_eq!(second.num_points(), 1);
        assert!(second
            .entry(100)
            .expect("slot should exist")
            .is_populated());
    }

    #[test]
    fn cell_entry_publishes_occupancy_with_the_record() {
        let entry = CellEntry::with_record(vec![0u8; 4]);
        assert!(!entry.is_populated());
        assert!(entry.load().is_none());

        entry.store(Point::new(1.0, 2.0, 3.0), &[9, 9, 9, 9]);
        let (point, data) = entry.load().expect("entry should be populated");
        assert_eq!(point, Point::new(1.0, 2.0, 3.0));
        assert_eq!(data, vec![9, 9, 9, 9]);
    }
}
