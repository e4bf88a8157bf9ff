use super::{chunk_key, range_check, CellEntry, ChunkError};
use crate::codec;
use crate::schema::Schema;
use crate::storage::Storage;
use crate::structure::ChunkIndex;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

type EntryMap = BTreeMap<ChunkIndex, Arc<CellEntry>>;

/// Chunk form for low occupancy: a keyed map of touched cells. The map
/// mutex guards membership only; record writes take the slot lock.
pub struct SparseChunk {
    schema: Schema,
    sparse_schema: Schema,
    id: ChunkIndex,
    max_points: u64,
    entries: Mutex<EntryMap>,
}

impl SparseChunk {
    pub fn new(schema: Schema, id: ChunkIndex, max_points: u64) -> Self {
        let sparse_schema = schema.with_tube_id();
        Self {
            schema,
            sparse_schema,
            id,
            max_points,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Rebuild from a compressed sparse body (trailer already popped).
    pub(crate) fn from_compressed(
        schema: Schema,
        id: ChunkIndex,
        max_points: u64,
        num_points: u64,
        body: &[u8],
    ) -> Result<Self, ChunkError> {
        let chunk = Self::new(schema, id, max_points);
        let sparse_point_size = chunk.sparse_schema.point_size();
        let squashed = codec::decompress(
            body,
            &chunk.sparse_schema,
            num_points as usize * sparse_point_size,
        )?;

        let mut entries = BTreeMap::new();
        for record in squashed.chunks_exact(sparse_point_size) {
            let key = u64::from_le_bytes(record[..8].try_into().expect("8-byte key")) as u128;
            let native = record[8..].to_vec();
            let point = chunk.schema.read_point(&native);
            let entry = CellEntry::restored(point.exists().then_some(point), native);
            entries.insert(key, Arc::new(entry));
        }
        *chunk.entries_mut() = entries;
        Ok(chunk)
    }

    pub fn id(&self) -> ChunkIndex {
        self.id
    }

    pub fn max_points(&self) -> u64 {
        self.max_points
    }

    pub fn num_points(&self) -> u64 {
        self.entries_mut().len() as u64
    }

    /// Slot handle for `raw_index`, lazily inserting an empty entry.
    pub fn entry(&self, raw_index: ChunkIndex) -> Result<Arc<CellEntry>, ChunkError> {
        range_check(raw_index, self.id, self.max_points)?;
        let mut entries = self.entries_mut();
        let entry = entries
            .entry(raw_index)
            .or_insert_with(|| Arc::new(CellEntry::with_record(self.schema.empty_record())));
        Ok(entry.clone())
    }

    /// Persist the entries of `[begin, end)` under key `begin`: ascending
    /// `u64 key || native record` pairs, compressed, with the in-range
    /// entry count and the sparse marker appended.
    pub(crate) fn write_range(
        &self,
        storage: &dyn Storage,
        begin: ChunkIndex,
        end: ChunkIndex,
    ) -> Result<(), ChunkError> {
        let (squashed, count) = self.squash(begin, end)?;
        let compressed = codec::compress(&squashed, &self.sparse_schema)?;
        let sealed = codec::seal_sparse(compressed, count);
        storage.put(&chunk_key(begin), &sealed)?;
        Ok(())
    }

    fn squash(&self, begin: ChunkIndex, end: ChunkIndex) -> Result<(Vec<u8>, u64), ChunkError> {
        let entries = self.entries_mut();
        let mut squashed = Vec::new();
        let mut count = 0u64;
        for (&key, entry) in entries.range(begin..end) {
            let stored_key = u64::try_from(key).map_err(|_| ChunkError::KeyOverflow(key))?;
            squashed.extend_from_slice(&stored_key.to_le_bytes());
            squashed.extend_from_slice(&entry.snapshot_record());
            count += 1;
        }
        Ok((squashed, count))
    }

    fn entries_mut(&self) -> MutexGuard<'_, EntryMap> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::codec::ChunkMarker;
    use crate::spatial::Point;
    use crate::storage::MemoryStorage;

    fn store_point(chunk: &Chunk, raw_index: ChunkIndex, x: f64) {
        let schema = Schema::xyz();
        let mut record = vec![0u8; schema.point_size()];
        let point = Point::new(x, x + 0.5, 0.0);
        schema.write_point(&mut record, &point);
        chunk
            .entry(raw_index)
            .expect("index should be in range")
            .store(point, &record);
    }

    #[test]
    fn sparse_blob_carries_count_and_marker() {
        let storage = MemoryStorage::new();
        let chunk = Chunk::new(Schema::xyz(), 1000, 64);
        for raw_index in [1001u128, 1005, 1063] {
            store_point(&chunk, raw_index, raw_index as f64);
        }
        chunk.save(&storage).expect("save should succeed");

        let blob = storage.get("1000").expect("chunk blob should exist");
        assert_eq!(*blob.last().expect("marker"), ChunkMarker::SPARSE);
        let count_at = blob.len() - 9;
        assert_eq!(
            u64::from_le_bytes(blob[count_at..blob.len() - 1].try_into().expect("count")),
            3
        );
    }

    #[test]
    fn sparse_round_trip_restores_entries_in_key_order() {
        let storage = MemoryStorage::new();
        let chunk = Chunk::new(Schema::xyz(), 1000, 64);
        // Insert out of order; the squash sorts by key.
        for raw_index in [1063u128, 1001, 1005] {
            store_point(&chunk, raw_index, raw_index as f64);
        }
        chunk.save(&storage).expect("save should succeed");

        let blob = storage.get("1000").expect("chunk blob should exist");
        let restored =
            Chunk::from_stored(Schema::xyz(), 1000, 64, blob).expect("decode should succeed");
        assert!(restored.is_sparse());
        assert_eq!(restored.num_points(), 3);

        for raw_index in [1001u128, 1005, 1063] {
            let entry = restored.entry(raw_index).expect("entry should exist");
            let (point, data) = entry.load().expect("entry should be populated");
            assert_eq!(point.x, raw_index as f64);
            assert_eq!(data.len(), Schema::xyz().point_size());
        }
        assert_eq!(restored.num_points(), 3, "reads must not add entries");
    }

    #[test]
    fn entry_rejects_out_of_span_indexes() {
        let chunk = SparseChunk::new(Schema::xyz(), 1000, 64);
        assert!(matches!(
            chunk.entry(999),
            Err(ChunkError::SlotOutOfRange { .. })
        ));
        assert!(matches!(
            chunk.entry(1064),
            Err(ChunkError::SlotOutOfRange { .. })
        ));
    }
}
