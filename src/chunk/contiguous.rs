use super::{chunk_key, range_check, CellEntry, ChunkError};
use crate::codec;
use crate::schema::Schema;
use crate::storage::Storage;
use crate::structure::ChunkIndex;
use std::sync::Arc;

/// Chunk form for high occupancy: one slot per cell of the span, in order.
/// Unpopulated slots keep the empty-coordinate sentinel record so the dense
/// body always encodes exactly `max_points` records.
pub struct ContiguousChunk {
    schema: Schema,
    id: ChunkIndex,
    max_points: u64,
    slots: Vec<Arc<CellEntry>>,
}

impl ContiguousChunk {
    pub fn new(schema: Schema, id: ChunkIndex, max_points: u64) -> Self {
        let slots = (0..max_points)
            .map(|_| Arc::new(CellEntry::with_record(schema.empty_record())))
            .collect();
        Self {
            schema,
            id,
            max_points,
            slots,
        }
    }

    /// Rebuild from a compressed dense body (trailer already popped).
    pub(crate) fn from_compressed(
        schema: Schema,
        id: ChunkIndex,
        max_points: u64,
        body: &[u8],
    ) -> Result<Self, ChunkError> {
        let point_size = schema.point_size();
        let data = codec::decompress(body, &schema, max_points as usize * point_size)?;

        let slots = data
            .chunks_exact(point_size)
            .map(|record| {
                let point = schema.read_point(record);
                Arc::new(CellEntry::restored(
                    point.exists().then_some(point),
                    record.to_vec(),
                ))
            })
            .collect();
        Ok(Self {
            schema,
            id,
            max_points,
            slots,
        })
    }

    pub fn id(&self) -> ChunkIndex {
        self.id
    }

    pub fn max_points(&self) -> u64 {
        self.max_points
    }

    pub fn num_points(&self) -> u64 {
        self.slots
            .iter()
            .filter(|slot| slot.is_populated())
            .count() as u64
    }

    pub fn entry(&self, raw_index: ChunkIndex) -> Result<Arc<CellEntry>, ChunkError> {
        range_check(raw_index, self.id, self.max_points)?;
        Ok(self.slots[(raw_index - self.id) as usize].clone())
    }

    /// Persist the dense records of `[begin, end)` under key `begin`.
    pub(crate) fn write_range(
        &self,
        storage: &dyn Storage,
        begin: ChunkIndex,
        end: ChunkIndex,
    ) -> Result<(), ChunkError> {
        let from = (begin - self.id) as usize;
        let to = (end - self.id) as usize;

        let mut body = Vec::with_capacity((to - from) * self.schema.point_size());
        for slot in &self.slots[from..to] {
            body.extend_from_slice(&slot.snapshot_record());
        }

        let compressed = codec::compress(&body, &self.schema)?;
        let sealed = codec::seal_contiguous(compressed);
        storage.put(&chunk_key(begin), &sealed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::codec::ChunkMarker;
    use crate::spatial::{Point, EMPTY_COORD};
    use crate::storage::MemoryStorage;

    fn store_point(chunk: &Chunk, raw_index: ChunkIndex, point: Point) {
        let schema = Schema::xyz();
        let mut record = vec![0u8; schema.point_size()];
        schema.write_point(&mut record, &point);
        chunk
            .entry(raw_index)
            .expect("index should be in range")
            .store(point, &record);
    }

    #[test]
    fn dense_round_trip_keeps_slot_order_and_sentinels() {
        let storage = MemoryStorage::new();
        let chunk = Chunk::contiguous(Schema::xyz(), 0, 4);
        store_point(&chunk, 0, Point::new(1.0, 1.0, 0.0));
        store_point(&chunk, 1, Point::new(2.0, 2.0, 0.0));
        store_point(&chunk, 3, Point::new(3.0, 3.0, 0.0));
        chunk.save(&storage).expect("save should succeed");

        let blob = storage.get("0").expect("chunk blob should exist");
        assert_eq!(*blob.last().expect("marker"), ChunkMarker::CONTIGUOUS);

        let restored =
            Chunk::from_stored(Schema::xyz(), 0, 4, blob).expect("decode should succeed");
        assert!(!restored.is_sparse());
        assert_eq!(restored.num_points(), 3);

        // Slot 2 decodes as the sentinel record.
        let empty = restored.entry(2).expect("slot should exist");
        assert!(!empty.is_populated());
        assert_eq!(
            Schema::xyz().read_point(&empty.snapshot_record()).x,
            EMPTY_COORD
        );

        let (point, _) = restored
            .entry(3)
            .expect("slot should exist")
            .load()
            .expect("slot should be populated");
        assert_eq!(point, Point::new(3.0, 3.0, 0.0));
    }

    #[test]
    fn decode_rejects_a_truncated_body() {
        let schema = Schema::xyz();
        let chunk = ContiguousChunk::new(schema.clone(), 0, 4);
        let storage = MemoryStorage::new();
        chunk
            .write_range(&storage, 0, 4)
            .expect("write should succeed");

        let blob = storage.get("0").expect("chunk blob should exist");
        // Claim a larger span than the body encodes.
        assert!(matches!(
            Chunk::from_stored(schema, 0, 8, blob),
            Err(ChunkError::Codec(codec::CodecError::CorruptChunk(_)))
        ));
    }
}
