use super::{chunk_key, finalize_ranges, range_check, ChunkError};
use crate::codec;
use crate::schema::Schema;
use crate::spatial::Point;
use crate::storage::Storage;
use crate::structure::ChunkIndex;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct CellRecord {
    point: Point,
    data: Vec<u8>,
}

/// Occupants of one base-level cell: the primary point plus any secondary
/// points keyed by their sub-tick.
#[derive(Debug, Default)]
struct Tube {
    primary: Option<CellRecord>,
    secondary: BTreeMap<u64, CellRecord>,
}

impl Tube {
    fn is_empty(&self) -> bool {
        self.primary.is_none()
    }

    fn records(&self) -> impl Iterator<Item = &CellRecord> {
        self.primary.iter().chain(self.secondary.values())
    }
}

/// Build-side base chunk: the always-resident span of the shallowest
/// depths, stored celled so every record carries its tube ID. A base whose
/// span extends past the structure's base depths is split by `finalize`
/// into the celled base prefix and dense cold chunks.
pub struct BaseChunk {
    schema: Schema,
    celled_schema: Schema,
    id: ChunkIndex,
    max_points: u64,
    tubes: Vec<Mutex<Tube>>,
}

impl BaseChunk {
    pub fn new(schema: Schema, id: ChunkIndex, max_points: u64) -> Self {
        let celled_schema = schema.with_tube_id();
        let tubes = (0..max_points).map(|_| Mutex::new(Tube::default())).collect();
        Self {
            schema,
            celled_schema,
            id,
            max_points,
            tubes,
        }
    }

    pub fn id(&self) -> ChunkIndex {
        self.id
    }

    pub fn max_points(&self) -> u64 {
        self.max_points
    }

    pub fn end_id(&self) -> ChunkIndex {
        self.id + self.max_points as u128
    }

    /// Add a point to the tube at `raw_index`. The first occupant becomes
    /// the primary; later ones become secondaries ordered by `sub_key`.
    pub fn insert(
        &self,
        raw_index: ChunkIndex,
        sub_key: u64,
        point: Point,
        record: &[u8],
    ) -> Result<(), ChunkError> {
        range_check(raw_index, self.id, self.max_points)?;
        let mut tube = self.tube((raw_index - self.id) as usize);
        let cell = CellRecord {
            point,
            data: record.to_vec(),
        };
        if tube.primary.is_none() {
            tube.primary = Some(cell);
        } else {
            tube.secondary.insert(sub_key, cell);
        }
        Ok(())
    }

    pub fn num_points(&self) -> u64 {
        (0..self.tubes.len())
            .map(|slot| {
                let tube = self.tube(slot);
                tube.primary.iter().count() as u64 + tube.secondary.len() as u64
            })
            .sum()
    }

    pub fn save(&self, storage: &dyn Storage) -> Result<(), ChunkError> {
        self.write_celled(storage, self.id, self.end_id())
    }

    /// Split at `start`: the celled prefix `[id, start)` under `id`, then
    /// dense slices of `chunk_points` cells (primary occupants only) under
    /// their chunk IDs. Returns the produced IDs in write order.
    pub fn finalize(
        &self,
        storage: &dyn Storage,
        start: ChunkIndex,
        chunk_points: u64,
    ) -> Result<Vec<ChunkIndex>, ChunkError> {
        let mut ids = Vec::new();
        for (begin, end) in finalize_ranges(self.id, self.end_id(), start, chunk_points) {
            if begin == self.id && start > self.id {
                self.write_celled(storage, begin, end)?;
            } else {
                self.write_dense(storage, begin, end)?;
            }
            ids.push(begin);
        }
        Ok(ids)
    }

    /// Celled body under key `begin`: `u64 tube-id || native record` per
    /// occupant, tubes in order, primaries before secondaries, framed like
    /// a sparse chunk.
    fn write_celled(
        &self,
        storage: &dyn Storage,
        begin: ChunkIndex,
        end: ChunkIndex,
    ) -> Result<(), ChunkError> {
        let mut body = Vec::new();
        let mut count = 0u64;
        for slot in (begin - self.id) as usize..(end - self.id) as usize {
            let tube = self.tube(slot);
            for cell in tube.records() {
                body.extend_from_slice(&(slot as u64).to_le_bytes());
                body.extend_from_slice(&cell.data);
                count += 1;
            }
        }

        let compressed = codec::compress(&body, &self.celled_schema)?;
        let sealed = codec::seal_sparse(compressed, count);
        storage.put(&chunk_key(begin), &sealed)?;
        Ok(())
    }

    /// Dense native body under key `begin`; cells past the base hold at
    /// most one point, so only primaries are written.
    fn write_dense(
        &self,
        storage: &dyn Storage,
        begin: ChunkIndex,
        end: ChunkIndex,
    ) -> Result<(), ChunkError> {
        let point_size = self.schema.point_size();
        let empty = self.schema.empty_record();

        let mut body = Vec::with_capacity((end - begin) as usize * point_size);
        for slot in (begin - self.id) as usize..(end - self.id) as usize {
            let tube = self.tube(slot);
            match &tube.primary {
                Some(cell) => body.extend_from_slice(&cell.data),
                None => body.extend_from_slice(&empty),
            }
        }

        let compressed = codec::compress(&body, &self.schema)?;
        let sealed = codec::seal_contiguous(compressed);
        storage.put(&chunk_key(begin), &sealed)?;
        Ok(())
    }

    fn tube(&self, slot: usize) -> MutexGuard<'_, Tube> {
        self.tubes[slot]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ChunkMarker;
    use crate::storage::MemoryStorage;

    fn record_for(schema: &Schema, point: &Point) -> Vec<u8> {
        let mut record = vec![0u8; schema.point_size()];
        schema.write_point(&mut record, point);
        record
    }

    #[test]
    fn first_occupant_is_primary_then_secondaries_accumulate() {
        let schema = Schema::xyz();
        let base = BaseChunk::new(schema.clone(), 0, 9);
        let point = Point::new(10.0, 10.0, 0.0);
        base.insert(3, 0, point, &record_for(&schema, &point))
            .expect("insert should succeed");
        base.insert(3, 7, point, &record_for(&schema, &point))
            .expect("insert should succeed");
        base.insert(3, 2, point, &record_for(&schema, &point))
            .expect("insert should succeed");
        assert_eq!(base.num_points(), 3);

        let tube = base.tube(3);
        assert!(!tube.is_empty());
        assert_eq!(tube.secondary.len(), 2);
    }

    #[test]
    fn finalize_writes_celled_prefix_and_dense_cold_slices() {
        let schema = Schema::xyz();
        let storage = MemoryStorage::new();
        // Span covering base cells [0, 9) plus one cold chunk [9, 73).
        let base = BaseChunk::new(schema.clone(), 0, 73);

        let shallow = Point::new(10.0, 10.0, 0.0);
        base.insert(1, 0, shallow, &record_for(&schema, &shallow))
            .expect("insert should succeed");
        let deep = Point::new(90.0, 90.0, 90.0);
        base.insert(72, 0, deep, &record_for(&schema, &deep))
            .expect("insert should succeed");

        let ids = base
            .finalize(&storage, 9, 64)
            .expect("finalize should succeed");
        assert_eq!(ids, vec![0, 9]);

        let prefix = storage.get("0").expect("base blob should exist");
        assert_eq!(*prefix.last().expect("marker"), ChunkMarker::SPARSE);

        let cold = storage.get("9").expect("cold blob should exist");
        assert_eq!(*cold.last().expect("marker"), ChunkMarker::CONTIGUOUS);

        // The dense slice restores the deep point at its slot.
        let restored = crate::chunk::Chunk::from_stored(schema, 9, 64, cold)
            .expect("decode should succeed");
        let (point, _) = restored
            .entry(72)
            .expect("slot should exist")
            .load()
            .expect("slot should be populated");
        assert_eq!(point, deep);
    }
}
