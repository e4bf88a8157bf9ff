use crate::chunk::ChunkError;
use crate::climb::tick;
use crate::codec::{self, ChunkMarker, CodecError};
use crate::schema::Schema;
use crate::spatial::{Bounds, Point};
use crate::structure::ChunkIndex;

/// One candidate point: its coordinates, its native record bytes, and its
/// tick under the chunk's depth.
#[derive(Clone, Copy, Debug)]
pub struct PointInfo<'a> {
    pub point: Point,
    pub data: &'a [u8],
    pub tick: u64,
}

#[derive(Clone, Copy, Debug)]
struct PointSlot {
    point: Point,
    tick: u64,
    offset: usize,
}

/// Immutable query-time view of one cold chunk: every point with its tick,
/// sorted by tick so a query box reduces to one contiguous candidate range.
pub struct ChunkReader {
    data: Vec<u8>,
    slots: Vec<PointSlot>,
    bounds: Bounds,
    depth: u64,
    is_3d: bool,
    point_size: usize,
}

impl ChunkReader {
    /// Decode a persisted cold chunk. Sparse bodies contribute every
    /// record; dense bodies contribute the slots whose point exists.
    pub fn new(
        schema: &Schema,
        bounds_cubic: &Bounds,
        depth: u64,
        is_3d: bool,
        max_points: u64,
        bytes: Vec<u8>,
    ) -> Result<Self, ChunkError> {
        let point_size = schema.point_size();
        let unsealed = codec::unseal(bytes)?;

        let mut data = Vec::new();
        let mut points = Vec::new();
        match unsealed.marker {
            ChunkMarker::Sparse => {
                let sparse_schema = schema.with_tube_id();
                let sparse_point_size = sparse_schema.point_size();
                let num_points = unsealed.num_points.unwrap_or(0) as usize;
                let squashed = codec::decompress(
                    &unsealed.body,
                    &sparse_schema,
                    num_points * sparse_point_size,
                )?;
                data.reserve(num_points * point_size);
                for record in squashed.chunks_exact(sparse_point_size) {
                    let native = &record[8..];
                    points.push(schema.read_point(native));
                    data.extend_from_slice(native);
                }
            }
            ChunkMarker::Contiguous => {
                let dense =
                    codec::decompress(&unsealed.body, schema, max_points as usize * point_size)?;
                for record in dense.chunks_exact(point_size) {
                    let point = schema.read_point(record);
                    if point.exists() {
                        points.push(point);
                        data.extend_from_slice(record);
                    }
                }
            }
        }

        let mut slots: Vec<PointSlot> = points
            .into_iter()
            .enumerate()
            .map(|(i, point)| PointSlot {
                point,
                tick: tick(&point, bounds_cubic, depth, is_3d),
                offset: i * point_size,
            })
            .collect();
        slots.sort_by_key(|slot| slot.tick);

        Ok(Self {
            data,
            slots,
            bounds: *bounds_cubic,
            depth,
            is_3d,
            point_size,
        })
    }

    pub fn num_points(&self) -> usize {
        self.slots.len()
    }

    /// The contiguous tick range covering `query_bounds`: a superset of the
    /// contained points, so callers still test containment per candidate.
    pub fn candidates(&self, query_bounds: &Bounds) -> Candidates<'_> {
        let tick_min = tick(&query_bounds.min, &self.bounds, self.depth, self.is_3d);
        let tick_max = tick(&query_bounds.max, &self.bounds, self.depth, self.is_3d);

        let begin = self.slots.partition_point(|slot| slot.tick < tick_min);
        let end = self.slots.partition_point(|slot| slot.tick <= tick_max);
        Candidates {
            reader: self,
            next: begin,
            end: end.max(begin),
        }
    }

    fn point_info(&self, slot: &PointSlot) -> PointInfo<'_> {
        PointInfo {
            point: slot.point,
            data: &self.data[slot.offset..slot.offset + self.point_size],
            tick: slot.tick,
        }
    }
}

pub struct Candidates<'a> {
    reader: &'a ChunkReader,
    next: usize,
    end: usize,
}

impl<'a> Iterator for Candidates<'a> {
    type Item = PointInfo<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let slot = &self.reader.slots[self.next];
        self.next += 1;
        Some(self.reader.point_info(slot))
    }
}

/// One occupant of a base tube.
#[derive(Clone, Copy, Debug)]
pub struct TubeCell {
    pub point: Point,
    offset: usize,
}

/// The occupants of one base cell, primary first.
#[derive(Debug, Default)]
pub struct Tube {
    cells: Vec<TubeCell>,
}

impl Tube {
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cells(&self) -> &[TubeCell] {
        &self.cells
    }

    pub fn primary(&self) -> Option<&TubeCell> {
        self.cells.first()
    }
}

/// The always-resident base chunk, decoded from its celled body into one
/// tube per cell. Lookup is by cell ID; no tick sorting is involved.
pub struct BaseChunkReader {
    data: Vec<u8>,
    tubes: Vec<Tube>,
    id: ChunkIndex,
    point_size: usize,
}

impl BaseChunkReader {
    pub fn new(
        schema: &Schema,
        id: ChunkIndex,
        span: u64,
        bytes: Vec<u8>,
    ) -> Result<Self, ChunkError> {
        let unsealed = codec::unseal(bytes)?;
        if unsealed.marker != ChunkMarker::Sparse {
            return Err(CodecError::CorruptChunk(
                "base chunk body must be celled".to_string(),
            )
            .into());
        }

        let celled_schema = schema.with_tube_id();
        let celled_point_size = celled_schema.point_size();
        let num_points = unsealed.num_points.unwrap_or(0) as usize;
        let data = codec::decompress(
            &unsealed.body,
            &celled_schema,
            num_points * celled_point_size,
        )?;

        let mut tubes: Vec<Tube> = (0..span).map(|_| Tube::default()).collect();
        for (i, record) in data.chunks_exact(celled_point_size).enumerate() {
            let tube_id = u64::from_le_bytes(record[..8].try_into().expect("8-byte tube id"));
            let tube = tubes.get_mut(tube_id as usize).ok_or_else(|| {
                CodecError::CorruptChunk(format!("tube id {tube_id} outside base span {span}"))
            })?;
            tube.cells.push(TubeCell {
                point: schema.read_point(&record[8..]),
                offset: i * celled_point_size + 8,
            });
        }

        Ok(Self {
            data,
            tubes,
            id,
            point_size: schema.point_size(),
        })
    }

    pub fn span(&self) -> u64 {
        self.tubes.len() as u64
    }

    /// Tube for an absolute base cell ID; `None` outside the span.
    pub fn tube(&self, index: ChunkIndex) -> Option<&Tube> {
        if index < self.id {
            return None;
        }
        self.tubes.get((index - self.id) as usize)
    }

    pub fn point_info(&self, cell: &TubeCell) -> PointInfo<'_> {
        PointInfo {
            point: cell.point,
            data: &self.data[cell.offset..cell.offset + self.point_size],
            tick: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{BaseChunk, Chunk};
    use crate::storage::{MemoryStorage, Storage};

    fn cube() -> Bounds {
        Bounds::new(Point::new(0.0, 0.0, 0.0), Point::new(100.0, 100.0, 100.0))
    }

    fn stored_sparse(points: &[Point]) -> Vec<u8> {
        let schema = Schema::xyz();
        let chunk = Chunk::new(schema.clone(), 9, 64);
        for (i, point) in points.iter().enumerate() {
            let mut record = vec![0u8; schema.point_size()];
            schema.write_point(&mut record, point);
            chunk
                .entry(9 + i as u128)
                .expect("index should be in range")
                .store(*point, &record);
        }
        let storage = MemoryStorage::new();
        chunk.save(&storage).expect("save should succeed");
        storage.get("9").expect("blob should exist")
    }

    #[test]
    fn candidates_cover_the_tick_range_and_nothing_outside() {
        // Diagonal cells at depth 2 carry ticks 0, 7, 56, 63.
        let points = [
            Point::new(10.0, 10.0, 10.0),
            Point::new(30.0, 30.0, 30.0),
            Point::new(60.0, 60.0, 60.0),
            Point::new(90.0, 90.0, 90.0),
        ];
        let reader = ChunkReader::new(&Schema::xyz(), &cube(), 2, true, 64, stored_sparse(&points))
            .expect("decode should succeed");
        assert_eq!(reader.num_points(), 4);

        // Tight diagonal box: tick range [7, 56].
        let query = Bounds::new(Point::new(30.0, 30.0, 30.0), Point::new(60.0, 60.0, 60.0));
        let ticks: Vec<u64> = reader.candidates(&query).map(|info| info.tick).collect();
        assert_eq!(ticks, vec![7, 56]);

        // Wider box reaches tick 0: the range is a superset of the box
        // contents but still excludes tick 63.
        let query = Bounds::new(Point::new(20.0, 20.0, 20.0), Point::new(70.0, 70.0, 70.0));
        let candidates: Vec<PointInfo<'_>> = reader.candidates(&query).collect();
        let ticks: Vec<u64> = candidates.iter().map(|info| info.tick).collect();
        assert_eq!(ticks, vec![0, 7, 56]);
        assert!(!query.contains(&candidates[0].point), "superset candidate");
    }

    #[test]
    fn candidate_records_round_trip_bit_for_bit() {
        let schema = Schema::xyz();
        let point = Point::new(12.5, 37.25, 81.125);
        let reader = ChunkReader::new(&schema, &cube(), 2, true, 64, stored_sparse(&[point]))
            .expect("decode should succeed");

        let info = reader
            .candidates(&cube())
            .next()
            .expect("one candidate expected");
        assert_eq!(info.point, point);
        let mut expected = vec![0u8; schema.point_size()];
        schema.write_point(&mut expected, &point);
        assert_eq!(info.data, &expected[..]);
    }

    #[test]
    fn dense_bodies_skip_sentinel_slots() {
        let schema = Schema::xyz();
        let chunk = Chunk::contiguous(schema.clone(), 9, 64);
        let point = Point::new(90.0, 90.0, 90.0);
        let mut record = vec![0u8; schema.point_size()];
        schema.write_point(&mut record, &point);
        chunk
            .entry(72)
            .expect("index should be in range")
            .store(point, &record);
        let storage = MemoryStorage::new();
        chunk.save(&storage).expect("save should succeed");

        let blob = storage.get("9").expect("blob should exist");
        let reader = ChunkReader::new(&schema, &cube(), 2, true, 64, blob)
            .expect("decode should succeed");
        assert_eq!(reader.num_points(), 1);
    }

    #[test]
    fn base_reader_buckets_records_into_tubes() {
        let schema = Schema::xyz();
        let base = BaseChunk::new(schema.clone(), 0, 9);
        let primary = Point::new(10.0, 10.0, 0.0);
        let secondary = Point::new(12.0, 12.0, 0.0);
        for (sub_key, point) in [(0u64, primary), (5, secondary)] {
            let mut record = vec![0u8; schema.point_size()];
            schema.write_point(&mut record, &point);
            base.insert(1, sub_key, point, &record)
                .expect("insert should succeed");
        }
        let storage = MemoryStorage::new();
        base.save(&storage).expect("save should succeed");

        let blob = storage.get("0").expect("blob should exist");
        let reader =
            BaseChunkReader::new(&schema, 0, 9, blob).expect("decode should succeed");
        assert_eq!(reader.span(), 9);

        let tube = reader.tube(1).expect("tube should exist");
        assert_eq!(tube.cells().len(), 2);
        assert_eq!(
            tube.primary().expect("primary occupant").point,
            primary
        );
        assert_eq!(reader.point_info(&tube.cells()[1]).point, secondary);

        // Untouched cell: present but empty, the query's pruning signal.
        assert!(reader.tube(2).expect("tube should exist").is_empty());
        assert!(reader.tube(9).is_none());
    }
}
