use super::cache::{Block, Cache, CacheError, FetchInfo};
use super::chunk_reader::PointInfo;
use super::Reader;
use crate::climb::SplitClimber;
use crate::schema::Schema;
use crate::spatial::{Bounds, Point};
use crate::structure::ChunkIndex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Cold chunks acquired per `next` step.
const FETCHES_PER_ITERATION: usize = 4;

#[derive(Debug)]
pub enum QueryError {
    /// `next` called after the query completed.
    Completed,
    Usage(String),
    Cache(CacheError),
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "next called after query completed"),
            Self::Usage(message) => write!(f, "{message}"),
            Self::Cache(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for QueryError {}

impl From<CacheError> for QueryError {
    fn from(value: CacheError) -> Self {
        Self::Cache(value)
    }
}

/// Consumer of the points a traversal surfaces. Returning true counts the
/// point as part of the query result.
trait PointSink {
    fn process(&mut self, info: &PointInfo<'_>) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QueryState {
    Base,
    Chunked,
    Done,
}

/// The traversal shared by every query flavor: one base pass walking the
/// resident chunk in place, then cold chunks in blocks of
/// `FETCHES_PER_ITERATION` acquired from the cache. Each `next` performs a
/// bounded step; the cold chunk set is computed up front so misses prune
/// whole subtrees.
struct QueryCore {
    reader: Arc<Reader>,
    cache: Arc<Cache>,
    query_bounds: Bounds,
    depth_begin: u64,
    depth_end: u64,
    chunks: BTreeSet<FetchInfo>,
    block: Option<Block>,
    block_ids: Vec<ChunkIndex>,
    block_pos: usize,
    num_points: u64,
    state: QueryState,
}

impl QueryCore {
    fn new(
        reader: Arc<Reader>,
        cache: Arc<Cache>,
        query_bounds: Bounds,
        depth_begin: u64,
        depth_end: u64,
    ) -> Self {
        let mut chunks = BTreeSet::new();
        let structure = reader.structure();
        if depth_end == 0 || depth_end > structure.cold_depth_begin() {
            let mut climber = SplitClimber::new(
                structure,
                reader.bounds_cubic(),
                &query_bounds,
                depth_begin,
                depth_end,
                true,
            );
            while let Some(active) = climber.as_mut() {
                let id = active.index();
                let terminate = if reader.exists(id) {
                    chunks.insert(FetchInfo {
                        id,
                        chunk_points: structure.get_info(id).chunk_points,
                        depth: active.depth(),
                    });
                    false
                } else {
                    true
                };
                if !active.next(terminate) {
                    break;
                }
            }
        }

        Self {
            reader,
            cache,
            query_bounds,
            depth_begin,
            depth_end,
            chunks,
            block: None,
            block_ids: Vec::new(),
            block_pos: 0,
            num_points: 0,
            state: QueryState::Base,
        }
    }

    /// One bounded step. `Ok(true)` means more steps remain; the final
    /// step's output is still delivered with `Ok(false)`.
    fn next(&mut self, sink: &mut dyn PointSink) -> Result<bool, QueryError> {
        match self.state {
            QueryState::Done => return Err(QueryError::Completed),
            QueryState::Base => {
                self.walk_base(sink);
                self.state = if self.chunks.is_empty() {
                    QueryState::Done
                } else {
                    QueryState::Chunked
                };
            }
            QueryState::Chunked => self.step_chunked(sink)?,
        }
        Ok(self.state != QueryState::Done)
    }

    /// Walk the whole base span intersecting the query, pruning below
    /// empty tubes.
    fn walk_base(&mut self, sink: &mut dyn PointSink) {
        let reader = self.reader.clone();
        let structure = reader.structure();
        let Some(base) = reader.base() else {
            return;
        };
        let in_range = self.depth_begin < structure.base_depth_end()
            && (self.depth_end == 0 || self.depth_end > structure.base_depth_begin());
        if !in_range {
            return;
        }

        let begin = self.depth_begin.max(structure.base_depth_begin());
        let end = if self.depth_end == 0 {
            structure.base_depth_end()
        } else {
            self.depth_end.min(structure.base_depth_end())
        };
        let Some(mut climber) = SplitClimber::new(
            structure,
            reader.bounds_cubic(),
            &self.query_bounds,
            begin,
            end,
            false,
        ) else {
            return;
        };

        let mut accepted = 0u64;
        loop {
            let terminate = match base.tube(climber.index()) {
                Some(tube) if !tube.is_empty() => {
                    for cell in tube.cells() {
                        if sink.process(&base.point_info(cell)) {
                            accepted += 1;
                        }
                    }
                    false
                }
                _ => true,
            };
            if !climber.next(terminate) {
                break;
            }
        }
        self.num_points += accepted;
    }

    /// Acquire the next block if none is held, then process one of its
    /// chunks through the sink.
    fn step_chunked(&mut self, sink: &mut dyn PointSink) -> Result<(), QueryError> {
        if self.block.is_none() && !self.chunks.is_empty() {
            let batch: BTreeSet<FetchInfo> = self
                .chunks
                .iter()
                .take(FETCHES_PER_ITERATION)
                .copied()
                .collect();
            for fetch in &batch {
                self.chunks.remove(fetch);
            }
            if let Some(block) = self.cache.acquire(&self.reader, &batch, None)? {
                self.block_ids = block.chunk_map().keys().copied().collect();
                self.block_pos = 0;
                self.block = Some(block);
            }
        }

        let mut accepted = 0u64;
        let mut exhausted = false;
        if let Some(block) = self.block.as_ref() {
            if let Some(id) = self.block_ids.get(self.block_pos) {
                if let Some(chunk_reader) = block.chunk_map().get(id) {
                    for info in chunk_reader.candidates(&self.query_bounds) {
                        if sink.process(&info) {
                            accepted += 1;
                        }
                    }
                }
            }
            exhausted = self.block_pos + 1 >= self.block_ids.len();
        }
        self.num_points += accepted;

        if self.block.is_some() {
            self.block_pos += 1;
            if exhausted {
                self.block = None;
                self.block_ids.clear();
                self.block_pos = 0;
            }
        }
        if self.block.is_none() && self.chunks.is_empty() {
            self.state = QueryState::Done;
        }
        Ok(())
    }
}

/// Record-producing query: accepted points append one packed `out_schema`
/// record to the caller's buffer per `next` step.
pub struct Query {
    core: QueryCore,
    out_schema: Schema,
    normalize: bool,
}

impl Query {
    /// `depth_end = 0` queries to the bottom of the index. With
    /// `normalize`, four-byte X/Y/Z output dimensions carry residuals
    /// relative to the index bounds' center so 32-bit floats keep their
    /// precision.
    pub fn new(
        reader: Arc<Reader>,
        cache: Arc<Cache>,
        query_bounds: Bounds,
        depth_begin: u64,
        depth_end: u64,
        out_schema: Schema,
        normalize: bool,
    ) -> Result<Self, QueryError> {
        for dim in out_schema.dims() {
            if !reader.schema().has_dim(&dim.name) {
                return Err(QueryError::Usage(format!(
                    "output dimension {:?} is not in the index schema",
                    dim.name
                )));
            }
        }
        Ok(Self {
            core: QueryCore::new(reader, cache, query_bounds, depth_begin, depth_end),
            out_schema,
            normalize,
        })
    }

    /// One step of results into `buffer`, which must arrive empty.
    pub fn next(&mut self, buffer: &mut Vec<u8>) -> Result<bool, QueryError> {
        if !buffer.is_empty() {
            return Err(QueryError::Usage("query output buffer not empty".to_string()));
        }
        let reader = self.core.reader.clone();
        let mut sink = RecordSink {
            native: reader.schema(),
            out_schema: &self.out_schema,
            normalize: self.normalize,
            mid: reader.bounds().mid(),
            query_bounds: self.core.query_bounds,
            buffer,
        };
        self.core.next(&mut sink)
    }

    /// Points accepted so far.
    pub fn num_points(&self) -> u64 {
        self.core.num_points
    }
}

struct RecordSink<'a> {
    native: &'a Schema,
    out_schema: &'a Schema,
    normalize: bool,
    mid: Point,
    query_bounds: Bounds,
    buffer: &'a mut Vec<u8>,
}

impl PointSink for RecordSink<'_> {
    fn process(&mut self, info: &PointInfo<'_>) -> bool {
        if !self.query_bounds.contains(&info.point) {
            return false;
        }

        let start = self.buffer.len();
        self.buffer.resize(start + self.out_schema.point_size(), 0);
        let mut offset = start;
        for dim in self.out_schema.dims() {
            let out = &mut self.buffer[offset..offset + dim.size()];
            let shift = match dim.name.as_str() {
                "X" => Some(self.mid.x),
                "Y" => Some(self.mid.y),
                "Z" => Some(self.mid.z),
                _ => None,
            };
            match shift {
                Some(shift) if self.normalize && dim.size() == 4 => {
                    let raw = self.native.read_as_f64(info.data, &dim.name).unwrap_or(0.0);
                    let residual = (raw - shift) as f32;
                    out.copy_from_slice(&residual.to_le_bytes());
                }
                _ => {
                    self.native
                        .copy_dim_into(info.data, &dim.name, dim.dim_type, out);
                }
            }
            offset += dim.size();
        }
        true
    }
}

/// Density query: accepted points are counted into a caller-sized grid of
/// cells over the query box instead of producing records.
pub struct GridQuery {
    core: QueryCore,
    cells: [usize; 3],
    counts: Vec<u64>,
}

impl GridQuery {
    pub fn new(
        reader: Arc<Reader>,
        cache: Arc<Cache>,
        query_bounds: Bounds,
        depth_begin: u64,
        depth_end: u64,
        cells: [usize; 3],
    ) -> Result<Self, QueryError> {
        if cells.iter().any(|&count| count == 0) {
            return Err(QueryError::Usage("grid cell counts must be positive".to_string()));
        }
        Ok(Self {
            core: QueryCore::new(reader, cache, query_bounds, depth_begin, depth_end),
            cells,
            counts: vec![0; cells[0] * cells[1] * cells[2]],
        })
    }

    pub fn next(&mut self) -> Result<bool, QueryError> {
        let mut sink = GridSink {
            query_bounds: self.core.query_bounds,
            cells: self.cells,
            counts: &mut self.counts,
        };
        self.core.next(&mut sink)
    }

    /// Per-cell counts, X fastest then Y then Z.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    pub fn count_at(&self, x: usize, y: usize, z: usize) -> u64 {
        self.counts[(z * self.cells[1] + y) * self.cells[0] + x]
    }

    pub fn num_points(&self) -> u64 {
        self.core.num_points
    }
}

struct GridSink<'a> {
    query_bounds: Bounds,
    cells: [usize; 3],
    counts: &'a mut Vec<u64>,
}

impl GridSink<'_> {
    fn bin(&self, value: f64, min: f64, max: f64, cells: usize) -> usize {
        if max <= min {
            return 0;
        }
        let normalized = (value - min) / (max - min);
        ((normalized * cells as f64) as usize).min(cells - 1)
    }
}

impl PointSink for GridSink<'_> {
    fn process(&mut self, info: &PointInfo<'_>) -> bool {
        let bounds = self.query_bounds;
        if !bounds.contains(&info.point) {
            return false;
        }
        let x = self.bin(info.point.x, bounds.min.x, bounds.max.x, self.cells[0]);
        let y = self.bin(info.point.y, bounds.min.y, bounds.max.y, self.cells[1]);
        let z = self.bin(info.point.z, bounds.min.z, bounds.max.z, self.cells[2]);
        self.counts[(z * self.cells[1] + y) * self.cells[0] + x] += 1;
        true
    }
}
