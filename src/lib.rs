//! Octree-indexed point cloud storage.
//!
//! A point cloud is partitioned into fixed-capacity chunks addressed by
//! octree node index. Chunks are persisted compressed on a pluggable
//! storage back end and materialized on demand by a pinning cache while
//! bounded spatial queries stream results over a depth range.

pub mod chunk;
pub mod climb;
pub mod codec;
pub mod reader;
pub mod schema;
pub mod spatial;
pub mod storage;
pub mod structure;

pub use chunk::{
    chunk_key, sparse_occupancy_threshold, BaseChunk, CellEntry, CellReader, Chunk, ChunkError,
    ContiguousChunk, SparseChunk,
};
pub use climb::{tick, SplitClimber};
pub use codec::{ChunkMarker, CodecError};
pub use reader::{
    BaseChunkReader, Block, Cache, CacheError, ChunkReader, FetchInfo, GridQuery, Metadata,
    PointInfo, Query, QueryError, Reader, ReaderError,
};
pub use schema::{Dim, DimType, Schema};
pub use spatial::{Bounds, Point, EMPTY_COORD};
pub use storage::{FsStorage, MemoryStorage, Storage, StorageError};
pub use structure::{ChunkIndex, ChunkInfo, Structure};
