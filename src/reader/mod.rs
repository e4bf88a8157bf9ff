use crate::chunk::{chunk_key, ChunkError};
use crate::schema::Schema;
use crate::spatial::Bounds;
use crate::storage::{Storage, StorageError};
use crate::structure::{ChunkIndex, Structure};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

mod cache;
mod chunk_reader;
mod query;

pub use cache::{Block, Cache, CacheError, FetchInfo};
pub use chunk_reader::{BaseChunkReader, Candidates, ChunkReader, PointInfo, Tube, TubeCell};
pub use query::{GridQuery, Query, QueryError};

/// Out-of-band storage key of the index manifest.
pub const META_KEY: &str = "meta";

#[derive(Debug)]
pub enum ReaderError {
    Storage(StorageError),
    Chunk(ChunkError),
    Manifest(String),
}

impl fmt::Display for ReaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Storage(error) => write!(f, "{error}"),
            Self::Chunk(error) => write!(f, "{error}"),
            Self::Manifest(message) => write!(f, "invalid index manifest: {message}"),
        }
    }
}

impl std::error::Error for ReaderError {}

impl From<StorageError> for ReaderError {
    fn from(value: StorageError) -> Self {
        Self::Storage(value)
    }
}

impl From<ChunkError> for ReaderError {
    fn from(value: ChunkError) -> Self {
        Self::Chunk(value)
    }
}

/// Index manifest persisted as JSON next to the chunks. Chunk IDs are kept
/// as decimal strings so the 128-bit range survives JSON number handling.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Metadata {
    pub bounds: Bounds,
    pub schema: Schema,
    pub structure: Structure,
    pub num_points: u64,
    pub ids: Vec<String>,
}

impl Metadata {
    pub fn new(
        bounds: Bounds,
        schema: Schema,
        structure: Structure,
        num_points: u64,
        mut ids: Vec<ChunkIndex>,
    ) -> Self {
        ids.sort_unstable();
        Self {
            bounds,
            schema,
            structure,
            num_points,
            ids: ids.iter().map(|id| id.to_string()).collect(),
        }
    }

    pub fn save(&self, storage: &dyn Storage) -> Result<(), ReaderError> {
        let body = serde_json::to_vec_pretty(self)
            .map_err(|error| ReaderError::Manifest(error.to_string()))?;
        storage.put(META_KEY, &body)?;
        Ok(())
    }

    pub fn load(storage: &dyn Storage) -> Result<Self, ReaderError> {
        let body = storage.get(META_KEY)?;
        serde_json::from_slice(&body).map_err(|error| ReaderError::Manifest(error.to_string()))
    }

    pub fn chunk_ids(&self) -> Result<Vec<ChunkIndex>, ReaderError> {
        self.ids
            .iter()
            .map(|id| {
                id.parse::<ChunkIndex>()
                    .map_err(|_| ReaderError::Manifest(format!("bad chunk id {id:?}")))
            })
            .collect()
    }
}

/// Query-side handle on one persisted index: the manifest, the resident
/// base chunk, and existence checks for cold chunks. All state is
/// immutable after open, so one reader serves concurrent queries.
pub struct Reader {
    path: String,
    storage: Arc<dyn Storage>,
    meta: Metadata,
    bounds_cubic: Bounds,
    ids: HashSet<ChunkIndex>,
    base: Option<BaseChunkReader>,
}

impl Reader {
    pub fn open(path: impl Into<String>, storage: Arc<dyn Storage>) -> Result<Self, ReaderError> {
        let meta = Metadata::load(storage.as_ref())?;
        let ids: HashSet<ChunkIndex> = meta.chunk_ids()?.into_iter().collect();
        let bounds_cubic = meta.bounds.cubic();

        let base = if meta.structure.base_index_span() > 0 {
            let begin = meta.structure.base_index_begin();
            match storage.get(&chunk_key(begin)) {
                Ok(bytes) => Some(BaseChunkReader::new(
                    &meta.schema,
                    begin,
                    meta.structure.base_index_span(),
                    bytes,
                )?),
                Err(StorageError::NotFound(_)) => None,
                Err(error) => return Err(error.into()),
            }
        } else {
            None
        };

        Ok(Self {
            path: path.into(),
            storage,
            meta,
            bounds_cubic,
            ids,
            base,
        })
    }

    /// Identity of this index in the shared cache.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn bounds(&self) -> &Bounds {
        &self.meta.bounds
    }

    /// The scaled cubic form used for all tick math.
    pub fn bounds_cubic(&self) -> &Bounds {
        &self.bounds_cubic
    }

    pub fn schema(&self) -> &Schema {
        &self.meta.schema
    }

    pub fn structure(&self) -> &Structure {
        &self.meta.structure
    }

    pub fn num_points(&self) -> u64 {
        self.meta.num_points
    }

    /// Whether a cold chunk was persisted under `id`.
    pub fn exists(&self, id: ChunkIndex) -> bool {
        self.ids.contains(&id)
    }

    pub fn base(&self) -> Option<&BaseChunkReader> {
        self.base.as_ref()
    }

    pub(crate) fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }
}
