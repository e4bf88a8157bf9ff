use serde::{Deserialize, Serialize};
use std::fmt;

/// Octree node index. Node 0 is the root; the children of node `i` are
/// `F*i + 1 + c` for octant selectors `c in 0..F`, where `F` is the
/// subdivision factor. Deep trees overflow 64 bits, so indexes are 128-bit
/// across the crate.
pub type ChunkIndex = u128;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkInfo {
    pub chunk_points: u64,
    pub depth: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructureError {
    InvalidDepthOrder {
        base_begin: u64,
        base_end: u64,
        cold_begin: u64,
        cold_end: u64,
    },
    InvalidChunkPoints {
        chunk_points: u64,
        factor: u64,
    },
}

impl fmt::Display for StructureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidDepthOrder {
                base_begin,
                base_end,
                cold_begin,
                cold_end,
            } => write!(
                f,
                "depth ranges out of order: base [{base_begin}, {base_end}), cold [{cold_begin}, {cold_end})"
            ),
            Self::InvalidChunkPoints {
                chunk_points,
                factor,
            } => write!(
                f,
                "chunk points {chunk_points} is not a positive power of the subdivision factor {factor}"
            ),
        }
    }
}

impl std::error::Error for StructureError {}

/// Octree partitioning parameters: which depths live in the always-resident
/// base chunk, which are cold, and how many cells one cold chunk spans.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Structure {
    base_depth_begin: u64,
    base_depth_end: u64,
    cold_depth_begin: u64,
    /// Zero means unbounded.
    cold_depth_end: u64,
    chunk_points: u64,
    is_3d: bool,
}

impl Structure {
    pub fn new(
        base_depth_begin: u64,
        base_depth_end: u64,
        cold_depth_begin: u64,
        cold_depth_end: u64,
        chunk_points: u64,
        is_3d: bool,
    ) -> Result<Self, StructureError> {
        let ordered = base_depth_begin <= base_depth_end
            && base_depth_end <= cold_depth_begin
            && (cold_depth_end == 0 || cold_depth_begin <= cold_depth_end);
        if !ordered {
            return Err(StructureError::InvalidDepthOrder {
                base_begin: base_depth_begin,
                base_end: base_depth_end,
                cold_begin: cold_depth_begin,
                cold_end: cold_depth_end,
            });
        }

        let structure = Self {
            base_depth_begin,
            base_depth_end,
            cold_depth_begin,
            cold_depth_end,
            chunk_points,
            is_3d,
        };
        if chunk_points == 0 || !structure.chunk_points_is_factor_power() {
            return Err(StructureError::InvalidChunkPoints {
                chunk_points,
                factor: structure.factor(),
            });
        }
        Ok(structure)
    }

    fn chunk_points_is_factor_power(&self) -> bool {
        let factor = self.factor();
        let mut span = 1u64;
        while span < self.chunk_points {
            let Some(next) = span.checked_mul(factor) else {
                return false;
            };
            span = next;
        }
        span == self.chunk_points && self.chunk_points > 1
    }

    pub fn factor(&self) -> u64 {
        if self.is_3d {
            8
        } else {
            4
        }
    }

    pub fn is_3d(&self) -> bool {
        self.is_3d
    }

    pub fn chunk_points(&self) -> u64 {
        self.chunk_points
    }

    pub fn base_depth_begin(&self) -> u64 {
        self.base_depth_begin
    }

    pub fn base_depth_end(&self) -> u64 {
        self.base_depth_end
    }

    pub fn cold_depth_begin(&self) -> u64 {
        self.cold_depth_begin
    }

    pub fn cold_depth_end(&self) -> u64 {
        self.cold_depth_end
    }

    /// First node index at `depth`: the geometric sum of the node counts of
    /// all shallower levels.
    pub fn start_at_depth(&self, depth: u64) -> ChunkIndex {
        let factor = self.factor() as u128;
        let mut start = 0u128;
        let mut span = 1u128;
        for _ in 0..depth {
            start += span;
            span *= factor;
        }
        start
    }

    pub fn end_at_depth(&self, depth: u64) -> ChunkIndex {
        self.start_at_depth(depth + 1)
    }

    pub fn depth_of(&self, index: ChunkIndex) -> u64 {
        let factor = self.factor() as u128;
        let mut depth = 0;
        let mut end = 1u128;
        let mut span = 1u128;
        while index >= end {
            span *= factor;
            end += span;
            depth += 1;
        }
        depth
    }

    pub fn base_index_begin(&self) -> ChunkIndex {
        self.start_at_depth(self.base_depth_begin)
    }

    pub fn base_index_end(&self) -> ChunkIndex {
        self.start_at_depth(self.base_depth_end)
    }

    pub fn base_index_span(&self) -> u64 {
        (self.base_index_end() - self.base_index_begin()) as u64
    }

    /// Levels between a cold chunk's point depth and the octree node whose
    /// descendants it comprises: `chunk_points = factor^k`.
    pub fn chunk_level_offset(&self) -> u64 {
        let factor = self.factor();
        let mut levels = 0;
        let mut span = 1u64;
        while span < self.chunk_points {
            span *= factor;
            levels += 1;
        }
        levels
    }

    /// The leftmost descendant `levels` below `index`; for a chunk-owning
    /// node, the chunk ID.
    pub fn leftmost_descendant(&self, index: ChunkIndex, levels: u64) -> ChunkIndex {
        let factor = self.factor() as u128;
        let mut descendant = index;
        for _ in 0..levels {
            descendant = descendant * factor + 1;
        }
        descendant
    }

    /// ID of the cold chunk holding cell `index`: the depth span start plus
    /// the containing `chunk_points`-aligned offset.
    pub fn chunk_id_containing(&self, index: ChunkIndex) -> ChunkIndex {
        let depth = self.depth_of(index);
        let begin = self.start_at_depth(depth);
        let offset = index - begin;
        begin + (offset / self.chunk_points as u128) * self.chunk_points as u128
    }

    pub fn get_info(&self, chunk_id: ChunkIndex) -> ChunkInfo {
        ChunkInfo {
            chunk_points: self.chunk_points,
            depth: self.depth_of(chunk_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_structure() -> Structure {
        Structure::new(0, 2, 2, 4, 64, true).expect("structure should validate")
    }

    #[test]
    fn depth_spans_follow_heap_numbering() {
        let structure = small_structure();
        assert_eq!(structure.start_at_depth(0), 0);
        assert_eq!(structure.start_at_depth(1), 1);
        assert_eq!(structure.start_at_depth(2), 9);
        assert_eq!(structure.start_at_depth(3), 73);
        assert_eq!(structure.end_at_depth(2), 73);
    }

    #[test]
    fn depth_of_inverts_depth_spans() {
        let structure = small_structure();
        assert_eq!(structure.depth_of(0), 0);
        assert_eq!(structure.depth_of(8), 1);
        assert_eq!(structure.depth_of(9), 2);
        assert_eq!(structure.depth_of(72), 2);
        assert_eq!(structure.depth_of(73), 3);
    }

    #[test]
    fn base_span_covers_base_depths() {
        let structure = small_structure();
        assert_eq!(structure.base_index_begin(), 0);
        assert_eq!(structure.base_index_end(), 9);
        assert_eq!(structure.base_index_span(), 9);
    }

    #[test]
    fn chunk_ids_align_to_chunk_points() {
        let structure = small_structure();
        assert_eq!(structure.chunk_level_offset(), 2);
        assert_eq!(structure.chunk_id_containing(9), 9);
        assert_eq!(structure.chunk_id_containing(72), 9);
        assert_eq!(structure.chunk_id_containing(73), 73);
        assert_eq!(structure.chunk_id_containing(73 + 64), 137);

        let info = structure.get_info(137);
        assert_eq!(info.depth, 3);
        assert_eq!(info.chunk_points, 64);
    }

    #[test]
    fn leftmost_descendant_matches_depth_span_starts() {
        let structure = small_structure();
        assert_eq!(structure.leftmost_descendant(0, 2), 9);
        assert_eq!(structure.leftmost_descendant(1, 2), 73);
        assert_eq!(structure.leftmost_descendant(2, 2), 137);
    }

    #[test]
    fn invalid_parameters_are_rejected()  {
        assert!(matches!(
            Structure::new(0, 3, 2, 0, 64, true),
            Err(StructureError::InvalidDepthOrder { .. })
        ));
        assert!(matches!(
            Structure::new(0, 2, 2, 0, 60, true),
            Err(StructureError::InvalidChunkPoints { .. })
        ));
        assert!(Structure::new(0, 2, 2, 0, 16, false).is_ok());
        assert!(matches!(
            Structure::new(0, 2, 2, 0, 8, false),
            Err(StructureError::InvalidChunkPoints { .. })
        ));
    }
}
