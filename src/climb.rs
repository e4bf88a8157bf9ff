use crate::spatial::{Bounds, Point};
use crate::structure::{ChunkIndex, Structure};

/// Bisection levels that fit one u64 tick.
fn max_tick_levels(is_3d: bool) -> u64 {
    if is_3d {
        21
    } else {
        32
    }
}

/// Morton-style 1-D key of `point` under `bounds`, truncated to `depth`
/// levels. Each level appends the octant selector of the containing child,
/// most significant level first, so ticks order points by their octree path
/// and any axis-aligned box maps to one contiguous tick range. Depths beyond
/// the key width share their prefix, which keeps that range a superset.
pub fn tick(point: &Point, bounds: &Bounds, depth: u64, is_3d: bool) -> u64 {
    let bits = if is_3d { 3 } else { 2 };
    let levels = depth.min(max_tick_levels(is_3d));

    let mut bounds = *bounds;
    let mut key = 0u64;
    for _ in 0..levels {
        let which = bounds.octant_of(point, is_3d);
        key = (key << bits) | which as u64;
        bounds = bounds.octant(which, is_3d);
    }
    key
}

#[derive(Clone, Copy, Debug)]
struct Frame {
    index: ChunkIndex,
    depth: u64,
    bounds: Bounds,
}

/// Depth-first enumeration of the octree nodes intersecting a query box
/// within a depth range.
///
/// Cell mode yields every intersecting node, one per octree cell. Chunked
/// mode yields each cold chunk once: a chunk of `factor^k` cells at point
/// depth `d` is owned by the node at depth `d - k`, `index()` is its first
/// cell (the chunk ID) and `depth()` is `d`.
///
/// `next(terminate)` advances; `terminate = true` prunes the subtree under
/// the current node. Children are visited in ascending octant order.
pub struct SplitClimber<'a> {
    structure: &'a Structure,
    query: Bounds,
    /// First yielded point depth.
    depth_begin: u64,
    /// One past the last yielded point depth; zero means unbounded.
    depth_end: u64,
    chunked: bool,
    /// Levels between a yielded node and its chunk's point depth.
    level_offset: u64,
    stack: Vec<Frame>,
    current: Frame,
}

impl<'a> SplitClimber<'a> {
    pub fn new(
        structure: &'a Structure,
        index_bounds: &Bounds,
        query_bounds: &Bounds,
        depth_begin: u64,
        depth_end: u64,
        chunked: bool,
    ) -> Option<Self> {
        if !index_bounds.intersects(query_bounds) {
            return None;
        }

        let level_offset = if chunked {
            structure.chunk_level_offset()
        } else {
            0
        };
        let (depth_begin, depth_end) = if chunked {
            let begin = depth_begin
                .max(structure.cold_depth_begin())
                .max(level_offset);
            let end = match (depth_end, structure.cold_depth_end()) {
                (0, end) | (end, 0) => end,
                (query_end, cold_end) => query_end.min(cold_end),
            };
            (begin, end)
        } else {
            (depth_begin, depth_end)
        };
        if depth_end != 0 && depth_begin >= depth_end {
            return None;
        }

        let root = Frame {
            index: 0,
            depth: 0,
            bounds: *index_bounds,
        };
        let mut climber = Self {
            structure,
            query: *query_bounds,
            depth_begin,
            depth_end,
            chunked,
            level_offset,
            stack: vec![root],
            current: root,
        };
        climber.pop_to_current().then_some(climber)
    }

    /// Current cell ID, or chunk ID in chunked mode.
    pub fn index(&self) -> ChunkIndex {
        if self.chunked {
            self.structure
                .leftmost_descendant(self.current.index, self.level_offset)
        } else {
            self.current.index
        }
    }

    /// Point depth of the current cell or chunk.
    pub fn depth(&self) -> u64 {
        self.current.depth + self.level_offset
    }

    /// Advance depth-first. `terminate` prunes below the current node.
    /// Returns false when the traversal is exhausted.
    pub fn next(&mut self, terminate: bool) -> bool {
        if !terminate && self.can_descend(&self.current) {
            let frame = self.current;
            self.push_children(&frame);
        }
        self.pop_to_current()
    }

    fn can_descend(&self, frame: &Frame) -> bool {
        self.depth_end == 0 || frame.depth + 1 + self.level_offset < self.depth_end
    }

    fn push_children(&mut self, frame: &Frame) {
        let factor = self.structure.factor() as u128;
        let is_3d = self.structure.is_3d();
        for which in (0..self.structure.factor() as usize).rev() {
            let bounds = frame.bounds.octant(which, is_3d);
            if bounds.intersects(&self.query) {
                self.stack.push(Frame {
                    index: frame.index * factor + 1 + which as u128,
                    depth: frame.depth + 1,
                    bounds,
                });
            }
        }
    }

    /// Pop until a frame inside the yield range surfaces, descending
    /// through shallower frames on the way.
    fn pop_to_current(&mut self) -> bool {
        while let Some(frame) = self.stack.pop() {
            if frame.depth + self.level_offset >= self.depth_begin {
                self.current = frame;
                return true;
            }
            self.push_children(&frame);
        }
        false
    }
}
