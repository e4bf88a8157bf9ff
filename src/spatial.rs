use serde::{Deserialize, Serialize};

/// Sentinel coordinate marking an unpopulated dense slot.
pub const EMPTY_COORD: f64 = f64::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// The sentinel point stored in unpopulated dense slots.
    pub const fn empty() -> Self {
        Self::new(EMPTY_COORD, EMPTY_COORD, EMPTY_COORD)
    }

    /// True when this slot holds a real point. Z is deliberately not
    /// consulted: planar data may carry the sentinel there.
    pub fn exists(&self) -> bool {
        self.x != EMPTY_COORD && self.y != EMPTY_COORD
    }
}

/// Axis-aligned box, closed on both ends.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: Point,
    pub max: Point,
}

impl Bounds {
    pub fn new(min: Point, max: Point) -> Self {
        Self { min, max }
    }

    pub fn is_valid(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    pub fn mid(&self) -> Point {
        Point::new(
            (self.min.x + self.max.x) / 2.0,
            (self.min.y + self.max.y) / 2.0,
            (self.min.z + self.max.z) / 2.0,
        )
    }

    pub fn contains(&self, point: &Point) -> bool {
        point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
            && point.z >= self.min.z
            && point.z <= self.max.z
    }

    pub fn intersects(&self, other: &Self) -> bool {
        self.is_valid()
            && other.is_valid()
            && self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    /// The cube centered on `mid()` whose half-width is the largest axis
    /// half-width. Every tick computation runs against this form so ticks
    /// are invariant to the aspect of the real data.
    pub fn cubic(&self) -> Self {
        let mid = self.mid();
        let radius = ((self.max.x - self.min.x) / 2.0)
            .max((self.max.y - self.min.y) / 2.0)
            .max((self.max.z - self.min.z) / 2.0);
        Self::new(
            Point::new(mid.x - radius, mid.y - radius, mid.z - radius),
            Point::new(mid.x + radius, mid.y + radius, mid.z + radius),
        )
    }

    /// Child box for octant selector `which`: bit 0 picks the high X half,
    /// bit 1 high Y, bit 2 high Z. In 2D mode Z keeps the full span and
    /// only selectors 0..4 are meaningful.
    pub fn octant(&self, which: usize, is_3d: bool) -> Self {
        let mid = self.mid();
        let (min_x, max_x) = if which & 1 == 0 {
            (self.min.x, mid.x)
        } else {
            (mid.x, self.max.x)
        };
        let (min_y, max_y) = if which & 2 == 0 {
            (self.min.y, mid.y)
        } else {
            (mid.y, self.max.y)
        };
        let (min_z, max_z) = if !is_3d {
            (self.min.z, self.max.z)
        } else if which & 4 == 0 {
            (self.min.z, mid.z)
        } else {
            (mid.z, self.max.z)
        };
        Self::new(Point::new(min_x, min_y, min_z), Point::new(max_x, max_y, max_z))
    }

    /// Selector of the octant containing `point`, the inverse of `octant`.
    /// Points on a splitting plane land on the high side.
    pub fn octant_of(&self, point: &Point, is_3d: bool) -> usize {
        let mid = self.mid();
        let mut which = 0;
        if point.x >= mid.x {
            which |= 1;
        }
        if point.y >= mid.y {
            which |= 2;
        }
        if is_3d && point.z >= mid.z {
            which |= 4;
        }
        which
    }
}
