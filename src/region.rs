//! Axis-aligned rectangles in camera-frame pixel space, and the scored
//! boxes that a person detector hands back for a frame.

use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// An axis-aligned rectangle. `x`/`y` is the top-left corner, and the
/// right/bottom edges are exclusive, the same way image rectangles usually
/// work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Region {
    /// Instantiates a new [`Region`].
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The exclusive right edge.
    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    /// The exclusive bottom edge.
    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    /// The horizontal midpoint, rounded towards the left edge.
    pub fn center_x(&self) -> i32 {
        self.x + self.width / 2
    }

    /// The vertical midpoint, rounded towards the top edge.
    pub fn center_y(&self) -> i32 {
        self.y + self.height / 2
    }

    /// Whether two regions share any area. Regions that only touch along an
    /// edge do not intersect.
    pub fn intersects(&self, other: &Region) -> bool {
        other.x < self.right()
            && self.x < other.right()
            && other.y < self.bottom()
            && self.y < other.bottom()
    }

    /// Grows the region by `padding` on every side.
    pub fn enlarge(&self, padding: i32) -> Region {
        Region {
            x: self.x - padding,
            y: self.y - padding,
            width: self.width + padding * 2,
            height: self.height + padding * 2,
        }
    }

    /// The smallest region containing both `self` and `other`.
    pub fn union(&self, other: &Region) -> Region {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Region {
            x,
            y,
            width: right - x,
            height: bottom - y,
        }
    }
}

impl Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {} {}x{}]", self.x, self.y, self.width, self.height)
    }
}

/// One hit from a person detector: where, and how sure it is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionBox {
    /// Where the person is in the frame.
    pub region: Region,
    /// Detector confidence. Higher is surer.
    pub score: f64,
}

impl DetectionBox {
    /// Instantiates a new [`DetectionBox`].
    pub fn new(region: Region, score: f64) -> Self {
        Self { region, score }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_regions_intersect() {
        let a = Region::new(0, 0, 10, 10);
        let b = Region::new(5, 5, 10, 10);
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
    }

    #[test]
    fn touching_regions_do_not_intersect() {
        let a = Region::new(0, 0, 10, 10);
        let b = Region::new(10, 0, 10, 10);
        assert!(!a.intersects(&b));
    }

    #[test]
    fn enlarged_region_catches_neighbour() {
        let a = Region::new(0, 0, 10, 10);
        let b = Region::new(40, 0, 10, 10);
        assert!(!a.intersects(&b));
        assert!(a.enlarge(50).intersects(&b));
        assert_eq!(a.enlarge(50), Region::new(-50, -50, 110, 110));
    }

    #[test]
    fn union_covers_both() {
        let a = Region::new(10, 20, 30, 40);
        let b = Region::new(0, 30, 100, 5);
        assert_eq!(a.union(&b), Region::new(0, 20, 100, 40));
    }

    #[test]
    fn midpoints() {
        let r = Region::new(100, 50, 41, 20);
        assert_eq!(r.center_x(), 120);
        assert_eq!(r.center_y(), 60);
    }
}
