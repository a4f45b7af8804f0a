#![forbid(unsafe_code)]

//! Screen-space geometry used for visibility bookkeeping.

/// An axis-aligned rectangle in screen points (origin at top-left).
///
/// Tracked nodes carry two of these: the frame of the element on screen and
/// the portion of that frame that is actually visible. Their area ratio is the
/// exposure fraction fed into `impress_max_ratio`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Rect {
    /// Left edge (inclusive).
    pub x: f32,
    /// Top edge (inclusive).
    pub y: f32,
    /// Width in points.
    pub width: f32,
    /// Height in points.
    pub height: f32,
}

impl Rect {
    /// Create a new rectangle. Negative extents are clamped to zero.
    #[inline]
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width: width.max(0.0),
            height: height.max(0.0),
        }
    }

    /// Create a rectangle from origin with given size.
    #[inline]
    pub fn from_size(width: f32, height: f32) -> Self {
        Self::new(0.0, 0.0, width, height)
    }

    /// Right edge (exclusive).
    #[inline]
    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    /// Bottom edge (exclusive).
    #[inline]
    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }

    /// Area in square points.
    #[inline]
    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    /// Check if the rectangle has zero area.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    /// Check if a point is inside the rectangle.
    #[inline]
    pub fn contains(&self, x: f32, y: f32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    /// Compute the intersection with another rectangle.
    ///
    /// Returns an empty rectangle if the rectangles don't overlap.
    #[inline]
    pub fn intersection(&self, other: &Rect) -> Rect {
        self.intersection_opt(other).unwrap_or_default()
    }

    /// Compute the intersection with another rectangle, returning `None` if no overlap.
    pub fn intersection_opt(&self, other: &Rect) -> Option<Rect> {
        let x = self.x.max(other.x);
        let y = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());

        if x < right && y < bottom {
            Some(Rect::new(x, y, right - x, bottom - y))
        } else {
            None
        }
    }

    /// Whether the two rectangles share any area.
    #[inline]
    pub fn intersects(&self, other: &Rect) -> bool {
        self.intersection_opt(other).is_some()
    }

    /// The smallest rectangle that contains both.
    pub fn union(&self, other: &Rect) -> Rect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Rect::new(x, y, right - x, bottom - y)
    }

    /// Fraction of `self` covered by `visible`, in `[0, 1]`.
    ///
    /// An empty frame has nothing to expose and yields `0.0`.
    pub fn visible_ratio(&self, visible: &Rect) -> f32 {
        let area = self.area();
        if area <= 0.0 {
            return 0.0;
        }
        let covered = self.intersection(visible).area();
        (covered / area).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::Rect;

    #[test]
    fn rect_contains_edges() {
        let rect = Rect::new(2.0, 3.0, 4.0, 5.0);
        assert!(rect.contains(2.0, 3.0));
        assert!(rect.contains(5.5, 7.5));
        assert!(!rect.contains(6.0, 3.0));
        assert!(!rect.contains(2.0, 8.0));
    }

    #[test]
    fn negative_extent_clamped() {
        let r = Rect::new(1.0, 1.0, -5.0, 3.0);
        assert_eq!(r.width, 0.0);
        assert!(r.is_empty());
    }

    #[test]
    fn intersection_overlaps() {
        let a = Rect::new(0.0, 0.0, 4.0, 4.0);
        let b = Rect::new(2.0, 2.0, 4.0, 4.0);
        assert_eq!(a.intersection(&b), Rect::new(2.0, 2.0, 2.0, 2.0));
        assert!(a.intersects(&b));
    }

    #[test]
    fn intersection_no_overlap_is_empty() {
        let a = Rect::new(0.0, 0.0, 2.0, 2.0);
        let b = Rect::new(3.0, 3.0, 2.0, 2.0);
        assert_eq!(a.intersection(&b), Rect::default());
        assert!(!a.intersects(&b));
    }

    #[test]
    fn union_ignores_empty() {
        let a = Rect::new(1.0, 1.0, 2.0, 2.0);
        assert_eq!(a.union(&Rect::default()), a);
        assert_eq!(Rect::default().union(&a), a);
        let b = Rect::new(4.0, 0.0, 1.0, 1.0);
        assert_eq!(a.union(&b), Rect::new(1.0, 0.0, 4.0, 3.0));
    }

    #[test]
    fn visible_ratio_half() {
        let frame = Rect::new(0.0, 0.0, 100.0, 100.0);
        let screen = Rect::new(0.0, 50.0, 320.0, 480.0);
        assert!((frame.visible_ratio(&screen) - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn visible_ratio_of_empty_frame_is_zero() {
        let frame = Rect::from_size(0.0, 10.0);
        assert_eq!(frame.visible_ratio(&Rect::from_size(100.0, 100.0)), 0.0);
    }

    #[test]
    fn visible_ratio_fully_covered() {
        let frame = Rect::new(10.0, 10.0, 20.0, 20.0);
        assert_eq!(frame.visible_ratio(&Rect::from_size(320.0, 480.0)), 1.0);
    }
}
