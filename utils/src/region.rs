// Region tracking helpers
//
// Austin Shafer - 2020
use std::cmp::PartialOrd;
use std::ops::Add;

/// A rectangular region
///
/// This can be used to track damage boxes, copy areas, etc. It is
/// determinined by the corners of a rectangle:
///   r_pos:  the upper left corner's position in surface space
///   r_size: the distance from the left to the lower right
#[derive(Debug, PartialEq, Copy, Clone)]
#[repr(C)]
pub struct Rect<T: PartialOrd + Copy + Add + Add<Output = T>> {
    pub r_pos: (T, T),
    pub r_size: (T, T),
}

impl<T: PartialOrd + Copy + Add + Add<Output = T>> Rect<T> {
    pub fn new(x: T, y: T, width: T, height: T) -> Rect<T> {
        Rect {
            r_pos: (x, y),
            r_size: (width, height),
        }
    }

    /// Checks if the point (x,y) is contained within this
    /// Rectangle.
    pub fn intersects(&self, x: T, y: T) -> bool {
        x > self.r_pos.0
            && y > self.r_pos.1
            && x < self.r_pos.0 + self.r_size.0
            && y < self.r_pos.1 + self.r_size.1
    }
}

impl Rect<i32> {
    pub fn is_empty(&self) -> bool {
        self.r_size.0 <= 0 || self.r_size.1 <= 0
    }

    /// The overlapping area of two rects, None if they don't touch
    pub fn intersection(&self, other: &Rect<i32>) -> Option<Rect<i32>> {
        let x0 = self.r_pos.0.max(other.r_pos.0);
        let y0 = self.r_pos.1.max(other.r_pos.1);
        let x1 = (self.r_pos.0 + self.r_size.0).min(other.r_pos.0 + other.r_size.0);
        let y1 = (self.r_pos.1 + self.r_size.1).min(other.r_pos.1 + other.r_size.1);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rect::new(x0, y0, x1 - x0, y1 - y0))
    }

    /// The smallest rect containing both of these
    pub fn union(&self, other: &Rect<i32>) -> Rect<i32> {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x0 = self.r_pos.0.min(other.r_pos.0);
        let y0 = self.r_pos.1.min(other.r_pos.1);
        let x1 = (self.r_pos.0 + self.r_size.0).max(other.r_pos.0 + other.r_size.0);
        let y1 = (self.r_pos.1 + self.r_size.1).max(other.r_pos.1 + other.r_size.1);
        Rect::new(x0, y0, x1 - x0, y1 - y0)
    }
}

/// A set of rectangles
///
/// Rects are kept in the order they were added. They are allowed
/// to overlap, consumers that care should check.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Region {
    pub r_rects: Vec<Rect<i32>>,
}

impl Region {
    pub fn new() -> Self {
        Self {
            r_rects: Vec::new(),
        }
    }

    /// Adds a rect to the region, empty rects are ignored
    pub fn add(&mut self, rect: Rect<i32>) {
        if !rect.is_empty() {
            self.r_rects.push(rect);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.r_rects.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<Rect<i32>> {
        self.r_rects.iter()
    }

    /// The smallest rect containing every rect in this region
    pub fn bounding_rect(&self) -> Option<Rect<i32>> {
        let mut iter = self.r_rects.iter();
        let first = *iter.next()?;
        Some(iter.fold(first, |acc, r| acc.union(r)))
    }
}

impl From<Rect<i32>> for Region {
    fn from(rect: Rect<i32>) -> Self {
        let mut ret = Region::new();
        ret.add(rect);
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersection_clips() {
        let a = Rect::new(0, 0, 10, 10);
        let b = Rect::new(5, 5, 10, 10);
        assert_eq!(a.intersection(&b), Some(Rect::new(5, 5, 5, 5)));
        assert_eq!(a.intersection(&Rect::new(10, 0, 4, 4)), None);
    }

    #[test]
    fn bounding_rect_covers_all() {
        let mut region = Region::new();
        assert_eq!(region.bounding_rect(), None);
        region.add(Rect::new(2, 3, 4, 4));
        region.add(Rect::new(10, 1, 2, 2));
        region.add(Rect::new(0, 0, 0, 5));
        assert_eq!(region.r_rects.len(), 2);
        assert_eq!(region.bounding_rect(), Some(Rect::new(2, 1, 10, 6)));
    }
}
