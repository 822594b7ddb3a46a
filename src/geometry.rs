use serde::{Deserialize, Serialize};

use crate::engine::RegistrationError;
use crate::template::TemplateBox;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Point2d {
    pub x: f64,
    pub y: f64,
}

impl Point2d {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point2d) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

impl From<(i32, i32)> for Point2d {
    fn from((x, y): (i32, i32)) -> Self {
        Self::new(x as f64, y as f64)
    }
}

/// Axis-aligned rectangle, origin top-left.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn from_ints(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self::new(x as f64, y as f64, width as f64, height as f64)
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// Integer rectangle; values are truncated toward zero.
    pub fn to_ints(&self) -> (i32, i32, i32, i32) {
        (
            self.x as i32,
            self.y as i32,
            self.width as i32,
            self.height as i32,
        )
    }
}

/// Intersection over union of two rectangles. Zero union yields 0.
pub fn iou(a: &Rect, b: &Rect) -> f64 {
    let x_a = a.x.max(b.x);
    let y_a = a.y.max(b.y);
    let x_b = a.right().min(b.right());
    let y_b = a.bottom().min(b.bottom());

    let inter = (x_b - x_a).max(0.0) * (y_b - y_a).max(0.0);
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

/// Corners of a percentage box on a `target_w` x `target_h` canvas, TL, TR, BR, BL.
pub fn percent_box_to_corners(b: &TemplateBox, target_w: u32, target_h: u32) -> [Point2d; 4] {
    let tw = target_w as f64;
    let th = target_h as f64;
    let left = b.x / 100.0 * tw;
    let top = b.y / 100.0 * th;
    let right = (b.x + b.width) / 100.0 * tw;
    let bottom = (b.y + b.height) / 100.0 * th;
    [
        Point2d::new(left, top),
        Point2d::new(right, top),
        Point2d::new(right, bottom),
        Point2d::new(left, bottom),
    ]
}

pub fn rect_to_corners(r: &Rect) -> [Point2d; 4] {
    [
        Point2d::new(r.x, r.y),
        Point2d::new(r.right(), r.y),
        Point2d::new(r.right(), r.bottom()),
        Point2d::new(r.x, r.bottom()),
    ]
}

/// Orders four points as TL, TR, BR, BL using coordinate sums and differences.
///
/// TL has the smallest `x + y`, BR the largest; TR has the smallest `y - x`,
/// BL the largest. Ties resolve to the first point in input order.
pub fn order_polygon(pts: &[Point2d]) -> Result<[Point2d; 4], RegistrationError> {
    if pts.len() != 4 {
        return Err(RegistrationError::InvalidPolygon(pts.len()));
    }

    let sums: Vec<f64> = pts.iter().map(|p| p.x + p.y).collect();
    let diffs: Vec<f64> = pts.iter().map(|p| p.y - p.x).collect();

    Ok([
        pts[argmin(&sums)],
        pts[argmin(&diffs)],
        pts[argmax(&sums)],
        pts[argmax(&diffs)],
    ])
}

fn argmin(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate().skip(1) {
        if *v < values[best] {
            best = i;
        }
    }
    best
}

fn argmax(values: &[f64]) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate().skip(1) {
        if *v > values[best] {
            best = i;
        }
    }
    best
}

/// Float bounding box of a polygon with width and height floored to 1.
pub fn polygon_bounding_box(pts: &[Point2d]) -> Rect {
    if pts.is_empty() {
        return Rect::new(0.0, 0.0, 1.0, 1.0);
    }
    let (mut min_x, mut min_y) = (f64::MAX, f64::MAX);
    let (mut max_x, mut max_y) = (f64::MIN, f64::MIN);
    for p in pts {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    Rect::new(min_x, min_y, (max_x - min_x).max(1.0), (max_y - min_y).max(1.0))
}

/// Up-right bounding rectangle of integer pixel positions. Points are truncated
/// to integers first and the extent is inclusive, so a single point has size 1x1.
pub fn bounding_rect(pts: &[Point2d]) -> Rect {
    if pts.is_empty() {
        return Rect::default();
    }
    let (mut min_x, mut min_y) = (i32::MAX, i32::MAX);
    let (mut max_x, mut max_y) = (i32::MIN, i32::MIN);
    for p in pts {
        let (x, y) = (p.x as i32, p.y as i32);
        min_x = min_x.min(x);
        min_y = min_y.min(y);
        max_x = max_x.max(x);
        max_y = max_y.max(y);
    }
    Rect::from_ints(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1)
}
