// Contour extraction and quadrilateral reduction.
// Edge detection and border following come from imageproc; polygon
// approximation and convex hull are implemented here.

use image::GrayImage;
use imageproc::contours::{find_contours, BorderType};
use imageproc::edges::canny;
use log::trace;

use crate::geometry::{bounding_rect, polygon_bounding_box, Point2d, Rect};
use crate::image_impl::Frame;
use crate::types::{EdgeConfig, QuadConfig, RegistrationConfig};

#[derive(Debug, Clone, Default)]
pub struct Contour {
    pub points: Vec<(i32, i32)>,
}

impl Contour {
    pub fn new(points: Vec<(i32, i32)>) -> Self {
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn to_points(&self) -> Vec<Point2d> {
        self.points.iter().map(|&p| Point2d::from(p)).collect()
    }
}

/// Binary edge map (0/255) of a grayscale image.
pub fn edge_map(gray: &GrayImage, cfg: &EdgeConfig) -> GrayImage {
    canny(gray, cfg.low_threshold, cfg.high_threshold)
}

/// Outermost borders of the foreground; holes and anything nested inside a
/// hole are dropped.
pub fn find_external_contours(binary: &GrayImage) -> Vec<Contour> {
    find_contours::<i32>(binary)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .map(|c| Contour::new(c.points.into_iter().map(|p| (p.x, p.y)).collect()))
        .collect()
}

/// Length of the polyline through `points`, closed back to the start if `closed`.
pub fn arc_length(points: &[Point2d], closed: bool) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }
    let mut len: f64 = points.windows(2).map(|w| w[0].distance(&w[1])).sum();
    if closed {
        len += points[points.len() - 1].distance(&points[0]);
    }
    len
}

/// Douglas-Peucker on a closed curve. The curve is split at the point farthest
/// from the first one and both halves are simplified as open polylines.
pub fn approx_poly_closed(points: &[Point2d], epsilon: f64) -> Vec<Point2d> {
    let n = points.len();
    if n <= 2 {
        return points.to_vec();
    }

    let start = points[0];
    let mut far = 0;
    let mut far_dist = 0.0;
    for (i, p) in points.iter().enumerate().skip(1) {
        let d = start.distance(p);
        if d > far_dist {
            far_dist = d;
            far = i;
        }
    }
    if far == 0 {
        return vec![start];
    }

    let mut out = Vec::new();
    simplify_open(&points[..=far], epsilon, &mut out);

    let mut back: Vec<Point2d> = points[far..].to_vec();
    back.push(start);
    simplify_open(&back, epsilon, &mut out);

    out
}

// Pushes the kept points of `pts` except the last one.
fn simplify_open(pts: &[Point2d], epsilon: f64, out: &mut Vec<Point2d>) {
    if pts.is_empty() {
        return;
    }
    out.push(pts[0]);
    if pts.len() > 2 {
        simplify_range(pts, 0, pts.len() - 1, epsilon, out);
    }
}

fn simplify_range(pts: &[Point2d], first: usize, last: usize, epsilon: f64, out: &mut Vec<Point2d>) {
    if last <= first + 1 {
        return;
    }
    let a = pts[first];
    let b = pts[last];
    let mut max_dist = -1.0;
    let mut max_idx = first;
    for (i, p) in pts.iter().enumerate().take(last).skip(first + 1) {
        let d = line_distance(p, &a, &b);
        if d > max_dist {
            max_dist = d;
            max_idx = i;
        }
    }
    if max_dist > epsilon {
        simplify_range(pts, first, max_idx, epsilon, out);
        out.push(pts[max_idx]);
        simplify_range(pts, max_idx, last, epsilon, out);
    }
}

fn line_distance(p: &Point2d, a: &Point2d, b: &Point2d) -> f64 {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    let len = dx.hypot(dy);
    if len < 1e-12 {
        return p.distance(a);
    }
    ((p.x - a.x) * dy - (p.y - a.y) * dx).abs() / len
}

/// Convex hull by Graham scan. Duplicates and collinear points are dropped.
pub fn convex_hull(points: &[Point2d]) -> Vec<Point2d> {
    let mut pts: Vec<Point2d> = Vec::with_capacity(points.len());
    for p in points {
        if !pts.contains(p) {
            pts.push(*p);
        }
    }
    if pts.len() <= 2 {
        return pts;
    }

    // Lowest y, then lowest x.
    let mut start_idx = 0;
    for (i, pt) in pts.iter().enumerate().skip(1) {
        let s = pts[start_idx];
        if pt.y < s.y || (pt.y == s.y && pt.x < s.x) {
            start_idx = i;
        }
    }
    pts.swap(0, start_idx);
    let start = pts[0];

    pts[1..].sort_by(|a, b| {
        let angle_a = (a.y - start.y).atan2(a.x - start.x);
        let angle_b = (b.y - start.y).atan2(b.x - start.x);
        angle_a
            .partial_cmp(&angle_b)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                start
                    .distance(a)
                    .partial_cmp(&start.distance(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    });

    let mut hull: Vec<Point2d> = Vec::with_capacity(pts.len());
    for pt in pts {
        while hull.len() >= 2 {
            let p1 = hull[hull.len() - 2];
            let p2 = hull[hull.len() - 1];
            let cross = (p2.x - p1.x) * (pt.y - p1.y) - (p2.y - p1.y) * (pt.x - p1.x);
            if cross <= 0.0 {
                hull.pop();
            } else {
                break;
            }
        }
        hull.push(pt);
    }
    hull
}

/// Four unordered corners of a detected quadrilateral.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quad {
    pub points: [Point2d; 4],
}

impl Quad {
    pub fn new(points: [Point2d; 4]) -> Self {
        Self { points }
    }

    pub fn from_rect(r: &Rect) -> Self {
        Self::new(crate::geometry::rect_to_corners(r))
    }

    /// Integer bounding rectangle, inclusive of the corner pixels.
    pub fn bounding_rect(&self) -> Rect {
        bounding_rect(&self.points)
    }

    /// Float bounding box of the corners.
    pub fn bbox(&self) -> Rect {
        polygon_bounding_box(&self.points)
    }
}

/// Reduces a contour to four vertices: perimeter-scaled approximation, convex
/// hull, then coarser approximations while more than four vertices remain.
pub fn contour_to_quadrilateral(points: &[Point2d], cfg: &QuadConfig) -> Option<Quad> {
    let perimeter = arc_length(points, true);
    let approx = approx_poly_closed(points, cfg.epsilon_factor * perimeter);
    if approx.len() < 4 {
        return None;
    }

    let mut quad = convex_hull(&approx);
    if quad.len() < 4 {
        return None;
    }

    for factor in &cfg.escalation {
        if quad.len() <= 4 {
            break;
        }
        let eps = factor * arc_length(&quad, true);
        quad = approx_poly_closed(&quad, eps);
    }

    let corners: [Point2d; 4] = quad.try_into().ok()?;
    Some(Quad::new(corners))
}

/// Frame to quadrilaterals: grayscale, edges, external contours, reduction.
#[derive(Debug, Clone)]
pub struct QuadDetector {
    edges: EdgeConfig,
    quad: QuadConfig,
}

impl QuadDetector {
    pub fn new(config: &RegistrationConfig) -> Self {
        Self {
            edges: config.edges.clone(),
            quad: config.quad.clone(),
        }
    }

    pub fn detect(&self, frame: &Frame) -> Vec<Quad> {
        self.detect_gray(&frame.to_gray())
    }

    pub fn detect_gray(&self, gray: &GrayImage) -> Vec<Quad> {
        if gray.width() == 0 || gray.height() == 0 {
            return Vec::new();
        }
        let edges = edge_map(gray, &self.edges);
        self.detect_edges(&edges)
    }

    /// Quadrilaterals from an already binarised edge map.
    pub fn detect_edges(&self, edges: &GrayImage) -> Vec<Quad> {
        let contours = find_external_contours(edges);
        let quads: Vec<Quad> = contours
            .iter()
            .filter_map(|c| contour_to_quadrilateral(&c.to_points(), &self.quad))
            .collect();
        trace!("{} external contours, {} quadrilaterals", contours.len(), quads.len());
        quads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
    use imageproc::rect::Rect as PixelRect;

    fn rect_outline(w: u32, h: u32, rects: &[(i32, i32, u32, u32)]) -> GrayImage {
        let mut img = GrayImage::new(w, h);
        for &(x, y, rw, rh) in rects {
            draw_hollow_rect_mut(&mut img, PixelRect::at(x, y).of_size(rw, rh), Luma([255u8]));
        }
        img
    }

    fn square_path(x0: f64, y0: f64, side: f64, step: f64) -> Vec<Point2d> {
        let mut pts = Vec::new();
        let n = (side / step) as usize;
        for i in 0..n {
            pts.push(Point2d::new(x0 + i as f64 * step, y0));
        }
        for i in 0..n {
            pts.push(Point2d::new(x0 + side, y0 + i as f64 * step));
        }
        for i in 0..n {
            pts.push(Point2d::new(x0 + side - i as f64 * step, y0 + side));
        }
        for i in 0..n {
            pts.push(Point2d::new(x0, y0 + side - i as f64 * step));
        }
        pts
    }

    // Integer points along the closed polygon through `verts`.
    fn polygon_path(verts: &[(f64, f64)]) -> Vec<Point2d> {
        let mut pts = Vec::new();
        for (i, &(ax, ay)) in verts.iter().enumerate() {
            let (bx, by) = verts[(i + 1) % verts.len()];
            let n = (bx - ax).abs().max((by - ay).abs()) as usize;
            for k in 0..n {
                let t = k as f64 / n as f64;
                pts.push(Point2d::new((ax + (bx - ax) * t).round(), (ay + (by - ay) * t).round()));
            }
        }
        pts
    }

    #[test]
    fn arc_length_of_closed_square() {
        let sq = [
            Point2d::new(0.0, 0.0),
            Point2d::new(10.0, 0.0),
            Point2d::new(10.0, 10.0),
            Point2d::new(0.0, 10.0),
        ];
        assert_eq!(arc_length(&sq, true), 40.0);
        assert_eq!(arc_length(&sq, false), 30.0);
    }

    #[test]
    fn approx_keeps_square_corners() {
        let path = square_path(5.0, 5.0, 40.0, 1.0);
        let approx = approx_poly_closed(&path, 0.02 * arc_length(&path, true));
        assert_eq!(approx.len(), 4);
        for corner in [(5.0, 5.0), (45.0, 5.0), (45.0, 45.0), (5.0, 45.0)] {
            assert!(approx.contains(&Point2d::new(corner.0, corner.1)));
        }
    }

    #[test]
    fn hull_drops_interior_and_collinear_points() {
        let pts = [
            Point2d::new(0.0, 0.0),
            Point2d::new(5.0, 0.0),
            Point2d::new(10.0, 0.0),
            Point2d::new(10.0, 10.0),
            Point2d::new(4.0, 4.0),
            Point2d::new(0.0, 10.0),
            Point2d::new(0.0, 10.0),
        ];
        let hull = convex_hull(&pts);
        assert_eq!(hull.len(), 4);
        assert!(!hull.contains(&Point2d::new(4.0, 4.0)));
        assert!(!hull.contains(&Point2d::new(5.0, 0.0)));
    }

    #[test]
    fn concave_contour_collapses_to_quad() {
        // Square with a shallow notch on the top edge.
        let mut path = square_path(0.0, 0.0, 100.0, 1.0);
        path[50] = Point2d::new(50.0, 6.0);
        let quad = contour_to_quadrilateral(&path, &QuadConfig::default()).unwrap();
        assert_eq!(quad.bounding_rect(), Rect::new(0.0, 0.0, 101.0, 101.0));
    }

    #[test]
    fn chamfered_rectangle_needs_escalation() {
        // 200x150 outline with 15px corner cuts: the hull keeps six vertices.
        let path = polygon_path(&[
            (15.0, 0.0),
            (185.0, 0.0),
            (200.0, 15.0),
            (200.0, 135.0),
            (185.0, 150.0),
            (15.0, 150.0),
            (0.0, 135.0),
            (0.0, 15.0),
        ]);
        let no_escalation = QuadConfig {
            escalation: vec![],
            ..QuadConfig::default()
        };
        assert!(contour_to_quadrilateral(&path, &no_escalation).is_none());

        let quad = contour_to_quadrilateral(&path, &QuadConfig::default()).unwrap();
        assert_eq!(quad.bounding_rect(), Rect::new(15.0, 0.0, 186.0, 151.0));
    }

    #[test]
    fn hexagon_survives_escalation_and_is_discarded() {
        let path = polygon_path(&[
            (150.0, 100.0),
            (125.0, 143.0),
            (75.0, 143.0),
            (50.0, 100.0),
            (75.0, 57.0),
            (125.0, 57.0),
        ]);
        assert!(contour_to_quadrilateral(&path, &QuadConfig::default()).is_none());
    }

    #[test]
    fn empty_image_has_no_quads() {
        let detector = QuadDetector::new(&RegistrationConfig::default());
        assert!(detector.detect_gray(&GrayImage::new(0, 0)).is_empty());
        assert!(detector.detect_gray(&GrayImage::new(0, 40)).is_empty());
        assert!(detector.detect(&Frame::filled(40, 0, image::Rgb([0, 0, 0]))).is_empty());
    }

    #[test]
    fn triangle_is_rejected() {
        let tri = [
            Point2d::new(0.0, 0.0),
            Point2d::new(50.0, 0.0),
            Point2d::new(25.0, 40.0),
        ];
        assert!(contour_to_quadrilateral(&tri, &QuadConfig::default()).is_none());
    }

    #[test]
    fn outline_edges_yield_external_quads_only() {
        // Two separate boxes plus one box nested inside the first.
        let edges = rect_outline(200, 120, &[(10, 10, 80, 60), (30, 25, 20, 20), (120, 40, 50, 50)]);
        let detector = QuadDetector::new(&RegistrationConfig::default());
        let mut rects: Vec<Rect> = detector.detect_edges(&edges).iter().map(|q| q.bounding_rect()).collect();
        rects.sort_by(|a, b| a.x.partial_cmp(&b.x).unwrap());
        assert_eq!(rects, vec![Rect::new(10.0, 10.0, 80.0, 60.0), Rect::new(120.0, 40.0, 50.0, 50.0)]);
    }

    #[test]
    fn canny_finds_filled_rectangle() {
        let mut gray = GrayImage::new(160, 160);
        draw_filled_rect_mut(&mut gray, PixelRect::at(40, 30).of_size(70, 90), Luma([255u8]));
        let detector = QuadDetector::new(&RegistrationConfig::default());
        let quads = detector.detect_gray(&gray);
        assert_eq!(quads.len(), 1);
        let r = quads[0].bounding_rect();
        assert!((r.x - 40.0).abs() <= 2.0 && (r.y - 30.0).abs() <= 2.0);
        assert!((r.width - 70.0).abs() <= 3.0 && (r.height - 90.0).abs() <= 3.0);
    }
}
