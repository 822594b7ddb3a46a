//! Template-to-image homography from partial box correspondences.
//!
//! Every matched template box contributes its four canonical corners as source
//! points and the corners of its matched rectangle as destination points.
//! Four points solve exactly; more go through RANSAC with a reprojection
//! threshold, followed by a DLT refit on the inliers.

use log::debug;
use nalgebra::{DMatrix, Matrix3, SMatrix, SVector, SymmetricEigen, Vector3};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::geometry::{percent_box_to_corners, rect_to_corners, Point2d};
use crate::matcher::MatchRecord;
use crate::template::TemplateBox;
use crate::types::{RansacConfig, RegistrationConfig, TemplateSize};

/// Projective transform `dst ~ H * src`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Homography {
    pub h: Matrix3<f64>,
}

impl Homography {
    pub fn new(h: Matrix3<f64>) -> Self {
        Self { h }
    }

    pub fn identity() -> Self {
        Self::new(Matrix3::identity())
    }

    pub fn from_array(rows: [[f64; 3]; 3]) -> Self {
        Self::new(Matrix3::new(
            rows[0][0], rows[0][1], rows[0][2], //
            rows[1][0], rows[1][1], rows[1][2], //
            rows[2][0], rows[2][1], rows[2][2],
        ))
    }

    /// Row-major copy of the matrix.
    pub fn to_array(&self) -> [[f64; 3]; 3] {
        [
            [self.h[(0, 0)], self.h[(0, 1)], self.h[(0, 2)]],
            [self.h[(1, 0)], self.h[(1, 1)], self.h[(1, 2)]],
            [self.h[(2, 0)], self.h[(2, 1)], self.h[(2, 2)]],
        ]
    }

    pub fn matrix(&self) -> &Matrix3<f64> {
        &self.h
    }

    #[inline]
    pub fn apply(&self, p: &Point2d) -> Point2d {
        let v = self.h * Vector3::new(p.x, p.y, 1.0);
        if v[2].abs() < 1e-15 {
            return Point2d::new(f64::NAN, f64::NAN);
        }
        Point2d::new(v[0] / v[2], v[1] / v[2])
    }

    pub fn inverse(&self) -> Option<Self> {
        self.h.try_inverse().map(Self::new)
    }
}

pub fn reprojection_error(h: &Homography, src: &Point2d, dst: &Point2d) -> f64 {
    h.apply(src).distance(dst)
}

/// Hartley normalisation: centroid to the origin, mean distance sqrt(2).
fn normalize_points(pts: &[Point2d]) -> (Matrix3<f64>, Vec<Point2d>) {
    let n = pts.len() as f64;
    let cx = pts.iter().map(|p| p.x).sum::<f64>() / n;
    let cy = pts.iter().map(|p| p.y).sum::<f64>() / n;
    let mean_dist = pts.iter().map(|p| (p.x - cx).hypot(p.y - cy)).sum::<f64>() / n;

    let s = if mean_dist > 1e-15 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    let t = Matrix3::new(s, 0.0, -s * cx, 0.0, s, -s * cy, 0.0, 0.0, 1.0);
    let normalized = pts
        .iter()
        .map(|p| Point2d::new(s * (p.x - cx), s * (p.y - cy)))
        .collect();
    (t, normalized)
}

fn denormalize(hn: Matrix3<f64>, t_src: &Matrix3<f64>, t_dst: &Matrix3<f64>) -> Option<Homography> {
    let h = t_dst.try_inverse()? * hn * t_src;
    let scale = h[(2, 2)];
    if scale.abs() < 1e-15 || !h.iter().all(|v| v.is_finite()) {
        return None;
    }
    Some(Homography::new(h / scale))
}

/// Direct linear transform over all correspondences (at least four).
pub fn estimate_homography_dlt(src: &[Point2d], dst: &[Point2d]) -> Option<Homography> {
    let n = src.len();
    if n < 4 || dst.len() != n {
        return None;
    }

    let (t_src, src_n) = normalize_points(src);
    let (t_dst, dst_n) = normalize_points(dst);

    let mut a = DMatrix::<f64>::zeros(2 * n, 9);
    for i in 0..n {
        let (sx, sy) = (src_n[i].x, src_n[i].y);
        let (dx, dy) = (dst_n[i].x, dst_n[i].y);

        a[(2 * i, 3)] = -sx;
        a[(2 * i, 4)] = -sy;
        a[(2 * i, 5)] = -1.0;
        a[(2 * i, 6)] = dy * sx;
        a[(2 * i, 7)] = dy * sy;
        a[(2 * i, 8)] = dy;

        a[(2 * i + 1, 0)] = sx;
        a[(2 * i + 1, 1)] = sy;
        a[(2 * i + 1, 2)] = 1.0;
        a[(2 * i + 1, 6)] = -dx * sx;
        a[(2 * i + 1, 7)] = -dx * sy;
        a[(2 * i + 1, 8)] = -dx;
    }

    // h is the eigenvector of AᵀA with the smallest eigenvalue.
    let ata = a.transpose() * &a;
    let eig = SymmetricEigen::new(ata);
    let mut min_idx = 0;
    for i in 1..9 {
        if eig.eigenvalues[i].abs() < eig.eigenvalues[min_idx].abs() {
            min_idx = i;
        }
    }
    let h = |j: usize| eig.eigenvectors[(j, min_idx)];
    let hn = Matrix3::new(h(0), h(1), h(2), h(3), h(4), h(5), h(6), h(7), h(8));

    denormalize(hn, &t_src, &t_dst)
}

/// Exact solution for four correspondences with `h33 = 1`.
pub fn homography_from_4pt(src: &[Point2d; 4], dst: &[Point2d; 4]) -> Option<Homography> {
    let (t_src, src_n) = normalize_points(src);
    let (t_dst, dst_n) = normalize_points(dst);

    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();
    for k in 0..4 {
        let (x, y) = (src_n[k].x, src_n[k].y);
        let (u, v) = (dst_n[k].x, dst_n[k].y);

        let r0 = 2 * k;
        a[(r0, 0)] = x;
        a[(r0, 1)] = y;
        a[(r0, 2)] = 1.0;
        a[(r0, 6)] = -u * x;
        a[(r0, 7)] = -u * y;
        b[r0] = u;

        let r1 = 2 * k + 1;
        a[(r1, 3)] = x;
        a[(r1, 4)] = y;
        a[(r1, 5)] = 1.0;
        a[(r1, 6)] = -v * x;
        a[(r1, 7)] = -v * y;
        b[r1] = v;
    }

    let x = a.lu().solve(&b)?;
    let hn = Matrix3::new(x[0], x[1], x[2], x[3], x[4], x[5], x[6], x[7], 1.0);
    denormalize(hn, &t_src, &t_dst)
}

#[derive(Debug, Clone)]
pub struct RansacResult {
    pub homography: Homography,
    pub inlier_mask: Vec<bool>,
    pub n_inliers: usize,
}

fn collinear(a: &Point2d, b: &Point2d, c: &Point2d) -> bool {
    let (abx, aby) = (b.x - a.x, b.y - a.y);
    let (acx, acy) = (c.x - a.x, c.y - a.y);
    let cross = abx * acy - aby * acx;
    cross.abs() <= 1e-10 * (abx.hypot(aby) * acx.hypot(acy)).max(1e-300)
}

fn degenerate_sample(pts: &[Point2d; 4]) -> bool {
    const TRIPLES: [[usize; 3]; 4] = [[0, 1, 2], [0, 1, 3], [0, 2, 3], [1, 2, 3]];
    TRIPLES
        .iter()
        .any(|t| collinear(&pts[t[0]], &pts[t[1]], &pts[t[2]]))
}

fn score(h: &Homography, src: &[Point2d], dst: &[Point2d], threshold: f64) -> (Vec<bool>, usize) {
    let mask: Vec<bool> = src
        .iter()
        .zip(dst)
        .map(|(s, d)| reprojection_error(h, s, d) <= threshold)
        .collect();
    let count = mask.iter().filter(|&&m| m).count();
    (mask, count)
}

/// Iterations needed to draw one all-inlier sample with `confidence`.
fn update_num_iters(confidence: f64, outlier_ratio: f64, sample_size: i32, max_iters: usize) -> usize {
    let ep = outlier_ratio.clamp(0.0, 1.0);
    let p = confidence.clamp(0.0, 1.0);
    let num = (1.0 - p).max(f64::MIN_POSITIVE).ln();
    let denom = 1.0 - (1.0 - ep).powi(sample_size);
    if denom < f64::MIN_POSITIVE {
        return 0;
    }
    let denom = denom.ln();
    if denom >= 0.0 || -num >= max_iters as f64 * -denom {
        max_iters
    } else {
        (num / denom).round() as usize
    }
}

/// Robust fit of `dst ~ H * src`. Returns `None` for fewer than four points or
/// when no sample produces a model.
pub fn find_homography_ransac(src: &[Point2d], dst: &[Point2d], cfg: &RansacConfig) -> Option<RansacResult> {
    let n = src.len();
    if n < 4 || dst.len() != n {
        return None;
    }

    if n == 4 {
        let s: [Point2d; 4] = [src[0], src[1], src[2], src[3]];
        let d: [Point2d; 4] = [dst[0], dst[1], dst[2], dst[3]];
        let homography = homography_from_4pt(&s, &d)?;
        let (inlier_mask, n_inliers) = score(&homography, src, dst, cfg.reproj_threshold);
        return Some(RansacResult {
            homography,
            inlier_mask,
            n_inliers,
        });
    }

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut best: Option<(Homography, Vec<bool>, usize)> = None;
    let mut niters = cfg.max_iters;
    let mut iter = 0;

    while iter < niters {
        iter += 1;
        let idx = rand::seq::index::sample(&mut rng, n, 4);
        let s = [src[idx.index(0)], src[idx.index(1)], src[idx.index(2)], src[idx.index(3)]];
        let d = [dst[idx.index(0)], dst[idx.index(1)], dst[idx.index(2)], dst[idx.index(3)]];
        if degenerate_sample(&s) || degenerate_sample(&d) {
            continue;
        }
        let Some(h) = homography_from_4pt(&s, &d) else {
            continue;
        };

        let (mask, count) = score(&h, src, dst, cfg.reproj_threshold);
        if best.as_ref().map_or(true, |b| count > b.2) {
            niters = update_num_iters(cfg.confidence, 1.0 - count as f64 / n as f64, 4, niters);
            best = Some((h, mask, count));
        }
    }

    let (best_h, best_mask, best_count) = best?;
    debug!("ransac: {best_count}/{n} inliers after {iter} iterations");

    // Refit on the inliers; keep the refit only if it does not lose support.
    let inlier_src: Vec<Point2d> = src.iter().zip(&best_mask).filter(|(_, &m)| m).map(|(p, _)| *p).collect();
    let inlier_dst: Vec<Point2d> = dst.iter().zip(&best_mask).filter(|(_, &m)| m).map(|(p, _)| *p).collect();

    if let Some(refit) = estimate_homography_dlt(&inlier_src, &inlier_dst) {
        let (mask, count) = score(&refit, src, dst, cfg.reproj_threshold);
        if count >= best_count {
            return Some(RansacResult {
                homography: refit,
                inlier_mask: mask,
                n_inliers: count,
            });
        }
    }

    Some(RansacResult {
        homography: best_h,
        inlier_mask: best_mask,
        n_inliers: best_count,
    })
}

/// Source points in canonical template space and destination points in the
/// image, four per matched box, in box order.
pub fn build_correspondences(
    boxes: &[TemplateBox],
    record: &MatchRecord,
    size: &TemplateSize,
) -> (Vec<Point2d>, Vec<Point2d>) {
    let mut src = Vec::new();
    let mut dst = Vec::new();
    for (b, slot) in boxes.iter().zip(record.slots()) {
        let Some(rect) = slot else { continue };
        src.extend(percent_box_to_corners(b, size.width, size.height));
        dst.extend(rect_to_corners(rect));
    }
    (src, dst)
}

#[derive(Debug, Clone)]
pub struct HomographyEstimator {
    ransac: RansacConfig,
    size: TemplateSize,
}

impl HomographyEstimator {
    pub fn new(config: &RegistrationConfig) -> Self {
        Self {
            ransac: config.ransac.clone(),
            size: config.template_size,
        }
    }

    /// Homography from the matched boxes of `record`; `None` with fewer than
    /// four correspondence points.
    pub fn estimate(&self, boxes: &[TemplateBox], record: &MatchRecord) -> Option<RansacResult> {
        let (src, dst) = build_correspondences(boxes, record, &self.size);
        if src.len() < 4 {
            debug!("only {} correspondence points, homography skipped", src.len());
            return None;
        }
        find_homography_ransac(&src, &dst, &self.ransac)
    }
}
