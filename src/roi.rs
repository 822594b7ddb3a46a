//! Region-of-interest bounds and screen candidate selection.
//!
//! The screen must sit inside the outer ROI and cover the inner ROI, both
//! adjusted to the screen aspect ratio and compared with a pixel tolerance.

use log::trace;

use crate::contours::Quad;
use crate::geometry::{iou, Point2d, Rect};
use crate::types::{Aspect, RegistrationConfig, RoiConfig};

/// Pixel rectangle of an ROI config on a `frame_width` x `frame_height` frame,
/// rounded, with size at least 1, then fitted to `aspect`.
pub fn resolve_roi_rect(cfg: &RoiConfig, frame_width: u32, frame_height: u32, aspect: &Aspect) -> Rect {
    let x = cfg.x.resolve(frame_width);
    let y = cfg.y.resolve(frame_height);
    let width = cfg.width.resolve(frame_width);
    let height = cfg.height.resolve(frame_height);

    let rect = Rect::new(
        x.round_ties_even(),
        y.round_ties_even(),
        width.round_ties_even().max(1.0),
        height.round_ties_even().max(1.0),
    );
    adjust_rect_to_ratio(&rect, frame_width, frame_height, aspect.ratio())
}

/// Shrinks the longer axis of `rect` around its centre until `width / height`
/// equals `target_ratio`, then clamps the result into the frame.
pub fn adjust_rect_to_ratio(rect: &Rect, frame_width: u32, frame_height: u32, target_ratio: f64) -> Rect {
    if rect.width <= 0.0 || rect.height <= 0.0 {
        return *rect;
    }

    let current_ratio = rect.width / rect.height;
    let mut new_w = rect.width;
    let mut new_h = rect.height;

    if (current_ratio - target_ratio).abs() > 1e-6 {
        if current_ratio > target_ratio {
            new_w = (rect.height * target_ratio).round_ties_even().max(1.0);
        } else {
            new_h = (rect.width / target_ratio).round_ties_even().max(1.0);
        }
    }

    let cx = rect.x + rect.width / 2.0;
    let cy = rect.y + rect.height / 2.0;
    let new_x = (cx - new_w / 2.0).round_ties_even();
    let new_y = (cy - new_h / 2.0).round_ties_even();

    let new_x = new_x.min(frame_width as f64 - new_w).max(0.0);
    let new_y = new_y.min(frame_height as f64 - new_h).max(0.0);

    Rect::new(new_x, new_y, new_w, new_h)
}

/// True when `test` lies inside `outer` and covers `inner`, each edge allowed
/// to miss by `tolerance` pixels.
pub fn rect_within_roi(test: &Rect, inner: &Rect, outer: &Rect, tolerance: f64) -> bool {
    let (tx1, ty1, tx2, ty2) = (test.x, test.y, test.right(), test.bottom());

    if tx1 < outer.x - tolerance
        || ty1 < outer.y - tolerance
        || tx2 > outer.right() + tolerance
        || ty2 > outer.bottom() + tolerance
    {
        return false;
    }

    tx1 <= inner.x + tolerance
        && ty1 <= inner.y + tolerance
        && tx2 >= inner.right() - tolerance
        && ty2 >= inner.bottom() - tolerance
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoiBounds {
    pub outer: Rect,
    pub inner: Rect,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenCandidate {
    /// Integer bounding rectangle of the quadrilateral.
    pub rect: Rect,
    pub polygon: [Point2d; 4],
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct ScreenLocator {
    outer: RoiConfig,
    inner: RoiConfig,
    aspect: Aspect,
    tolerance: f64,
}

impl ScreenLocator {
    pub fn new(config: &RegistrationConfig) -> Self {
        Self {
            outer: config.outer_roi,
            inner: config.inner_roi,
            aspect: config.screen_aspect,
            tolerance: config.roi_tolerance_px as f64,
        }
    }

    pub fn bounds(&self, frame_width: u32, frame_height: u32) -> RoiBounds {
        RoiBounds {
            outer: resolve_roi_rect(&self.outer, frame_width, frame_height, &self.aspect),
            inner: resolve_roi_rect(&self.inner, frame_width, frame_height, &self.aspect),
        }
    }

    /// Best quadrilateral inside the ROI annulus, scored by how well its
    /// integer bounding rectangle agrees with the corner bounding box.
    pub fn locate(&self, quads: &[Quad], bounds: &RoiBounds) -> Option<ScreenCandidate> {
        let mut best: Option<ScreenCandidate> = None;
        let mut best_score = 0.0;

        for quad in quads {
            let rect = quad.bounding_rect();
            if !rect_within_roi(&rect, &bounds.inner, &bounds.outer, self.tolerance) {
                continue;
            }
            let score = iou(&rect, &quad.bbox());
            trace!("screen candidate {:?} score {:.4}", rect, score);
            if score > best_score {
                best_score = score;
                best = Some(ScreenCandidate {
                    rect,
                    polygon: quad.points,
                    score,
                });
            }
        }
        best
    }
}
