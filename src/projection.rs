use log::debug;

use crate::engine::RegistrationError;
use crate::geometry::{percent_box_to_corners, Point2d, Rect};
use crate::homography::{Homography, HomographyEstimator};
use crate::image_impl::{colors, draw_polygon, draw_rect, warp_perspective, Frame};
use crate::matcher::MatchRecord;
use crate::template::TemplateBox;
use crate::types::TemplateSize;

/// Canonical corners of `b` mapped into the image, TL, TR, BR, BL.
pub fn project_box(h: &Homography, b: &TemplateBox, template_w: u32, template_h: u32) -> [Point2d; 4] {
    percent_box_to_corners(b, template_w, template_h).map(|p| h.apply(&p))
}

/// Outline of the whole canonical canvas in the image.
pub fn screen_outline(h: &Homography, template_w: u32, template_h: u32) -> [Point2d; 4] {
    let w = template_w.saturating_sub(1) as f64;
    let hgt = template_h.saturating_sub(1) as f64;
    [
        Point2d::new(0.0, 0.0),
        Point2d::new(w, 0.0),
        Point2d::new(w, hgt),
        Point2d::new(0.0, hgt),
    ]
    .map(|p| h.apply(&p))
}

/// Warps the camera frame into canonical template space using the inverse of
/// the template-to-image homography.
pub fn rectify_frame(frame: &Frame, h: &Homography, target_w: u32, target_h: u32) -> Result<Frame, RegistrationError> {
    let inv = h
        .inverse()
        .ok_or_else(|| RegistrationError::ImageError("homography is not invertible".to_string()))?;
    warp_perspective(frame, inv.matrix(), target_w, target_h)
}

/// Draws the template boxes directly in canonical space.
pub fn draw_template_canonical(canvas: &mut Frame, boxes: &[TemplateBox], size: &TemplateSize) {
    let (tw, th) = (size.width as f64, size.height as f64);
    for b in boxes {
        let rect = Rect::new(
            (b.x / 100.0 * tw).trunc(),
            (b.y / 100.0 * th).trunc(),
            (b.width / 100.0 * tw).trunc(),
            (b.height / 100.0 * th).trunc(),
        );
        draw_rect(canvas, &rect, colors::BLUE, 1);
    }
}

/// Rectified view with the template drawn on top.
pub fn rectified_with_template(
    frame: &Frame,
    h: &Homography,
    boxes: &[TemplateBox],
    size: &TemplateSize,
) -> Result<Frame, RegistrationError> {
    let mut warped = rectify_frame(frame, h, size.width, size.height)?;
    draw_template_canonical(&mut warped, boxes, size);
    Ok(warped)
}

#[derive(Debug, Clone)]
pub struct PartialOverlay {
    pub visualization: Frame,
    pub warped: Option<Frame>,
    pub homography: Option<Homography>,
    pub inlier_mask: Option<Vec<bool>>,
}

/// Debug rendering of a homography fitted from partial matches: the projected
/// screen outline (green), matched boxes (orange) and unmatched boxes (yellow).
/// With too few correspondences the frame is returned untouched.
pub fn overlay_from_partial_matches(
    frame: &Frame,
    boxes: &[TemplateBox],
    record: &MatchRecord,
    estimator: &HomographyEstimator,
    size: &TemplateSize,
    draw_warp: bool,
) -> Result<PartialOverlay, RegistrationError> {
    let mut visualization = frame.clone();
    let Some(fit) = estimator.estimate(boxes, record) else {
        debug!("not enough points for a homography");
        return Ok(PartialOverlay {
            visualization,
            warped: None,
            homography: None,
            inlier_mask: None,
        });
    };
    let h = fit.homography;

    draw_polygon(&mut visualization, &screen_outline(&h, size.width, size.height), colors::GREEN, 2);
    for (b, slot) in boxes.iter().zip(record.slots()) {
        let color = if slot.is_some() { colors::ORANGE } else { colors::YELLOW };
        draw_polygon(&mut visualization, &project_box(&h, b, size.width, size.height), color, 2);
    }

    let warped = if draw_warp {
        Some(rectified_with_template(frame, &h, boxes, size)?)
    } else {
        None
    };

    Ok(PartialOverlay {
        visualization,
        warped,
        homography: Some(h),
        inlier_mask: Some(fit.inlier_mask),
    })
}
