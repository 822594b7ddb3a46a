//! Per-frame registration: `(frame, template boxes, config) -> FrameEvaluation`.
//!
//! Nothing is carried between frames. Two variants exist:
//!
//! - `AssumedScreen`: template boxes are laid into a centred screen of fixed
//!   proportions, detections are assigned by the active strategy and the
//!   homography is fitted from the partial matches.
//! - `RoiHomography`: the screen quadrilateral is located inside the ROI
//!   annulus, its corners give a 4-point homography, every template box is
//!   projected through it and re-scored against all detections.

use log::{debug, trace};
use serde::Serialize;

use crate::contours::{Quad, QuadDetector};
use crate::engine::{MatchedBox, RegistrationError};
use crate::geometry::{order_polygon, Point2d, Rect};
use crate::homography::{homography_from_4pt, Homography, HomographyEstimator};
use crate::image_impl::{colors, draw_rect, Frame};
use crate::matcher::{expected_rects_from_homography, expected_rects_in_screen, AssignmentStrategy, MatchRecord, TemplateMatcher};
use crate::roi::{RoiBounds, ScreenCandidate, ScreenLocator};
use crate::template::TemplateBox;
use crate::types::{PipelineVariant, RegistrationConfig};

/// Everything computed for one frame.
#[derive(Debug, Clone)]
pub struct FrameEvaluation {
    /// Input frame with ROI, screen and box overlays.
    pub annotated_frame: Frame,
    /// Clean copy of the input, present only when the frame is accepted.
    pub capture_frame: Option<Frame>,
    pub homography: Option<Homography>,
    pub inlier_mask: Option<Vec<bool>>,
    pub accuracy: f64,
    pub match_record: MatchRecord,
    pub screen: Option<ScreenCandidate>,
    /// Where each template box was looked for, parallel to the template.
    pub expected_rects: Vec<Rect>,
}

impl FrameEvaluation {
    pub fn is_accepted(&self) -> bool {
        self.capture_frame.is_some()
    }

    pub fn summary(&self) -> EvaluationSummary {
        EvaluationSummary {
            accepted: self.is_accepted(),
            accuracy: self.accuracy,
            matched: self.match_record.matched_count(),
            total: self.match_record.len(),
            screen: self.screen.map(|s| {
                let (x, y, w, h) = s.rect.to_ints();
                MatchedBox { x, y, w, h }
            }),
            homography: self.homography.map(|h| h.to_array()),
            homography_inliers_mask: self
                .inlier_mask
                .as_ref()
                .map(|m| m.iter().map(|&b| b as u8).collect()),
            matched_boxes: self
                .match_record
                .slots()
                .iter()
                .map(|slot| {
                    slot.map(|r| {
                        let (x, y, w, h) = r.to_ints();
                        MatchedBox { x, y, w, h }
                    })
                })
                .collect(),
        }
    }
}

/// Serializable view of a [`FrameEvaluation`] without the images.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationSummary {
    pub accepted: bool,
    pub accuracy: f64,
    pub matched: usize,
    pub total: usize,
    pub screen: Option<MatchedBox>,
    pub homography: Option<[[f64; 3]; 3]>,
    pub homography_inliers_mask: Option<Vec<u8>>,
    pub matched_boxes: Vec<Option<MatchedBox>>,
}

/// Components built once from an immutable configuration.
#[derive(Debug)]
pub struct RegistrationPipeline {
    config: RegistrationConfig,
    detector: QuadDetector,
    locator: ScreenLocator,
    matcher: TemplateMatcher,
    estimator: HomographyEstimator,
}

impl RegistrationPipeline {
    pub fn new(config: RegistrationConfig) -> Result<Self, RegistrationError> {
        config.validate()?;
        let pipeline = Self {
            detector: QuadDetector::new(&config),
            locator: ScreenLocator::new(&config),
            matcher: TemplateMatcher::new(&config),
            estimator: HomographyEstimator::new(&config),
            config,
        };
        debug!(
            "pipeline {:?} with {} matching, threshold {}",
            pipeline.config.variant,
            pipeline.matcher.strategy().name(),
            pipeline.config.box_accuracy_threshold
        );
        Ok(pipeline)
    }

    /// Replaces the configured assignment strategy.
    pub fn with_strategy(mut self, strategy: Box<dyn AssignmentStrategy>) -> Self {
        self.matcher = self.matcher.with_strategy(strategy);
        self
    }

    pub fn config(&self) -> &RegistrationConfig {
        &self.config
    }

    pub fn matcher(&self) -> &TemplateMatcher {
        &self.matcher
    }

    pub fn estimator(&self) -> &HomographyEstimator {
        &self.estimator
    }

    pub fn roi_bounds(&self, frame_width: u32, frame_height: u32) -> RoiBounds {
        self.locator.bounds(frame_width, frame_height)
    }

    /// Evaluates a frame as delivered by the source, rotating it first.
    pub fn evaluate_capture(&self, raw: &Frame, boxes: &[TemplateBox]) -> FrameEvaluation {
        let rotated = raw.rotate(self.config.frame_rotation);
        self.evaluate_frame(&rotated, boxes)
    }

    /// Detects quadrilaterals in `frame` and evaluates them.
    pub fn evaluate_frame(&self, frame: &Frame, boxes: &[TemplateBox]) -> FrameEvaluation {
        let quads = self.detector.detect(frame);
        self.evaluate_quads(frame, &quads, boxes)
    }

    /// Evaluates already detected quadrilaterals; `frame` supplies the
    /// dimensions and the canvas for annotation.
    pub fn evaluate_quads(&self, frame: &Frame, quads: &[Quad], boxes: &[TemplateBox]) -> FrameEvaluation {
        let detected: Vec<Rect> = quads.iter().map(Quad::bounding_rect).collect();
        let mut eval = match self.config.variant {
            PipelineVariant::AssumedScreen => self.evaluate_assumed_screen(frame, &detected, boxes),
            PipelineVariant::RoiHomography => self.evaluate_roi(frame, quads, &detected, boxes),
        };

        for rect in &eval.expected_rects {
            draw_rect(&mut eval.annotated_frame, rect, colors::BLUE, 1);
        }
        for rect in eval.match_record.slots().iter().flatten() {
            draw_rect(&mut eval.annotated_frame, rect, colors::RED, 2);
        }

        if !boxes.is_empty() && eval.accuracy >= self.config.box_accuracy_threshold {
            eval.capture_frame = Some(frame.clone());
        }
        eval
    }

    fn evaluate_assumed_screen(&self, frame: &Frame, detected: &[Rect], boxes: &[TemplateBox]) -> FrameEvaluation {
        let screen = self.matcher.assumed_screen(frame.width(), frame.height());
        let expected = expected_rects_in_screen(boxes, &screen);
        let record = self.matcher.assign(detected, &expected);

        let mut annotated = frame.clone();
        draw_rect(&mut annotated, &screen, colors::CYAN, 2);

        let fit = self.estimator.estimate(boxes, &record);
        FrameEvaluation {
            annotated_frame: annotated,
            capture_frame: None,
            homography: fit.as_ref().map(|f| f.homography),
            inlier_mask: fit.map(|f| f.inlier_mask),
            accuracy: record.accuracy(),
            match_record: record,
            screen: None,
            expected_rects: expected,
        }
    }

    fn evaluate_roi(&self, frame: &Frame, quads: &[Quad], detected: &[Rect], boxes: &[TemplateBox]) -> FrameEvaluation {
        let bounds = self.locator.bounds(frame.width(), frame.height());
        let mut annotated = frame.clone();
        draw_rect(&mut annotated, &bounds.outer, colors::GREEN, 1);
        draw_rect(&mut annotated, &bounds.inner, colors::RED, 1);

        let mut eval = FrameEvaluation {
            annotated_frame: annotated,
            capture_frame: None,
            homography: None,
            inlier_mask: None,
            accuracy: 0.0,
            match_record: MatchRecord::unmatched(boxes.len()),
            screen: None,
            expected_rects: Vec::new(),
        };

        let Some(candidate) = self.locator.locate(quads, &bounds) else {
            trace!("{}", RegistrationError::NoScreenCandidate);
            return eval;
        };
        draw_rect(&mut eval.annotated_frame, &candidate.rect, colors::CYAN, 2);
        eval.screen = Some(candidate);

        let Some(screen_h) = self.screen_homography(&candidate) else {
            debug!("degenerate screen quadrilateral {:?}", candidate.polygon);
            return eval;
        };

        let size = &self.config.template_size;
        let expected = expected_rects_from_homography(boxes, &screen_h, size);
        let record = self.matcher.rescore(&expected, detected);

        let refined = if self.config.refine_with_matches && record.matched_count() > 0 {
            self.estimator.estimate(boxes, &record)
        } else {
            None
        };
        let (homography, mask) = match refined {
            Some(fit) => (fit.homography, fit.inlier_mask),
            None => (screen_h, vec![true; 4]),
        };

        eval.homography = Some(homography);
        eval.inlier_mask = Some(mask);
        eval.accuracy = record.accuracy();
        eval.match_record = record;
        eval.expected_rects = expected;
        eval
    }

    /// Canonical canvas corners to the ordered screen polygon.
    fn screen_homography(&self, candidate: &ScreenCandidate) -> Option<Homography> {
        let w = self.config.template_size.width as f64;
        let h = self.config.template_size.height as f64;
        let src = [
            Point2d::new(0.0, 0.0),
            Point2d::new(w, 0.0),
            Point2d::new(w, h),
            Point2d::new(0.0, h),
        ];
        let dst = order_polygon(&candidate.polygon).unwrap_or(candidate.polygon);
        homography_from_4pt(&src, &dst)
    }
}

/// One-shot evaluation with a freshly built pipeline.
pub fn evaluate_frame(
    frame: &Frame,
    boxes: &[TemplateBox],
    config: &RegistrationConfig,
) -> Result<FrameEvaluation, RegistrationError> {
    let pipeline = RegistrationPipeline::new(config.clone())?;
    Ok(pipeline.evaluate_frame(frame, boxes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MatchStrategy, RoiConfig, TemplateSize};
    use approx::assert_relative_eq;
    use image::Rgb;

    fn two_boxes() -> Vec<TemplateBox> {
        vec![
            TemplateBox::new("a", 10.0, 10.0, 20.0, 10.0),
            TemplateBox::new("b", 50.0, 50.0, 20.0, 10.0),
        ]
    }

    fn roi_config() -> RegistrationConfig {
        RegistrationConfig {
            outer_roi: RoiConfig::full_frame(),
            inner_roi: RoiConfig::percent(40.0, 40.0, 20.0, 20.0),
            template_size: TemplateSize { width: 1200, height: 1600 },
            ..RegistrationConfig::default()
        }
    }

    fn screen_quad() -> Quad {
        Quad::from_rect(&Rect::new(0.0, 0.0, 299.0, 399.0))
    }

    // Box "a" spans canonical (120, 160)-(360, 320), i.e. (30, 40, 60, 40) at a
    // quarter scale; box "b" (150, 200, 60, 40). Corner pixels are inclusive.
    fn box_quads() -> Vec<Quad> {
        vec![
            Quad::from_rect(&Rect::new(30.0, 40.0, 59.0, 39.0)),
            Quad::from_rect(&Rect::new(150.0, 200.0, 59.0, 39.0)),
        ]
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = RegistrationConfig {
            box_accuracy_threshold: 1.5,
            ..RegistrationConfig::default()
        };
        assert!(matches!(
            RegistrationPipeline::new(cfg),
            Err(RegistrationError::InvalidConfig(_))
        ));
    }

    #[test]
    fn roi_variant_without_screen_scores_zero() {
        let pipeline = RegistrationPipeline::new(roi_config()).unwrap();
        let frame = Frame::filled(300, 400, Rgb([0, 0, 0]));
        let eval = pipeline.evaluate_quads(&frame, &box_quads(), &two_boxes());
        assert!(eval.screen.is_none() && eval.homography.is_none());
        assert_eq!(eval.accuracy, 0.0);
        assert_eq!(eval.match_record.len(), 2);
        assert!(!eval.is_accepted());
        // ROI outlines are still drawn.
        assert_eq!(eval.annotated_frame.as_rgb().get_pixel(0, 0), &colors::GREEN);
    }

    #[test]
    fn roi_variant_accepts_when_all_boxes_found() {
        let pipeline = RegistrationPipeline::new(roi_config()).unwrap();
        let frame = Frame::filled(300, 400, Rgb([0, 0, 0]));
        let mut quads = vec![screen_quad()];
        quads.extend(box_quads());

        let eval = pipeline.evaluate_quads(&frame, &quads, &two_boxes());
        assert_eq!(eval.screen.unwrap().rect, Rect::new(0.0, 0.0, 300.0, 400.0));
        assert_eq!(eval.accuracy, 1.0);
        assert_eq!(eval.capture_frame.as_ref(), Some(&frame));
        assert_eq!(eval.inlier_mask.as_ref().map(Vec::len), Some(8));

        let h = eval.homography.unwrap();
        let p = h.apply(&Point2d::new(120.0, 160.0));
        assert_relative_eq!(p.x, 30.0, epsilon = 1e-6);
        assert_relative_eq!(p.y, 40.0, epsilon = 1e-6);
    }

    #[test]
    fn roi_variant_partial_match_stays_below_threshold() {
        let pipeline = RegistrationPipeline::new(roi_config()).unwrap();
        let frame = Frame::filled(300, 400, Rgb([0, 0, 0]));
        let quads = vec![screen_quad(), box_quads()[0]];

        let eval = pipeline.evaluate_quads(&frame, &quads, &two_boxes());
        assert_eq!(eval.accuracy, 0.5);
        assert!(eval.match_record.get(0).is_some() && eval.match_record.get(1).is_none());
        assert!(eval.capture_frame.is_none());
        assert!(eval.homography.is_some());
    }

    #[test]
    fn roi_variant_reports_screen_homography_without_refinement() {
        let cfg = RegistrationConfig {
            refine_with_matches: false,
            ..roi_config()
        };
        let pipeline = RegistrationPipeline::new(cfg).unwrap();
        let frame = Frame::filled(300, 400, Rgb([0, 0, 0]));
        let mut quads = vec![screen_quad()];
        quads.extend(box_quads());

        let eval = pipeline.evaluate_quads(&frame, &quads, &two_boxes());
        assert_eq!(eval.inlier_mask, Some(vec![true; 4]));
        let corner = eval.homography.unwrap().apply(&Point2d::new(1200.0, 1600.0));
        assert_relative_eq!(corner.x, 299.0, epsilon = 1e-6);
        assert_relative_eq!(corner.y, 399.0, epsilon = 1e-6);
    }

    #[test]
    fn assumed_screen_variant_matches_boxes_in_centred_screen() {
        let pipeline = RegistrationPipeline::new(RegistrationConfig::assumed_screen()).unwrap();
        let frame = Frame::filled(750, 1000, Rgb([0, 0, 0]));
        let boxes = two_boxes();
        // Screen is (75, 100, 600, 800): canonical space at half scale.
        let expected = expected_rects_in_screen(&boxes, &Rect::new(75.0, 100.0, 600.0, 800.0));
        let quads: Vec<Quad> = expected
            .iter()
            .map(|r| Quad::from_rect(&Rect::new(r.x, r.y, r.width - 1.0, r.height - 1.0)))
            .collect();

        let eval = pipeline.evaluate_quads(&frame, &quads, &boxes);
        assert_eq!(eval.expected_rects, expected);
        assert_eq!(eval.accuracy, 1.0);
        assert!(eval.is_accepted());
        assert!(eval.screen.is_none());

        let p = eval.homography.unwrap().apply(&Point2d::new(120.0, 160.0));
        assert_relative_eq!(p.x, 135.0, epsilon = 1e-6);
        assert_relative_eq!(p.y, 180.0, epsilon = 1e-6);
    }

    #[test]
    fn assumed_screen_with_no_detections_has_no_homography() {
        let pipeline = RegistrationPipeline::new(RegistrationConfig::assumed_screen()).unwrap();
        let frame = Frame::filled(600, 900, Rgb([0, 0, 0]));
        let eval = pipeline.evaluate_frame(&frame, &two_boxes());
        assert_eq!(eval.accuracy, 0.0);
        assert!(eval.homography.is_none() && eval.inlier_mask.is_none());
        assert!(!eval.is_accepted());
    }

    #[test]
    fn zero_sized_frame_evaluates_without_matches() {
        for cfg in [roi_config(), RegistrationConfig::assumed_screen()] {
            let pipeline = RegistrationPipeline::new(cfg).unwrap();
            for (w, h) in [(0, 0), (0, 40), (40, 0)] {
                let eval = pipeline.evaluate_frame(&Frame::filled(w, h, Rgb([0, 0, 0])), &two_boxes());
                assert_eq!(eval.accuracy, 0.0);
                assert!(eval.homography.is_none());
                assert!(!eval.is_accepted());
            }
        }
    }

    #[test]
    fn empty_template_is_never_accepted() {
        let cfg = RegistrationConfig {
            box_accuracy_threshold: 0.0,
            ..RegistrationConfig::assumed_screen()
        };
        let frame = Frame::filled(60, 90, Rgb([0, 0, 0]));
        let eval = evaluate_frame(&frame, &[], &cfg).unwrap();
        assert!(!eval.is_accepted());
        assert!(eval.match_record.is_empty());
    }

    #[test]
    fn optimal_strategy_can_be_selected() {
        let cfg = RegistrationConfig {
            match_strategy: MatchStrategy::Optimal,
            ..RegistrationConfig::assumed_screen()
        };
        let pipeline = RegistrationPipeline::new(cfg).unwrap();
        assert_eq!(pipeline.matcher().strategy().name(), "optimal");
    }

    #[test]
    fn summary_serializes_matches() {
        let pipeline = RegistrationPipeline::new(roi_config()).unwrap();
        let frame = Frame::filled(300, 400, Rgb([0, 0, 0]));
        let quads = vec![screen_quad(), box_quads()[0]];
        let summary = pipeline.evaluate_quads(&frame, &quads, &two_boxes()).summary();

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["matched"], 1);
        assert_eq!(json["total"], 2);
        assert_eq!(json["matched_boxes"][0]["w"], 60);
        assert!(json["matched_boxes"][1].is_null());
        assert_eq!(json["screen"]["h"], 400);
    }
}
