//! # screenreg - screen detection and template registration
//!
//! screenreg locates a rectangular screen inside camera frames and registers a
//! percentage-based box template onto it through a homography fitted from
//! partial box correspondences.
//!
//! ## Features
//!
//! - **Pure Rust**: `image`/`imageproc` for rasters and edges, `nalgebra` for the linear algebra
//! - **Partial matches**: one matched box (four corners) is enough for a homography
//! - **Robust**: RANSAC with an inlier mask, reprojection threshold in pixels
//! - **Pluggable matching**: greedy last-wins (default) or optimal bipartite assignment
//! - **Stateless frames**: every frame is evaluated independently, sources are released on every exit path
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use screenreg::{default_template_boxes, RegistrationConfig, ScreenRegistrar};
//!
//! let registrar = ScreenRegistrar::new(RegistrationConfig::default(), default_template_boxes())?;
//! let outcome = registrar.register_directory("frames/")?;
//!
//! println!("accepted frame {} with accuracy {:.2}", outcome.result.frame, outcome.result.accuracy);
//! println!("{}", serde_json::to_string_pretty(&outcome.result)?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// Core modules
pub mod contours;
pub mod engine;
pub mod geometry;
pub mod homography;
pub mod image_impl;
pub mod matcher;
pub mod pipeline;
pub mod projection;
pub mod roi;
pub mod source;
pub mod template;
pub mod types;

// FFI module for C bindings
#[cfg(feature = "ffi")]
pub mod ffi;

// Public API exports
pub use crate::engine::{
    DetectionSession, MatchedBox, RegistrationError, RegistrationOutcome, RegistrationResult, SessionEvent,
    SessionState, Step, TargetSize,
};
pub use crate::geometry::{iou, order_polygon, percent_box_to_corners, polygon_bounding_box, rect_to_corners, Point2d, Rect};
pub use crate::homography::{find_homography_ransac, Homography, HomographyEstimator, RansacResult};
pub use crate::image_impl::Frame;
pub use crate::matcher::{AssignmentStrategy, GreedyLastWins, MatchRecord, OptimalBipartite};
pub use crate::pipeline::{evaluate_frame, EvaluationSummary, FrameEvaluation, RegistrationPipeline};
pub use crate::projection::{overlay_from_partial_matches, project_box, rectified_with_template, rectify_frame};
pub use crate::source::{grab_latest_frame, FrameRead, FrameSource, ImageSequenceSource, MemorySource, SourceGuard};
pub use crate::template::{default_template_boxes, load_template, load_template_or, save_template, TemplateBox};
pub use crate::types::{FrameRotation, MatchStrategy, PipelineVariant, RegistrationConfig, RoiConfig, RoiValue};

use std::ops::ControlFlow;
use std::path::Path;

/// Main registration interface: one configuration, one template.
#[derive(Debug)]
pub struct ScreenRegistrar {
    pipeline: RegistrationPipeline,
    boxes: Vec<TemplateBox>,
}

impl ScreenRegistrar {
    /// Create a registrar; the configuration is validated here.
    pub fn new(config: RegistrationConfig, boxes: Vec<TemplateBox>) -> Result<Self, RegistrationError> {
        Ok(Self {
            pipeline: RegistrationPipeline::new(config)?,
            boxes,
        })
    }

    /// Load the template (and optionally the configuration) from JSON files.
    pub fn from_files<P: AsRef<Path>>(template_path: P, config_path: Option<&Path>) -> Result<Self, RegistrationError> {
        let config = match config_path {
            Some(path) => RegistrationConfig::from_json_file(path)?,
            None => RegistrationConfig::default(),
        };
        Self::new(config, load_template(template_path)?)
    }

    pub fn config(&self) -> &RegistrationConfig {
        self.pipeline.config()
    }

    pub fn pipeline(&self) -> &RegistrationPipeline {
        &self.pipeline
    }

    pub fn boxes(&self) -> &[TemplateBox] {
        &self.boxes
    }

    /// Evaluate a single frame as delivered by a camera (rotation applied).
    pub fn evaluate(&self, frame: &Frame) -> FrameEvaluation {
        self.pipeline.evaluate_capture(frame, &self.boxes)
    }

    /// Evaluate a packed BGR buffer of `width * height * 3` bytes.
    pub fn evaluate_bgr(&self, width: u32, height: u32, data: &[u8]) -> Result<FrameEvaluation, RegistrationError> {
        let frame = Frame::from_bgr8(width, height, data.to_vec())?;
        Ok(self.evaluate(&frame))
    }

    /// Run a detection session over `source` until a frame is accepted.
    pub fn run_source<S, F>(&self, source: S, observer: F) -> Result<RegistrationOutcome, RegistrationError>
    where
        S: FrameSource,
        F: FnMut(SessionEvent<'_>) -> ControlFlow<()>,
    {
        DetectionSession::new(&self.pipeline, &self.boxes).run(source, observer)
    }

    /// Run a session over the still images of a directory.
    pub fn register_directory<P: AsRef<Path>>(&self, dir: P) -> Result<RegistrationOutcome, RegistrationError> {
        let source = ImageSequenceSource::open(dir)?;
        self.run_source(source, |_| ControlFlow::Continue(()))
    }
}
