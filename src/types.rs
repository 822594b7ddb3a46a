use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::engine::RegistrationError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoiMode {
    #[default]
    Percent,
    Px,
}

/// One ROI axis: either a percentage of the matching frame dimension or a
/// literal pixel value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoiValue {
    #[serde(default)]
    pub mode: RoiMode,
    #[serde(default)]
    pub value: f64,
}

impl RoiValue {
    pub fn percent(value: f64) -> Self {
        Self { mode: RoiMode::Percent, value }
    }

    pub fn px(value: f64) -> Self {
        Self { mode: RoiMode::Px, value }
    }

    pub fn resolve(&self, total_length: u32) -> f64 {
        match self.mode {
            RoiMode::Px => self.value,
            RoiMode::Percent => self.value / 100.0 * total_length as f64,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoiConfig {
    pub x: RoiValue,
    pub y: RoiValue,
    pub width: RoiValue,
    pub height: RoiValue,
}

impl RoiConfig {
    pub fn percent(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x: RoiValue::percent(x),
            y: RoiValue::percent(y),
            width: RoiValue::percent(width),
            height: RoiValue::percent(height),
        }
    }

    pub fn full_frame() -> Self {
        Self::percent(0.0, 0.0, 100.0, 100.0)
    }

    pub fn default_outer() -> Self {
        Self::percent(10.0, 5.0, 80.0, 90.0)
    }

    pub fn default_inner() -> Self {
        Self::percent(30.0, 20.0, 45.0, 60.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameRotation {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "90cw")]
    Cw90,
    #[serde(rename = "90ccw")]
    Ccw90,
    #[serde(rename = "180")]
    Rotate180,
}

/// Which per-frame evaluation the pipeline runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineVariant {
    /// Template laid into a fixed, centred screen region; raw match accuracy.
    AssumedScreen,
    /// Screen located inside the ROI annulus; accuracy re-scored after projecting
    /// every box through the screen homography.
    #[default]
    RoiHomography,
}

/// How detected rectangles are assigned to template slots.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    /// Single pass over detections; the last detection whose best IoU clears the
    /// threshold for a slot overwrites earlier ones.
    #[default]
    Greedy,
    /// Hungarian assignment maximising the summed IoU of accepted pairs.
    Optimal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateSize {
    pub width: u32,
    pub height: u32,
}

impl Default for TemplateSize {
    fn default() -> Self {
        Self {
            width: 1200,
            height: 1600,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Aspect {
    pub w: u32,
    pub h: u32,
}

impl Default for Aspect {
    fn default() -> Self {
        Self { w: 3, h: 4 }
    }
}

impl Aspect {
    pub fn ratio(&self) -> f64 {
        self.w as f64 / self.h as f64
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub low_threshold: f32,
    pub high_threshold: f32,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            low_threshold: 50.0,
            high_threshold: 150.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuadConfig {
    /// Approximation tolerance as a fraction of the contour perimeter.
    pub epsilon_factor: f64,
    /// Tolerances tried in order on the convex hull while it has more than
    /// four vertices.
    pub escalation: Vec<f64>,
}

impl Default for QuadConfig {
    fn default() -> Self {
        Self {
            epsilon_factor: 0.02,
            escalation: vec![0.02, 0.05],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RansacConfig {
    /// Maximum reprojection distance (px) for a correspondence to count as inlier.
    pub reproj_threshold: f64,
    pub max_iters: usize,
    pub confidence: f64,
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            reproj_threshold: 3.0,
            max_iters: 2000,
            confidence: 0.995,
            seed: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub outer_roi: RoiConfig,
    pub inner_roi: RoiConfig,
    pub min_iou_for_match: f64,
    pub box_accuracy_threshold: f64,
    pub roi_tolerance_px: i32,
    pub template_size: TemplateSize,
    pub screen_aspect: Aspect,
    pub screen_width_ratio: f64,
    pub frame_rotation: FrameRotation,
    pub variant: PipelineVariant,
    pub match_strategy: MatchStrategy,
    pub refine_with_matches: bool,
    pub edges: EdgeConfig,
    pub quad: QuadConfig,
    pub ransac: RansacConfig,
    pub drain_frames: usize,
    pub progress_interval: usize,
    pub max_consecutive_read_failures: usize,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            outer_roi: RoiConfig::default_outer(),
            inner_roi: RoiConfig::default_inner(),
            min_iou_for_match: 0.3,
            box_accuracy_threshold: 0.8,
            roi_tolerance_px: 12,
            template_size: TemplateSize::default(),
            screen_aspect: Aspect::default(),
            screen_width_ratio: 0.8,
            frame_rotation: FrameRotation::None,
            variant: PipelineVariant::RoiHomography,
            match_strategy: MatchStrategy::Greedy,
            refine_with_matches: true,
            edges: EdgeConfig::default(),
            quad: QuadConfig::default(),
            ransac: RansacConfig::default(),
            drain_frames: 3,
            progress_interval: 15,
            max_consecutive_read_failures: 30,
        }
    }
}

impl RegistrationConfig {
    /// Assumed-screen evaluation with the lower 0.6 acceptance gate.
    pub fn assumed_screen() -> Self {
        Self {
            variant: PipelineVariant::AssumedScreen,
            box_accuracy_threshold: 0.6,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self, RegistrationError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, RegistrationError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), RegistrationError> {
        let invalid = |msg: String| Err(RegistrationError::InvalidConfig(msg));

        if self.template_size.width == 0 || self.template_size.height == 0 {
            return invalid(format!(
                "template size must be positive, got {}x{}",
                self.template_size.width, self.template_size.height
            ));
        }
        if self.screen_aspect.w == 0 || self.screen_aspect.h == 0 {
            return invalid("screen aspect must be positive".to_string());
        }
        for (name, v) in [
            ("min_iou_for_match", self.min_iou_for_match),
            ("box_accuracy_threshold", self.box_accuracy_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return invalid(format!("{name} must lie in [0, 1], got {v}"));
            }
        }
        if !(self.screen_width_ratio > 0.0 && self.screen_width_ratio <= 1.0) {
            return invalid(format!(
                "screen_width_ratio must lie in (0, 1], got {}",
                self.screen_width_ratio
            ));
        }
        if self.roi_tolerance_px < 0 {
            return invalid("roi_tolerance_px must not be negative".to_string());
        }
        let edges = &self.edges;
        if !(edges.low_threshold >= 0.0 && edges.high_threshold >= edges.low_threshold) {
            return invalid(format!(
                "edge thresholds must satisfy 0 <= low <= high, got {} and {}",
                edges.low_threshold, edges.high_threshold
            ));
        }
        if self.quad.epsilon_factor <= 0.0 || self.quad.escalation.iter().any(|f| *f <= 0.0) {
            return invalid("polygon approximation factors must be positive".to_string());
        }
        if self.ransac.reproj_threshold <= 0.0 {
            return invalid("ransac reproj_threshold must be positive".to_string());
        }
        if !(self.ransac.confidence > 0.0 && self.ransac.confidence < 1.0) {
            return invalid("ransac confidence must lie in (0, 1)".to_string());
        }
        Ok(())
    }
}
