use std::ops::ControlFlow;

use log::{debug, info, warn};
use serde::Serialize;

use crate::image_impl::Frame;
use crate::pipeline::{FrameEvaluation, RegistrationPipeline};
use crate::source::{grab_latest_frame, FrameRead, FrameSource, SourceGuard};
use crate::template::TemplateBox;
use crate::types::PipelineVariant;

#[derive(thiserror::Error, Debug)]
pub enum RegistrationError {
    #[error("Unable to open video source: {0}")]
    SourceUnavailable(String),

    #[error("Failed to read frame: {0}")]
    FrameReadFailure(String),

    #[error("Template load error: {0}")]
    TemplateLoad(String),

    #[error("No screen candidate inside the ROI")]
    NoScreenCandidate,

    #[error("Insufficient correspondences for homography")]
    InsufficientCorrespondences,

    #[error("No sufficient matches obtained after {frames} frames")]
    StreamExhausted { frames: usize },

    #[error("Detection stopped after {frames} frames")]
    Stopped { frames: usize },

    #[error("Polygon needs exactly 4 points, got {0}")]
    InvalidPolygon(usize),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Session already finished in state {0:?}")]
    SessionFinished(SessionState),

    #[error("Image processing error: {0}")]
    ImageError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<image::ImageError> for RegistrationError {
    fn from(err: image::ImageError) -> Self {
        RegistrationError::ImageError(err.to_string())
    }
}

impl RegistrationError {
    /// Process exit code used by the command line front end.
    pub fn exit_code(&self) -> u8 {
        match self {
            RegistrationError::SourceUnavailable(_) => 1,
            RegistrationError::StreamExhausted { .. } | RegistrationError::Stopped { .. } => 2,
            RegistrationError::InsufficientCorrespondences => 3,
            _ => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Searching,
    Accepted,
    Exhausted,
    /// A frame cleared the threshold but no homography could be fitted.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TargetSize {
    pub w: u32,
    pub h: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MatchedBox {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

/// Final payload of an accepted frame.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrationResult {
    pub frame: usize,
    pub variant: PipelineVariant,
    pub accuracy: f64,
    pub accuracy_threshold: f64,
    pub template_target_size: TargetSize,
    pub homography: Option<[[f64; 3]; 3]>,
    pub homography_inliers_mask: Option<Vec<u8>>,
    pub matched_boxes: Vec<Option<MatchedBox>>,
    pub template_boxes: Vec<TemplateBox>,
}

#[derive(Debug, Clone)]
pub struct RegistrationOutcome {
    pub result: RegistrationResult,
    pub evaluation: FrameEvaluation,
}

/// Observations handed to the caller while a session runs.
#[derive(Debug)]
pub enum SessionEvent<'a> {
    Frame {
        index: usize,
        evaluation: &'a FrameEvaluation,
    },
    Progress {
        frame: usize,
        matched: usize,
        total: usize,
        accuracy: f64,
    },
    ReadFailure {
        frame: usize,
        message: &'a str,
    },
}

pub enum Step {
    Searching(FrameEvaluation),
    Accepted(Box<RegistrationOutcome>),
}

/// Frame loop for one registration attempt: SEARCHING until a frame clears the
/// acceptance threshold (ACCEPTED) or the source runs dry (EXHAUSTED). An
/// accepted frame without a homography ends in FAILED.
pub struct DetectionSession<'a> {
    pipeline: &'a RegistrationPipeline,
    boxes: &'a [TemplateBox],
    state: SessionState,
    frame_count: usize,
}

impl<'a> DetectionSession<'a> {
    pub fn new(pipeline: &'a RegistrationPipeline, boxes: &'a [TemplateBox]) -> Self {
        Self {
            pipeline,
            boxes,
            state: SessionState::Searching,
            frame_count: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Evaluates one raw frame. Rotation from the configuration is applied here.
    pub fn step(&mut self, frame: &Frame) -> Result<Step, RegistrationError> {
        if self.state != SessionState::Searching {
            return Err(RegistrationError::SessionFinished(self.state));
        }

        let pipeline = self.pipeline;
        let config = pipeline.config();
        let evaluation = pipeline.evaluate_capture(frame, self.boxes);
        self.frame_count += 1;

        debug!(
            "frame {}: accuracy {:.3} ({}/{}), screen {}",
            self.frame_count,
            evaluation.accuracy,
            evaluation.match_record.matched_count(),
            evaluation.match_record.len(),
            if evaluation.screen.is_some() { "found" } else { "missing" }
        );

        if evaluation.capture_frame.is_none() {
            return Ok(Step::Searching(evaluation));
        }

        let Some(homography) = evaluation.homography else {
            warn!(
                "frame {} reached accuracy {:.3} without a homography",
                self.frame_count, evaluation.accuracy
            );
            self.state = SessionState::Failed;
            return Err(RegistrationError::InsufficientCorrespondences);
        };
        self.state = SessionState::Accepted;

        info!(
            "screen accepted at frame {} with accuracy {:.2}",
            self.frame_count, evaluation.accuracy
        );

        let result = RegistrationResult {
            frame: self.frame_count,
            variant: config.variant,
            accuracy: evaluation.accuracy,
            accuracy_threshold: config.box_accuracy_threshold,
            template_target_size: TargetSize {
                w: config.template_size.width,
                h: config.template_size.height,
            },
            homography: Some(homography.to_array()),
            homography_inliers_mask: evaluation
                .inlier_mask
                .as_ref()
                .map(|m| m.iter().map(|&b| b as u8).collect()),
            matched_boxes: evaluation
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
            template_boxes: self.boxes.to_vec(),
        };

        Ok(Step::Accepted(Box::new(RegistrationOutcome { result, evaluation })))
    }

    /// Pulls frames from `source` until acceptance, exhaustion, or the observer
    /// breaks. The source is released on every exit path.
    pub fn run<S, F>(&mut self, source: S, mut observer: F) -> Result<RegistrationOutcome, RegistrationError>
    where
        S: FrameSource,
        F: FnMut(SessionEvent<'_>) -> ControlFlow<()>,
    {
        let mut source = SourceGuard::new(source);
        let pipeline = self.pipeline;
        let config = pipeline.config();
        let mut consecutive_failures = 0usize;

        loop {
            let frame = match grab_latest_frame(&mut *source, config.drain_frames) {
                FrameRead::Frame(frame) => {
                    consecutive_failures = 0;
                    frame
                }
                FrameRead::Failed(message) => {
                    consecutive_failures += 1;
                    warn!("failed to read frame: {message}");
                    if consecutive_failures >= config.max_consecutive_read_failures {
                        warn!("{consecutive_failures} consecutive read failures, treating source as ended");
                        self.state = SessionState::Exhausted;
                        return Err(RegistrationError::StreamExhausted {
                            frames: self.frame_count,
                        });
                    }
                    let event = SessionEvent::ReadFailure {
                        frame: self.frame_count,
                        message: &message,
                    };
                    if observer(event).is_break() {
                        return Err(RegistrationError::Stopped {
                            frames: self.frame_count,
                        });
                    }
                    continue;
                }
                FrameRead::EndOfStream => {
                    self.state = SessionState::Exhausted;
                    info!("source ended after {} frames without acceptance", self.frame_count);
                    return Err(RegistrationError::StreamExhausted {
                        frames: self.frame_count,
                    });
                }
            };

            let step = self.step(&frame)?;
            let evaluation = match &step {
                Step::Searching(evaluation) => evaluation,
                Step::Accepted(outcome) => &outcome.evaluation,
            };

            let mut flow = observer(SessionEvent::Frame {
                index: self.frame_count,
                evaluation,
            });

            if config.progress_interval > 0 && self.frame_count % config.progress_interval == 0 {
                let matched = evaluation.match_record.matched_count();
                let total = evaluation.match_record.len();
                info!(
                    "frame {}: matched {}/{} (accuracy {:.4})",
                    self.frame_count, matched, total, evaluation.accuracy
                );
                if flow.is_continue() {
                    flow = observer(SessionEvent::Progress {
                        frame: self.frame_count,
                        matched,
                        total,
                        accuracy: evaluation.accuracy,
                    });
                }
            }

            match step {
                Step::Accepted(outcome) => return Ok(*outcome),
                Step::Searching(_) if flow.is_break() => {
                    return Err(RegistrationError::Stopped {
                        frames: self.frame_count,
                    })
                }
                Step::Searching(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_distinguish_failures() {
        assert_eq!(RegistrationError::SourceUnavailable("x".into()).exit_code(), 1);
        assert_eq!(RegistrationError::StreamExhausted { frames: 3 }.exit_code(), 2);
        assert_eq!(RegistrationError::Stopped { frames: 3 }.exit_code(), 2);
        assert_eq!(RegistrationError::InsufficientCorrespondences.exit_code(), 3);
        assert_eq!(RegistrationError::TemplateLoad("x".into()).exit_code(), 4);
        assert_eq!(RegistrationError::SessionFinished(SessionState::Accepted).exit_code(), 4);
    }

    #[test]
    fn error_messages_read_like_events() {
        let err = RegistrationError::StreamExhausted { frames: 12 };
        assert_eq!(err.to_string(), "No sufficient matches obtained after 12 frames");
        assert_eq!(
            RegistrationError::InvalidPolygon(5).to_string(),
            "Polygon needs exactly 4 points, got 5"
        );
    }
}
