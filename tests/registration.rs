use std::ops::ControlFlow;

use approx::assert_relative_eq;
use image::Rgb;
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect as PixelRect;
use screenreg::roi::{resolve_roi_rect, rect_within_roi};
use screenreg::types::{Aspect, TemplateSize};
use screenreg::{
    DetectionSession, Frame, FrameRotation, HomographyEstimator, MatchRecord, MemorySource, Point2d, Rect,
    RegistrationConfig, RegistrationError, RegistrationPipeline, RoiConfig, ScreenRegistrar, SessionEvent,
    SessionState, TemplateBox,
};

fn two_boxes() -> Vec<TemplateBox> {
    vec![
        TemplateBox::new("a", 10.0, 10.0, 20.0, 10.0),
        TemplateBox::new("b", 50.0, 50.0, 20.0, 10.0),
    ]
}

fn blank() -> Frame {
    Frame::filled(750, 1000, Rgb([0, 0, 0]))
}

/// 750x1000 frame whose assumed screen is (75, 100, 600, 800); both template
/// boxes are painted where that screen expects them.
fn good_frame() -> Frame {
    let mut frame = blank();
    for (x, y) in [(135, 180), (375, 500)] {
        draw_filled_rect_mut(frame.as_rgb_mut(), PixelRect::at(x, y).of_size(120, 80), Rgb([255, 255, 255]));
    }
    frame
}

fn assumed(drain: usize) -> RegistrationConfig {
    RegistrationConfig {
        drain_frames: drain,
        ..RegistrationConfig::assumed_screen()
    }
}

fn continue_all(_: SessionEvent<'_>) -> ControlFlow<()> {
    ControlFlow::Continue(())
}

#[test]
fn session_accepts_painted_boxes() {
    let pipeline = RegistrationPipeline::new(assumed(3)).unwrap();
    let boxes = two_boxes();
    let mut source = MemorySource::new(vec![blank(), blank(), blank(), good_frame()]);

    let mut session = DetectionSession::new(&pipeline, &boxes);
    let outcome = session.run(&mut source, continue_all).unwrap();

    // The first read drains three blank frames, the second reaches the boxes.
    assert_eq!(outcome.result.frame, 2);
    assert_eq!(session.state(), SessionState::Accepted);
    assert_eq!(source.release_count(), 1);

    assert_eq!(outcome.result.accuracy, 1.0);
    assert!(outcome.result.matched_boxes.iter().all(Option::is_some));
    let h = outcome.evaluation.homography.unwrap();
    let p = h.apply(&Point2d::new(120.0, 160.0));
    assert_relative_eq!(p.x, 135.0, epsilon = 3.0);
    assert_relative_eq!(p.y, 180.0, epsilon = 3.0);
    assert_eq!(outcome.evaluation.capture_frame, Some(good_frame()));
}

#[test]
fn session_exhausts_on_blank_stream() {
    let pipeline = RegistrationPipeline::new(assumed(1)).unwrap();
    let boxes = two_boxes();
    let mut source = MemorySource::new((0..5).map(|_| blank()));

    let mut session = DetectionSession::new(&pipeline, &boxes);
    let err = session.run(&mut source, continue_all).unwrap_err();
    assert!(matches!(err, RegistrationError::StreamExhausted { frames: 5 }));
    assert_eq!(err.exit_code(), 2);
    assert_eq!(session.state(), SessionState::Exhausted);
    assert_eq!(source.release_count(), 1);
}

#[test]
fn accepted_frame_without_matches_lacks_correspondences() {
    let cfg = RegistrationConfig {
        box_accuracy_threshold: 0.0,
        ..assumed(1)
    };
    let pipeline = RegistrationPipeline::new(cfg).unwrap();
    let boxes = two_boxes();
    let mut source = MemorySource::new(vec![blank()]);

    let mut session = DetectionSession::new(&pipeline, &boxes);
    let err = session.run(&mut source, continue_all).unwrap_err();
    assert!(matches!(err, RegistrationError::InsufficientCorrespondences));
    assert_eq!(err.exit_code(), 3);
    assert_eq!(session.state(), SessionState::Failed);
    assert_eq!(source.release_count(), 1);

    let again = session.step(&blank()).err();
    assert!(matches!(again, Some(RegistrationError::SessionFinished(SessionState::Failed))));
}

#[test]
fn observer_can_stop_the_session() {
    let pipeline = RegistrationPipeline::new(assumed(1)).unwrap();
    let boxes = two_boxes();
    let mut source = MemorySource::new((0..5).map(|_| blank()));

    let err = DetectionSession::new(&pipeline, &boxes)
        .run(&mut source, |event| match event {
            SessionEvent::Frame { index: 2, .. } => ControlFlow::Break(()),
            _ => ControlFlow::Continue(()),
        })
        .unwrap_err();
    assert!(matches!(err, RegistrationError::Stopped { frames: 2 }));
    assert_eq!(source.release_count(), 1);
}

#[test]
fn progress_is_throttled() {
    let cfg = RegistrationConfig {
        progress_interval: 2,
        ..assumed(1)
    };
    let pipeline = RegistrationPipeline::new(cfg).unwrap();
    let boxes = two_boxes();
    let mut progress = Vec::new();

    let _ = DetectionSession::new(&pipeline, &boxes).run(MemorySource::new((0..5).map(|_| blank())), |event| {
        if let SessionEvent::Progress { frame, matched, total, .. } = event {
            progress.push((frame, matched, total));
        }
        ControlFlow::Continue(())
    });
    assert_eq!(progress, vec![(2, 0, 2), (4, 0, 2)]);
}

#[test]
fn repeated_read_failures_end_the_stream() {
    let cfg = RegistrationConfig {
        max_consecutive_read_failures: 3,
        ..assumed(1)
    };
    let pipeline = RegistrationPipeline::new(cfg).unwrap();
    let boxes = two_boxes();
    let mut source = MemorySource::with_failures((0..10).map(|_| None));
    let mut warnings = 0;

    let err = DetectionSession::new(&pipeline, &boxes)
        .run(&mut source, |event| {
            if matches!(event, SessionEvent::ReadFailure { .. }) {
                warnings += 1;
            }
            ControlFlow::Continue(())
        })
        .unwrap_err();
    assert!(matches!(err, RegistrationError::StreamExhausted { frames: 0 }));
    assert_eq!(warnings, 2);
    assert_eq!(source.release_count(), 1);
}

#[test]
fn transient_read_failure_is_skipped() {
    let pipeline = RegistrationPipeline::new(assumed(1)).unwrap();
    let boxes = two_boxes();
    let source = MemorySource::with_failures(vec![None, None, Some(good_frame())]);

    let outcome = DetectionSession::new(&pipeline, &boxes).run(source, continue_all).unwrap();
    assert_eq!(outcome.result.frame, 1);
}

#[test]
fn rotation_is_applied_before_evaluation() {
    let cfg = RegistrationConfig {
        frame_rotation: FrameRotation::Cw90,
        ..assumed(1)
    };
    let registrar = ScreenRegistrar::new(cfg, two_boxes()).unwrap();
    let sideways = good_frame().rotate(FrameRotation::Ccw90);
    assert_eq!((sideways.width(), sideways.height()), (1000, 750));

    let eval = registrar.evaluate(&sideways);
    assert_eq!(eval.accuracy, 1.0);
    assert!(eval.is_accepted());
}

#[test]
fn registrar_reads_image_directory() {
    let dir = tempfile::tempdir().unwrap();
    blank().save(dir.path().join("frame_000.png")).unwrap();
    good_frame().save(dir.path().join("frame_001.png")).unwrap();

    let registrar = ScreenRegistrar::new(assumed(1), two_boxes()).unwrap();
    let outcome = registrar.register_directory(dir.path()).unwrap();
    assert_eq!(outcome.result.frame, 2);

    let missing = registrar.register_directory(dir.path().join("missing")).unwrap_err();
    assert!(matches!(missing, RegistrationError::SourceUnavailable(_)));
    assert_eq!(missing.exit_code(), 1);
}

#[test]
fn result_serializes_with_event_fields() {
    let registrar = ScreenRegistrar::new(assumed(1), two_boxes()).unwrap();
    let outcome = registrar.run_source(MemorySource::new(vec![good_frame()]), continue_all).unwrap();

    let json = serde_json::to_value(&outcome.result).unwrap();
    assert_eq!(json["frame"], 1);
    assert_eq!(json["variant"], "assumed_screen");
    assert_eq!(json["accuracy_threshold"], 0.6);
    assert_eq!(json["template_target_size"]["w"], 1200);
    assert_eq!(json["template_target_size"]["h"], 1600);
    assert_eq!(json["homography"].as_array().map(Vec::len), Some(3));
    assert_eq!(json["homography_inliers_mask"].as_array().map(Vec::len), Some(8));
    assert!(json["matched_boxes"][0]["w"].as_i64().is_some());
    assert_eq!(json["template_boxes"][1]["id"], "b");
}

#[test]
fn single_box_scenario_maps_corner() {
    let cfg = RegistrationConfig {
        template_size: TemplateSize { width: 100, height: 100 },
        ..RegistrationConfig::default()
    };
    let estimator = HomographyEstimator::new(&cfg);
    let boxes = vec![TemplateBox::new("box_1", 10.0, 10.0, 20.0, 20.0)];
    let record = MatchRecord::from_slots(vec![Some(Rect::new(20.0, 20.0, 40.0, 40.0))]);

    let fit = estimator.estimate(&boxes, &record).unwrap();
    let p = fit.homography.apply(&Point2d::new(10.0, 10.0));
    assert_relative_eq!(p.x, 20.0, epsilon = 1e-3);
    assert_relative_eq!(p.y, 20.0, epsilon = 1e-3);

    assert!(estimator.estimate(&boxes, &MatchRecord::unmatched(1)).is_none());
}

#[test]
fn roi_scenario_full_frame_passes_small_centre_fails() {
    let aspect = Aspect::default();
    let outer = resolve_roi_rect(&RoiConfig::full_frame(), 600, 800, &aspect);
    let inner = resolve_roi_rect(&RoiConfig::percent(45.0, 45.0, 10.0, 10.0), 600, 800, &aspect);

    assert!(rect_within_roi(&Rect::new(0.0, 0.0, 600.0, 800.0), &inner, &outer, 0.0));
    assert!(!rect_within_roi(&Rect::new(285.0, 380.0, 30.0, 40.0), &inner, &outer, 0.0));
}
