use clap::{Parser, ValueEnum};
use env_logger::Env;
use log::{info, warn};
use screenreg::{
    default_template_boxes, load_template, rectified_with_template, FrameRotation, ImageSequenceSource,
    MatchStrategy, PipelineVariant, RegistrationConfig, RegistrationError, RegistrationOutcome,
    RegistrationResult, ScreenRegistrar, SessionEvent,
};
use serde::Serialize;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "screenreg-rs")]
#[command(about = "Locate a screen in camera frames and register a box template onto it", long_about = None)]
struct Cli {
    /// Directory of frames, read in file name order
    #[arg(long)]
    frames: PathBuf,

    /// Template JSON (list of percentage boxes); built-in layout when omitted
    #[arg(long)]
    template: Option<PathBuf>,

    /// Configuration JSON
    #[arg(long)]
    config: Option<PathBuf>,

    /// Rotation applied to every frame
    #[arg(long, value_enum)]
    rotation: Option<Rotation>,

    /// Evaluation pipeline
    #[arg(long, value_enum)]
    variant: Option<Variant>,

    /// Box assignment strategy
    #[arg(long, value_enum)]
    strategy: Option<Strategy>,

    /// Acceptance threshold on box accuracy
    #[arg(long)]
    threshold: Option<f64>,

    /// Frames consumed per read, only the newest is evaluated (1 evaluates every image)
    #[arg(long, default_value_t = 1)]
    drain: usize,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    /// Write the rectified view of the accepted frame (PNG)
    #[arg(long)]
    warped_out: Option<PathBuf>,

    /// Write the annotated accepted frame (PNG)
    #[arg(long)]
    annotated_out: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Rotation {
    None,
    #[value(name = "90cw")]
    Cw90,
    #[value(name = "90ccw")]
    Ccw90,
    #[value(name = "180")]
    Rotate180,
}

impl From<Rotation> for FrameRotation {
    fn from(r: Rotation) -> Self {
        match r {
            Rotation::None => FrameRotation::None,
            Rotation::Cw90 => FrameRotation::Cw90,
            Rotation::Ccw90 => FrameRotation::Ccw90,
            Rotation::Rotate180 => FrameRotation::Rotate180,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Variant {
    AssumedScreen,
    RoiHomography,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Strategy {
    Greedy,
    Optimal,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum OutputFormat {
    /// One JSON event per line
    Json,
    /// Human readable lines
    Text,
}

/// Lines written to stdout.
#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Event<'a> {
    Start {
        frames_dir: String,
        frames: usize,
        template_boxes: usize,
        variant: PipelineVariant,
        accuracy_threshold: f64,
    },
    Progress {
        frame: usize,
        matched: usize,
        total: usize,
        accuracy: f64,
    },
    Warning {
        message: &'a str,
    },
    #[serde(rename = "result")]
    Registered(&'a RegistrationResult),
    Error {
        message: String,
        code: u8,
    },
    End {
        frames: usize,
        status: &'static str,
    },
}

struct Printer {
    format: OutputFormat,
}

impl Printer {
    fn emit(&self, event: &Event<'_>) {
        match self.format {
            OutputFormat::Json => match serde_json::to_string(event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("cannot serialize event: {e}"),
            },
            OutputFormat::Text => println!("{}", describe(event)),
        }
    }
}

fn describe(event: &Event<'_>) -> String {
    match event {
        Event::Start {
            frames_dir,
            frames,
            template_boxes,
            variant,
            accuracy_threshold,
        } => format!(
            "start: {frames} frames in {frames_dir}, {template_boxes} template boxes, {variant:?}, threshold {accuracy_threshold}"
        ),
        Event::Progress {
            frame,
            matched,
            total,
            accuracy,
        } => format!("frame {frame}: matched {matched}/{total} (accuracy {accuracy:.4})"),
        Event::Warning { message } => format!("warning: {message}"),
        Event::Registered(result) => {
            let mut text = format!(
                "accepted frame {} with accuracy {:.4} (threshold {})",
                result.frame, result.accuracy, result.accuracy_threshold
            );
            if let Some(h) = &result.homography {
                for row in h {
                    text.push_str(&format!("\n  [{:12.6} {:12.6} {:12.6}]", row[0], row[1], row[2]));
                }
            }
            text
        }
        Event::Error { message, code } => format!("error ({code}): {message}"),
        Event::End { frames, status } => format!("end: {status} after {frames} frames"),
    }
}

/// Four decimals, ties to even.
fn round4(v: f64) -> f64 {
    (v * 1e4).round_ties_even() / 1e4
}

fn build_config(cli: &Cli) -> Result<RegistrationConfig, RegistrationError> {
    let mut config = match &cli.config {
        Some(path) => RegistrationConfig::from_json_file(path)?,
        None => RegistrationConfig::default(),
    };
    if let Some(variant) = cli.variant {
        config.variant = match variant {
            Variant::AssumedScreen => PipelineVariant::AssumedScreen,
            Variant::RoiHomography => PipelineVariant::RoiHomography,
        };
    }
    if let Some(strategy) = cli.strategy {
        config.match_strategy = match strategy {
            Strategy::Greedy => MatchStrategy::Greedy,
            Strategy::Optimal => MatchStrategy::Optimal,
        };
    }
    if let Some(rotation) = cli.rotation {
        config.frame_rotation = rotation.into();
    }
    if let Some(threshold) = cli.threshold {
        config.box_accuracy_threshold = threshold;
    }
    config.drain_frames = cli.drain;
    config.validate()?;
    Ok(config)
}

fn write_outputs(cli: &Cli, registrar: &ScreenRegistrar, outcome: &RegistrationOutcome) -> Result<(), RegistrationError> {
    if let Some(path) = &cli.annotated_out {
        outcome.evaluation.annotated_frame.save(path)?;
        info!("annotated frame written to {}", path.display());
    }
    if let (Some(path), Some(capture), Some(h)) = (
        &cli.warped_out,
        &outcome.evaluation.capture_frame,
        &outcome.evaluation.homography,
    ) {
        let warped = rectified_with_template(capture, h, registrar.boxes(), &registrar.config().template_size)?;
        warped.save(path)?;
        info!("rectified view written to {}", path.display());
    }
    Ok(())
}

fn run(cli: &Cli, printer: &Printer) -> Result<usize, RegistrationError> {
    let config = build_config(cli)?;
    let boxes = match &cli.template {
        Some(path) => load_template(path)?,
        None => {
            info!("no template given, using the built-in layout");
            default_template_boxes()
        }
    };

    let source = ImageSequenceSource::open(&cli.frames)?;
    let registrar = ScreenRegistrar::new(config, boxes)?;

    printer.emit(&Event::Start {
        frames_dir: cli.frames.display().to_string(),
        frames: source.len(),
        template_boxes: registrar.boxes().len(),
        variant: registrar.config().variant,
        accuracy_threshold: registrar.config().box_accuracy_threshold,
    });

    let outcome = registrar.run_source(source, |event| {
        match event {
            SessionEvent::Progress {
                frame,
                matched,
                total,
                accuracy,
            } => printer.emit(&Event::Progress {
                frame,
                matched,
                total,
                accuracy: round4(accuracy),
            }),
            SessionEvent::ReadFailure { message, .. } => printer.emit(&Event::Warning { message }),
            SessionEvent::Frame { .. } => {}
        }
        ControlFlow::Continue(())
    })?;

    printer.emit(&Event::Registered(&outcome.result));
    write_outputs(cli, &registrar, &outcome)?;
    Ok(outcome.result.frame)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

    let printer = Printer { format: cli.format };
    match run(&cli, &printer) {
        Ok(frames) => {
            printer.emit(&Event::End { frames, status: "accepted" });
            ExitCode::SUCCESS
        }
        Err(err) => {
            let code = err.exit_code();
            printer.emit(&Event::Error {
                message: err.to_string(),
                code,
            });
            let frames = match err {
                RegistrationError::StreamExhausted { frames } | RegistrationError::Stopped { frames } => frames,
                _ => 0,
            };
            printer.emit(&Event::End { frames, status: "failed" });
            ExitCode::from(code)
        }
    }
}
