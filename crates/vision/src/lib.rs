//! Detection side of the proximity guard: frames go to a background
//! classifier, and the latest result drives a sound alert and UDP telemetry.
//!
//! - `detection`: detections, danger state and the label allow-list.
//! - `frames`: bounded frame/result hand-off around the worker thread.
//! - `worker`: the detection worker loop.
//! - `alert`: edge-triggered sound actuator control.
//! - `publisher`: telemetry wire format, publisher and listener.
//! - `pipeline`: the real-time loop.
//! - `config`: CLI configuration parsing.

pub mod alert;
pub mod config;
pub mod detection;
pub mod frames;
pub mod pipeline;
pub mod publisher;
pub mod worker;

pub use alert::{AlertAction, AlertController, PlayerSound, SilentSound, SoundActuator, SoundError};
pub use config::{DetectCliArgs, DetectConfig, ListenCliArgs, SoundOptions};
pub use detection::{DangerState, Detection, DetectionSet, LabelFilter};
pub use frames::{FramePipeline, QUEUE_CAPACITY, SubmitOutcome};
pub use pipeline::{Outputs, build_outputs, run, run_with};
pub use publisher::{TelemetryListener, TelemetryMessage, TelemetryPublisher};
pub use worker::DetectionWorker;
