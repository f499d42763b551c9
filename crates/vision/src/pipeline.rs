//! Real-time loop tying capture, detection, alerting and telemetry together.
//!
//! The loop never waits on the detection worker: frames are offered through
//! [`FramePipeline::submit`] and results are picked up whenever one is ready.
//! The sound actuator and the UDP socket are only touched from this thread.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use ml_core::Classifier;
use tracing::{error, info, warn};
use video_ingest::{CaptureError, Frame};

use crate::{
    DetectConfig,
    alert::{AlertController, PlayerSound, SilentSound, SoundActuator},
    detection::{DangerState, DetectionSet, LabelFilter},
    frames::{FramePipeline, SubmitOutcome},
    publisher::TelemetryPublisher,
};

/// Longest the loop waits for a frame before refreshing alert and telemetry state.
pub const CAPTURE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Bound on joining the detection worker at shutdown.
pub const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Output side of the loop: the alert actuator and the optional telemetry sink.
pub struct Outputs {
    pub alert: AlertController<Box<dyn SoundActuator>>,
    pub publisher: Option<TelemetryPublisher>,
}

/// Run the detection program described by `config` until `shutdown` is set.
///
/// A classifier that cannot be loaded or a capture failure is returned as an
/// error; missing sound or telemetry only disables that feature.
pub fn run(config: DetectConfig, shutdown: Arc<AtomicBool>) -> Result<()> {
    let pipeline_span = tracing::info_span!(
        "vision.pipeline",
        source = %config.source,
        width = config.width,
        height = config.height,
    );
    let _pipeline_guard = pipeline_span.enter();

    info!(
        "Loading detection model: {}",
        config.classifier.model_path.display()
    );
    let classifier = ml_core::load_classifier(&config.classifier)
        .context("Failed to load detection model")?;

    let outputs = build_outputs(&config);

    info!("Object detection: {}", config.classifier.model_path.display());
    info!("Sound alerts: {}", enabled(config.sound.is_some()));
    info!(
        "Emulator communication: {}",
        match outputs.publisher.as_ref() {
            Some(publisher) => format!("ENABLED ({})", publisher.target()),
            None => "DISABLED".to_string(),
        }
    );

    let frames = video_ingest::spawn_ffmpeg_reader(&config.source, (config.width, config.height))
        .context("Failed to start capture")?;

    run_with(frames, classifier, outputs, shutdown)
}

fn enabled(flag: bool) -> &'static str {
    if flag { "ENABLED" } else { "DISABLED" }
}

/// Build the sound actuator and telemetry publisher, degrading to no-ops on failure.
pub fn build_outputs(config: &DetectConfig) -> Outputs {
    let sound: Box<dyn SoundActuator> = match &config.sound {
        Some(options) => match PlayerSound::new(&options.path, options.volume) {
            Ok(sound) => {
                info!("Sound system initialized");
                Box::new(sound)
            }
            Err(err) => {
                warn!("Could not initialize sound system: {err}");
                Box::new(SilentSound)
            }
        },
        None => Box::new(SilentSound),
    };

    let publisher = config
        .emulator_addr
        .and_then(|addr| match TelemetryPublisher::new(addr) {
            Ok(publisher) => Some(publisher),
            Err(err) => {
                warn!("Could not initialize emulator communication: {err}");
                None
            }
        });

    Outputs {
        alert: AlertController::new(sound),
        publisher,
    }
}

/// Per-second frame counter for the cycle summary log.
struct CycleStats {
    frames: u32,
    dropped: u64,
    window_start: Instant,
}

impl CycleStats {
    fn new() -> Self {
        Self {
            frames: 0,
            dropped: 0,
            window_start: Instant::now(),
        }
    }

    /// Returns the frame rate once per elapsed second.
    fn tick(&mut self) -> Option<f64> {
        let elapsed = self.window_start.elapsed();
        if elapsed < Duration::from_secs(1) {
            return None;
        }
        let fps = f64::from(self.frames) / elapsed.as_secs_f64();
        self.frames = 0;
        self.window_start = Instant::now();
        Some(fps)
    }
}

/// Drive the loop over an already running frame source.
pub fn run_with<C>(
    frames: Receiver<Result<Frame, CaptureError>>,
    classifier: C,
    mut outputs: Outputs,
    shutdown: Arc<AtomicBool>,
) -> Result<()>
where
    C: Classifier + 'static,
{
    let mut pipeline = FramePipeline::start(classifier, LabelFilter::default())
        .context("Failed to spawn detection worker")?;
    info!("System running... press Ctrl+C to stop");

    let mut current = DetectionSet::default();
    let mut stats = CycleStats::new();

    let outcome = loop {
        if shutdown.load(Ordering::Relaxed) {
            break Ok(());
        }

        match frames.recv_timeout(CAPTURE_POLL_INTERVAL) {
            Ok(Ok(frame)) => {
                stats.frames += 1;
                metrics::counter!("guard_frames_submitted_total").increment(1);
                if pipeline.submit(frame) == SubmitOutcome::Dropped {
                    stats.dropped += 1;
                    metrics::counter!("guard_frames_dropped_total").increment(1);
                }
            }
            Ok(Err(err)) => {
                error!("Capture error: {err}");
                break Err(anyhow::Error::new(err).context("Capture failed"));
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                error!("Frame channel closed");
                break Err(anyhow!("capture channel closed"));
            }
        }

        if let Some(latest) = pipeline.take_latest_result() {
            current = latest;
        }

        let danger = DangerState::from_detections(&current);
        if let Some(publisher) = outputs.publisher.as_mut() {
            publisher.publish(danger);
        }
        outputs.alert.update(danger);
        metrics::gauge!("guard_danger_present").set(if danger.is_present() { 1.0 } else { 0.0 });

        if let Some(fps) = stats.tick() {
            metrics::gauge!("guard_pipeline_fps").set(fps);
            info!(
                "FPS: {:.0} | Objects: {} | Sound: {} | Dropped: {}",
                fps,
                current.len(),
                if outputs.alert.is_active() { "ON" } else { "OFF" },
                stats.dropped
            );
        }
    };

    info!("Stopping detection pipeline");
    pipeline.stop(WORKER_JOIN_TIMEOUT);
    outputs.alert.silence();
    if let Some(publisher) = outputs.publisher.as_mut() {
        publisher.publish(DangerState::Absent);
    }
    info!("System shutdown complete");

    outcome
}

#[cfg(test)]
mod tests {
    use std::{
        net::UdpSocket,
        sync::Mutex,
        thread,
    };

    use crossbeam_channel::bounded;
    use ml_core::{ClassifierError, LabelMap, RawDetection};
    use video_ingest::FrameFormat;

    use super::*;
    use crate::alert::SoundError;

    struct AlwaysPerson(LabelMap);

    impl Classifier for AlwaysPerson {
        fn detect(&mut self, _: &[u8], _: u32, _: u32) -> Result<Vec<RawDetection>, ClassifierError> {
            Ok(vec![RawDetection {
                class_id: 0,
                confidence: 0.9,
                left: 0.0,
                top: 0.0,
                right: 2.0,
                bottom: 2.0,
            }])
        }

        fn class_label(&self, class_id: u32) -> Option<&str> {
            self.0.get(class_id)
        }
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<&'static str>>>);

    impl SoundActuator for Recorder {
        fn start_loop(&mut self) -> Result<(), SoundError> {
            self.0.lock().unwrap().push("start");
            Ok(())
        }

        fn stop(&mut self) -> Result<(), SoundError> {
            self.0.lock().unwrap().push("stop");
            Ok(())
        }
    }

    fn frame(ts: i64) -> Frame {
        Frame {
            data: vec![0; 12],
            width: 2,
            height: 2,
            timestamp_ms: ts,
            format: FrameFormat::Bgr8,
        }
    }

    #[test]
    fn closed_capture_ends_loop_with_error_and_silences_alert() {
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let recorder = Recorder::default();
        let outputs = Outputs {
            alert: AlertController::new(Box::new(recorder.clone()) as Box<dyn SoundActuator>),
            publisher: Some(TelemetryPublisher::new(receiver.local_addr().unwrap()).unwrap()),
        };

        let (tx, rx) = bounded(2);
        let feeder = thread::spawn(move || {
            for ts in 0..10 {
                if tx.send(Ok(frame(ts))).is_err() {
                    break;
                }
                thread::sleep(Duration::from_millis(30));
            }
        });

        let shutdown = Arc::new(AtomicBool::new(false));
        let result = run_with(rx, AlwaysPerson(LabelMap::coco()), outputs, shutdown);
        feeder.join().unwrap();

        assert!(result.is_err());
        assert_eq!(*recorder.0.lock().unwrap(), vec!["start", "stop"]);

        let mut saw_present = false;
        let mut buf = [0u8; 64];
        while let Ok(len) = receiver.recv(&mut buf) {
            if &buf[..len] == br#"{"danger_level": 50}"# {
                saw_present = true;
            }
            if saw_present && &buf[..len] == br#"{"danger_level": 0}"# {
                break;
            }
        }
        assert!(saw_present);
    }

    #[test]
    fn shutdown_flag_stops_an_idle_loop() {
        let (_tx, rx) = bounded::<Result<Frame, CaptureError>>(2);
        let outputs = Outputs {
            alert: AlertController::new(Box::new(SilentSound) as Box<dyn SoundActuator>),
            publisher: None,
        };
        let shutdown = Arc::new(AtomicBool::new(false));
        let trigger = shutdown.clone();
        let stopper = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            trigger.store(true, Ordering::SeqCst);
        });

        let started = Instant::now();
        let result = run_with(rx, AlwaysPerson(LabelMap::coco()), outputs, shutdown);
        stopper.join().unwrap();

        assert!(result.is_ok());
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
