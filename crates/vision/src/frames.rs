//! Bounded hand-off between the capture loop and the detection worker.

use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use ml_core::Classifier;
use tracing::{debug, warn};
use video_ingest::Frame;

use crate::{
    detection::{DetectionSet, LabelFilter},
    worker::DetectionWorker,
};

/// Capacity of both the frame queue and the result queue.
pub const QUEUE_CAPACITY: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Queued,
    /// Queue full (or worker gone); the frame was discarded.
    Dropped,
}

/// Owns the detection worker thread and both queues around it.
pub struct FramePipeline {
    frame_tx: Sender<Frame>,
    result_rx: Receiver<DetectionSet>,
    running: Arc<AtomicBool>,
    worker: Option<thread::JoinHandle<()>>,
    exited_rx: Receiver<()>,
}

impl FramePipeline {
    /// Spawn the detection worker around `classifier`.
    pub fn start<C>(classifier: C, filter: LabelFilter) -> io::Result<Self>
    where
        C: Classifier + 'static,
    {
        let (frame_tx, frame_rx) = bounded::<Frame>(QUEUE_CAPACITY);
        let (result_tx, result_rx) = bounded::<DetectionSet>(QUEUE_CAPACITY);
        let (exited_tx, exited_rx) = bounded::<()>(1);
        let running = Arc::new(AtomicBool::new(true));

        let worker = DetectionWorker::new(classifier, filter);
        let worker_running = running.clone();
        let worker_results_rx = result_rx.clone();
        let handle = thread::Builder::new()
            .name("detection-worker".into())
            .spawn(move || {
                // Dropped when the closure returns, signalling `stop`.
                let _exited = exited_tx;
                worker.run(frame_rx, result_tx, worker_results_rx, worker_running);
            })?;

        Ok(Self {
            frame_tx,
            result_rx,
            running,
            worker: Some(handle),
            exited_rx,
        })
    }

    /// Hand a frame to the worker without blocking.
    pub fn submit(&self, frame: Frame) -> SubmitOutcome {
        match self.frame_tx.try_send(frame) {
            Ok(()) => SubmitOutcome::Queued,
            Err(TrySendError::Full(_)) => SubmitOutcome::Dropped,
            Err(TrySendError::Disconnected(_)) => {
                debug!("Detection worker is not accepting frames");
                SubmitOutcome::Dropped
            }
        }
    }

    /// Most recent detection set completed since the last call, if any.
    pub fn take_latest_result(&self) -> Option<DetectionSet> {
        self.result_rx.try_iter().last()
    }

    pub fn queued_frames(&self) -> usize {
        self.frame_tx.len()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Stop the worker and wait up to `timeout` for it to exit.
    ///
    /// Returns `false` if the worker did not finish in time; its thread is
    /// then detached. Safe to call more than once.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.worker.take() else {
            return true;
        };
        self.running.store(false, Ordering::SeqCst);

        match self.exited_rx.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Detection worker did not stop within {} ms; detaching",
                    timeout.as_millis()
                );
                false
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if handle.join().is_err() {
                    warn!("Detection worker panicked during shutdown");
                }
                true
            }
        }
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        self.stop(Duration::from_secs(1));
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::AtomicUsize,
        time::Instant,
    };

    use ml_core::{ClassifierError, LabelMap, RawDetection};
    use video_ingest::FrameFormat;

    use super::*;
    use crate::worker::WORKER_POLL_INTERVAL;

    /// Reports one `person` per frame; blocks on `gate` when one is set.
    struct FakeClassifier {
        labels: LabelMap,
        gate: Option<Receiver<()>>,
        processed: Arc<AtomicUsize>,
    }

    impl Classifier for FakeClassifier {
        fn detect(&mut self, _: &[u8], _: u32, _: u32) -> Result<Vec<RawDetection>, ClassifierError> {
            if let Some(gate) = &self.gate {
                let _ = gate.recv_timeout(Duration::from_secs(5));
            }
            self.processed.fetch_add(1, Ordering::SeqCst);
            Ok(vec![RawDetection {
                class_id: 0,
                confidence: 0.9,
                left: 0.0,
                top: 0.0,
                right: 4.0,
                bottom: 4.0,
            }])
        }

        fn class_label(&self, class_id: u32) -> Option<&str> {
            self.labels.get(class_id)
        }
    }

    fn frame(ts: i64) -> Frame {
        Frame {
            data: vec![0; 48],
            width: 4,
            height: 4,
            timestamp_ms: ts,
            format: FrameFormat::Bgr8,
        }
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn submit_never_blocks_and_queue_stays_bounded() {
        let (gate_tx, gate_rx) = bounded::<()>(0);
        let processed = Arc::new(AtomicUsize::new(0));
        let mut pipeline = FramePipeline::start(
            FakeClassifier {
                labels: LabelMap::coco(),
                gate: Some(gate_rx),
                processed: processed.clone(),
            },
            LabelFilter::default(),
        )
        .unwrap();

        let started = Instant::now();
        let mut dropped = 0;
        for ts in 0..20 {
            if pipeline.submit(frame(ts)) == SubmitOutcome::Dropped {
                dropped += 1;
            }
            assert!(pipeline.queued_frames() <= QUEUE_CAPACITY);
        }
        assert!(started.elapsed() < Duration::from_millis(500));
        // At most one frame in the worker plus a full queue.
        assert!(dropped >= 20 - (QUEUE_CAPACITY + 1));

        drop(gate_tx);
        assert!(pipeline.stop(Duration::from_secs(6)));
    }

    #[test]
    fn latest_result_wins_over_older_unread_results() {
        let processed = Arc::new(AtomicUsize::new(0));
        let mut pipeline = FramePipeline::start(
            FakeClassifier {
                labels: LabelMap::coco(),
                gate: None,
                processed: processed.clone(),
            },
            LabelFilter::default(),
        )
        .unwrap();

        for ts in 1..=5 {
            assert_eq!(pipeline.submit(frame(ts)), SubmitOutcome::Queued);
            let expected = ts as usize;
            assert!(wait_until(Duration::from_secs(2), || {
                processed.load(Ordering::SeqCst) >= expected
            }));
        }
        // Let the final publish land after the classifier returns.
        thread::sleep(Duration::from_millis(50));

        let latest = pipeline.take_latest_result().expect("a result");
        assert_eq!(latest.frame_timestamp_ms, 5);
        assert_eq!(latest.len(), 1);
        assert!(pipeline.take_latest_result().is_none());
        assert!(pipeline.stop(Duration::from_secs(1)));
    }

    #[test]
    fn stop_finishes_within_a_poll_interval_and_is_idempotent() {
        let mut pipeline = FramePipeline::start(
            FakeClassifier {
                labels: LabelMap::coco(),
                gate: None,
                processed: Arc::new(AtomicUsize::new(0)),
            },
            LabelFilter::default(),
        )
        .unwrap();

        let started = Instant::now();
        assert!(pipeline.stop(WORKER_POLL_INTERVAL * 5));
        assert!(started.elapsed() < WORKER_POLL_INTERVAL * 3);
        assert!(!pipeline.is_running());
        assert!(pipeline.stop(Duration::from_millis(1)));
        assert_eq!(pipeline.submit(frame(1)), SubmitOutcome::Dropped);
    }
}
