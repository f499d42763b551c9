//! Background inference loop.
//!
//! The worker waits on the frame queue with a short timeout so that clearing
//! the running flag stops it within one poll interval. Classifier failures,
//! including panics, are reported as an empty detection set for that frame.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use ml_core::Classifier;
use tracing::{debug, error};
use video_ingest::Frame;

use crate::detection::{DetectionSet, LabelFilter};

/// How long the worker blocks on the frame queue before re-checking the running flag.
pub const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub struct DetectionWorker<C> {
    classifier: C,
    filter: LabelFilter,
}

impl<C: Classifier> DetectionWorker<C> {
    pub fn new(classifier: C, filter: LabelFilter) -> Self {
        Self { classifier, filter }
    }

    /// Classify one frame. Never fails: errors yield an empty set.
    pub fn process(&mut self, frame: &Frame) -> DetectionSet {
        let classifier = &mut self.classifier;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            classifier.detect(&frame.data, frame.width, frame.height)
        }));

        let raw = match outcome {
            Ok(Ok(raw)) => raw,
            Ok(Err(err)) => {
                error!("Detection error: {err}");
                metrics::counter!("guard_classifier_failures_total").increment(1);
                return DetectionSet::empty(frame.timestamp_ms);
            }
            Err(_) => {
                error!("Classifier panicked; treating frame as empty");
                metrics::counter!("guard_classifier_failures_total").increment(1);
                return DetectionSet::empty(frame.timestamp_ms);
            }
        };

        let detections = self.filter.apply(&self.classifier, raw);
        metrics::counter!("guard_detections_total").increment(detections.len() as u64);
        DetectionSet {
            frame_timestamp_ms: frame.timestamp_ms,
            detections,
        }
    }

    /// Worker loop. Returns when `running` clears or the frame queue disconnects.
    pub(crate) fn run(
        mut self,
        frames: Receiver<Frame>,
        results_tx: Sender<DetectionSet>,
        results_rx: Receiver<DetectionSet>,
        running: Arc<AtomicBool>,
    ) {
        while running.load(Ordering::Relaxed) {
            let frame = match frames.recv_timeout(WORKER_POLL_INTERVAL) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let set = self.process(&frame);
            if !set.is_empty() {
                debug!(
                    "frame ts={}: {} object(s) of interest",
                    set.frame_timestamp_ms,
                    set.len()
                );
            }
            publish_latest(&results_tx, &results_rx, set);
        }
        debug!("Detection worker stopped");
    }
}

/// Push `set` into the bounded result queue, evicting the oldest unread
/// result when full so the newest completed set is always available.
pub(crate) fn publish_latest(
    tx: &Sender<DetectionSet>,
    rx: &Receiver<DetectionSet>,
    mut set: DetectionSet,
) {
    loop {
        match tx.try_send(set) {
            Ok(()) => return,
            Err(TrySendError::Full(rejected)) => {
                let _ = rx.try_recv();
                set = rejected;
            }
            Err(TrySendError::Disconnected(_)) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use crossbeam_channel::bounded;
    use ml_core::{ClassifierError, LabelMap, RawDetection};
    use video_ingest::FrameFormat;

    use super::*;

    struct Scripted {
        labels: LabelMap,
        calls: usize,
    }

    impl Classifier for Scripted {
        fn detect(&mut self, _: &[u8], _: u32, _: u32) -> Result<Vec<RawDetection>, ClassifierError> {
            self.calls += 1;
            match self.calls {
                1 => Err(ClassifierError::Inference("cuda out of memory".into())),
                2 => panic!("model exploded"),
                _ => Ok(vec![RawDetection {
                    class_id: 2,
                    confidence: 0.8,
                    left: 1.0,
                    top: 2.0,
                    right: 3.0,
                    bottom: 4.0,
                }]),
            }
        }

        fn class_label(&self, class_id: u32) -> Option<&str> {
            self.labels.get(class_id)
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
    fn classifier_failures_yield_empty_sets_and_processing_continues() {
        let mut worker = DetectionWorker::new(
            Scripted {
                labels: LabelMap::coco(),
                calls: 0,
            },
            LabelFilter::default(),
        );

        assert!(worker.process(&frame(1)).is_empty());
        assert!(worker.process(&frame(2)).is_empty());
        let third = worker.process(&frame(3));
        assert_eq!(third.len(), 1);
        assert_eq!(third.detections[0].label, "car");
        assert_eq!(third.frame_timestamp_ms, 3);
    }

    #[test]
    fn publish_latest_evicts_oldest_when_full() {
        let (tx, rx) = bounded(2);
        for ts in 1..=5 {
            publish_latest(&tx, &rx, DetectionSet::empty(ts));
        }
        assert_eq!(rx.len(), 2);
        let remaining: Vec<_> = rx.try_iter().map(|s| s.frame_timestamp_ms).collect();
        assert_eq!(remaining, vec![4, 5]);
    }
}
