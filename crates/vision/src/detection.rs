use ml_core::{Classifier, RawDetection};
use serde::Serialize;

/// Labels that count as hazards when the classifier reports them.
pub const DEFAULT_ALLOWED_LABELS: [&str; 6] =
    ["person", "bicycle", "car", "motorcycle", "bus", "truck"];

/// `danger_level` sent while objects are present.
pub const DANGER_LEVEL_PRESENT: i32 = 50;
/// `danger_level` sent while nothing is detected.
pub const DANGER_LEVEL_ABSENT: i32 = 0;

/// One classified object of interest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    /// `(x1, y1, x2, y2)` in frame pixels.
    pub bbox: [i32; 4],
    pub label: String,
    pub confidence: f32,
}

/// Detections for a single frame. Empty means "no objects".
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionSet {
    pub frame_timestamp_ms: i64,
    pub detections: Vec<Detection>,
}

impl DetectionSet {
    pub fn empty(frame_timestamp_ms: i64) -> Self {
        Self {
            frame_timestamp_ms,
            detections: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DangerState {
    Present,
    Absent,
}

impl DangerState {
    pub fn from_detections(set: &DetectionSet) -> Self {
        if set.is_empty() {
            DangerState::Absent
        } else {
            DangerState::Present
        }
    }

    /// Wire value for telemetry. Only two levels exist.
    pub fn danger_level(self) -> i32 {
        match self {
            DangerState::Present => DANGER_LEVEL_PRESENT,
            DangerState::Absent => DANGER_LEVEL_ABSENT,
        }
    }

    pub fn is_present(self) -> bool {
        matches!(self, DangerState::Present)
    }
}

/// Case-insensitive allow-list over classifier labels.
#[derive(Debug, Clone)]
pub struct LabelFilter {
    allowed: Vec<String>,
}

impl LabelFilter {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: labels
                .into_iter()
                .map(|label| label.as_ref().to_lowercase())
                .collect(),
        }
    }

    pub fn allows(&self, label: &str) -> bool {
        let label = label.to_lowercase();
        self.allowed.iter().any(|allowed| *allowed == label)
    }

    /// Resolve labels through `classifier` and keep only allowed objects.
    pub fn apply<C: Classifier + ?Sized>(
        &self,
        classifier: &C,
        raw: Vec<RawDetection>,
    ) -> Vec<Detection> {
        raw.into_iter()
            .filter_map(|det| {
                let label = classifier.class_label(det.class_id)?;
                if !self.allows(label) {
                    return None;
                }
                Some(Detection {
                    bbox: [
                        det.left as i32,
                        det.top as i32,
                        det.right as i32,
                        det.bottom as i32,
                    ],
                    label: label.to_string(),
                    confidence: det.confidence,
                })
            })
            .collect()
    }
}

impl Default for LabelFilter {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_LABELS)
    }
}
