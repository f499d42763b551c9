use std::path::PathBuf;

use thiserror::Error;

/// One object reported by a classifier, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub class_id: u32,
    pub confidence: f32,
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("failed to load model {path:?}: {reason}")]
    Load { path: PathBuf, reason: String },
    #[error("failed to read labels from {path:?}")]
    Labels {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("frame buffer has {actual} bytes, expected {expected}")]
    FrameSize { actual: usize, expected: usize },
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("classifier support not compiled in (enable the `with-tch` feature)")]
    Unavailable,
}

/// Object classifier consumed by the detection worker.
///
/// Implementations own their model state and are driven from a single worker
/// thread, so `detect` takes `&mut self`.
pub trait Classifier: Send {
    /// Run inference over a packed BGR8 image.
    fn detect(
        &mut self,
        image: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<RawDetection>, ClassifierError>;

    /// Human-readable label for a class identifier.
    fn class_label(&self, class_id: u32) -> Option<&str>;
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
    fn detect(
        &mut self,
        image: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<RawDetection>, ClassifierError> {
        (**self).detect(image, width, height)
    }

    fn class_label(&self, class_id: u32) -> Option<&str> {
        (**self).class_label(class_id)
    }
}

/// Settings needed to construct the production classifier.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub model_path: PathBuf,
    pub labels_path: Option<PathBuf>,
    pub confidence_threshold: f32,
    /// Model input size (width, height).
    pub input_size: (u32, u32),
}
