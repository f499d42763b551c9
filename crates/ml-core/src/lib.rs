//! Classifier interface used by the detection worker, plus the TorchScript
//! implementation. Enable the `with-tch` feature to pull in the `tch` crate.

pub mod classifier;
#[cfg(feature = "with-tch")]
pub mod detector;
pub mod labels;

pub use classifier::{Classifier, ClassifierConfig, ClassifierError, RawDetection};
pub use labels::LabelMap;

/// Construct the production classifier described by `config`.
#[cfg(feature = "with-tch")]
pub fn load_classifier(config: &ClassifierConfig) -> Result<Box<dyn Classifier>, ClassifierError> {
    let labels = match &config.labels_path {
        Some(path) => LabelMap::from_file(path)?,
        None => LabelMap::coco(),
    };
    let detector = detector::TorchClassifier::new(&config.model_path, config.input_size, labels)?
        .with_confidence_threshold(config.confidence_threshold);
    Ok(Box::new(detector))
}

/// Construct the production classifier described by `config`.
#[cfg(not(feature = "with-tch"))]
pub fn load_classifier(config: &ClassifierConfig) -> Result<Box<dyn Classifier>, ClassifierError> {
    tracing::error!(
        "Cannot load {}: classifier support not compiled in",
        config.model_path.display()
    );
    Err(ClassifierError::Unavailable)
}

#[cfg(feature = "with-tch")]
pub use tch;
