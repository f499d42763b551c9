use std::{convert::TryFrom, path::Path};

use tch::{self, Device, Kind, Tensor};
use tracing::debug;

use crate::{
    classifier::{Classifier, ClassifierError, RawDetection},
    labels::LabelMap,
};

/// Upper bound on detections kept per frame.
const MAX_DETECTIONS: usize = 512;

/// TorchScript-backed detector.
///
/// The module takes a `[1, 3, H, W]` RGB float tensor in `0..1` and returns
/// `[1, N, 6]` rows of `(x1, y1, x2, y2, confidence, class)` in input pixels.
pub struct TorchClassifier {
    module: tch::CModule,
    device: Device,
    input_size: (i64, i64),
    confidence_threshold: f32,
    labels: LabelMap,
}

impl TorchClassifier {
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        input_size: (u32, u32),
        labels: LabelMap,
    ) -> Result<Self, ClassifierError> {
        let device = Device::cuda_if_available();
        let path = model_path.as_ref();
        let module =
            tch::CModule::load_on_device(path, device).map_err(|err| ClassifierError::Load {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        debug!("Loaded {} on {:?}", path.display(), device);
        Ok(Self {
            module,
            device,
            input_size: (input_size.0 as i64, input_size.1 as i64),
            confidence_threshold: 0.5,
            labels,
        })
    }

    /// Override the confidence threshold used for filtering detections.
    pub fn with_confidence_threshold(mut self, confidence: f32) -> Self {
        self.confidence_threshold = confidence;
        self
    }

    fn bgr_to_tensor(&self, bgr: &[u8], width: u32, height: u32) -> Result<Tensor, ClassifierError> {
        let expected = (width as usize) * (height as usize) * 3;
        if bgr.len() != expected {
            return Err(ClassifierError::FrameSize {
                actual: bgr.len(),
                expected,
            });
        }

        let (in_w, in_h) = self.input_size;
        let tensor = Tensor::from_slice(bgr)
            .to_device(self.device)
            .view([height as i64, width as i64, 3])
            .flip([2])
            .permute([2, 0, 1])
            .unsqueeze(0)
            .to_kind(Kind::Float)
            / 255.0;

        if (width as i64, height as i64) == (in_w, in_h) {
            Ok(tensor)
        } else {
            Ok(tensor.upsample_bilinear2d([in_h, in_w], false, None::<f64>, None::<f64>))
        }
    }
}

impl Classifier for TorchClassifier {
    fn detect(
        &mut self,
        image: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<RawDetection>, ClassifierError> {
        let input = self.bgr_to_tensor(image, width, height)?;
        let output = self
            .module
            .forward_ts(&[input])
            .map_err(|err| ClassifierError::Inference(err.to_string()))?;
        let shape = output.size();
        if shape.len() != 3 || shape[0] != 1 || shape[2] < 6 {
            return Err(ClassifierError::Inference(format!(
                "unexpected detector output shape: {shape:?}"
            )));
        }

        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(
            &output.to_device(Device::Cpu).squeeze_dim(0).contiguous(),
        )
        .map_err(|err| ClassifierError::Inference(err.to_string()))?;

        let (in_w, in_h) = self.input_size;
        let scale_x = width as f32 / in_w as f32;
        let scale_y = height as f32 / in_h as f32;

        let mut detections = Vec::new();
        for row in rows {
            let confidence = row[4];
            if confidence < self.confidence_threshold {
                continue;
            }
            detections.push(RawDetection {
                class_id: row[5].max(0.0) as u32,
                confidence,
                left: row[0] * scale_x,
                top: row[1] * scale_y,
                right: row[2] * scale_x,
                bottom: row[3] * scale_y,
            });
            if detections.len() >= MAX_DETECTIONS {
                break;
            }
        }

        Ok(detections)
    }

    fn class_label(&self, class_id: u32) -> Option<&str> {
        self.labels.get(class_id)
    }
}
