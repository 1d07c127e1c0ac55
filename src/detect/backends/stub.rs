//! Stub inference backends for `stub://` model refs.
//!
//! Deterministic tensors shaped like the real quantized SSD's outputs, so
//! the whole pipeline (decode, filters, NMS, measurement, persistence) runs
//! and tests without a model file or inference runtime.

use anyhow::Result;

use crate::detect::backend::{InferenceBackend, InferenceCapability, Tensor};
use crate::detect::{CLASSIFIER_INPUT_SIZE, DETECTOR_INPUT_SIZE};

const STUB_ANCHORS: usize = 16;
const STUB_CLASSES: usize = 4;

/// Stub SSD detector. Emits a fixed anchor set exercising every decode
/// filter: one strong road-damage box, one weaker overlapping box, one
/// high-confidence box in the sky band, and one noise-sized box.
pub struct StubSsdBackend {
    input_size: u32,
}

impl StubSsdBackend {
    pub fn new() -> Self {
        Self {
            input_size: DETECTOR_INPUT_SIZE,
        }
    }
}

impl Default for StubSsdBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for StubSsdBackend {
    fn name(&self) -> &'static str {
        "stub-ssd"
    }

    fn supports(&self, capability: InferenceCapability) -> bool {
        matches!(capability, InferenceCapability::SsdDetection)
    }

    fn input_shape(&self) -> (u32, u32) {
        (self.input_size, self.input_size)
    }

    fn invoke(&mut self, _input: &Tensor) -> Result<Vec<Tensor>> {
        // (cy, cx, h, w) per anchor, normalized.
        let mut boxes = vec![[0.5f32, 0.5, 0.0, 0.0]; STUB_ANCHORS];
        let mut scores = vec![[0.05f32; STUB_CLASSES]; STUB_ANCHORS];

        // Anchor 0: strong pothole low in the image.
        boxes[0] = [0.65, 0.5, 0.3, 0.35];
        scores[0][2] = 0.9;

        // Anchor 1: weaker box overlapping anchor 0; NMS fodder.
        boxes[1] = [0.66, 0.52, 0.3, 0.35];
        scores[1][2] = 0.6;

        // Anchor 2: confident but in the top fifth; positional filter fodder.
        boxes[2] = [0.1, 0.5, 0.3, 0.4];
        scores[2][0] = 0.95;

        // Anchor 3: confident but noise-sized; area filter fodder.
        boxes[3] = [0.7, 0.3, 0.05, 0.05];
        scores[3][3] = 0.9;

        let box_data: Vec<f32> = boxes.iter().flatten().copied().collect();
        let score_data: Vec<f32> = scores.iter().flatten().copied().collect();
        Ok(vec![
            Tensor::new(vec![1, STUB_ANCHORS, 4], box_data)?,
            Tensor::new(vec![1, STUB_ANCHORS, STUB_CLASSES], score_data)?,
        ])
    }
}

/// Stub dedicated classifier. Emits a fixed probability vector with a
/// confident `berlubang` (index 2).
pub struct StubClassifierBackend {
    input_size: u32,
}

impl StubClassifierBackend {
    pub fn new() -> Self {
        Self {
            input_size: CLASSIFIER_INPUT_SIZE,
        }
    }
}

impl Default for StubClassifierBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InferenceBackend for StubClassifierBackend {
    fn name(&self) -> &'static str {
        "stub-classifier"
    }

    fn supports(&self, capability: InferenceCapability) -> bool {
        matches!(capability, InferenceCapability::Classification)
    }

    fn input_shape(&self) -> (u32, u32) {
        (self.input_size, self.input_size)
    }

    fn invoke(&mut self, _input: &Tensor) -> Result<Vec<Tensor>> {
        Ok(vec![Tensor::new(
            vec![1, STUB_CLASSES],
            vec![0.05, 0.1, 0.7, 0.15],
        )?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssd_stub_outputs_are_well_shaped() {
        let mut backend = StubSsdBackend::new();
        let input = Tensor::new(vec![1, 320, 320, 3], vec![0.0; 320 * 320 * 3]).unwrap();
        let outputs = backend.invoke(&input).unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].rows(), STUB_ANCHORS);
        assert_eq!(outputs[0].last_dim(), 4);
        assert_eq!(outputs[1].last_dim(), STUB_CLASSES);
    }

    #[test]
    fn classifier_stub_emits_probability_vector() {
        let mut backend = StubClassifierBackend::new();
        let input = Tensor::new(vec![1, 224, 224, 3], vec![0.0; 224 * 224 * 3]).unwrap();
        let outputs = backend.invoke(&input).unwrap();
        assert_eq!(outputs.len(), 1);
        let sum: f32 = outputs[0].data().iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }
}
