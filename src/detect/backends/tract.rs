#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::{InferenceBackend, InferenceCapability, Tensor as IoTensor};

/// Tract-based backend for ONNX models.
///
/// Loads a local model file once and serves forward passes on NHWC float
/// input. Serves both the SSD detector and dedicated classifiers; which
/// tensors come back is the model's business, the engine interprets them.
pub struct TractBackend {
    model: TypedRunnableModel<TypedModel>,
    height: u32,
    width: u32,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference with the
    /// given input dimensions.
    pub fn load<P: AsRef<Path>>(model_path: P, height: u32, width: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, height as usize, width as usize, 3),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            height,
            width,
        })
    }
}

impl InferenceBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn supports(&self, capability: InferenceCapability) -> bool {
        matches!(
            capability,
            InferenceCapability::SsdDetection | InferenceCapability::Classification
        )
    }

    fn input_shape(&self) -> (u32, u32) {
        (self.height, self.width)
    }

    fn invoke(&mut self, input: &IoTensor) -> Result<Vec<IoTensor>> {
        let expected = [1, self.height as usize, self.width as usize, 3];
        if input.shape() != expected {
            return Err(anyhow!(
                "input shape {:?} does not match model input {:?}",
                input.shape(),
                expected
            ));
        }

        let array = tract_ndarray::Array4::from_shape_vec(
            (1, self.height as usize, self.width as usize, 3),
            input.data().to_vec(),
        )
        .context("build input array")?;

        let outputs = self
            .model
            .run(tvec!(array.into_tensor().into()))
            .context("ONNX inference failed")?;

        let mut out = Vec::with_capacity(outputs.len());
        for output in outputs.iter() {
            let view = output
                .to_array_view::<f32>()
                .context("model output tensor was not f32")?;
            let shape = view.shape().to_vec();
            let data = view.iter().copied().collect::<Vec<f32>>();
            out.push(IoTensor::new(shape, data)?);
        }
        Ok(out)
    }
}
