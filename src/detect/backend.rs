use anyhow::{anyhow, Result};

/// Capabilities an inference backend can serve.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InferenceCapability {
    /// SSD-style detector: per-anchor boxes plus per-anchor class scores.
    SsdDetection,
    /// Single probability-vector classifier.
    Classification,
}

/// A dense f32 tensor with explicit shape. The model-serving contract moves
/// these in and out; nothing in the core depends on a concrete runtime type.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(anyhow!(
                "tensor shape {:?} expects {} values, got {}",
                shape,
                expected,
                data.len()
            ));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Size of the innermost dimension.
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(0)
    }

    /// Number of rows when viewed as `[..., rows, last_dim]`; leading
    /// batch dimensions collapse.
    pub fn rows(&self) -> usize {
        let inner = self.last_dim();
        if inner == 0 {
            0
        } else {
            self.data.len() / inner
        }
    }

    /// Row `i` as a slice of `last_dim` values.
    pub fn row(&self, i: usize) -> &[f32] {
        let inner = self.last_dim();
        &self.data[i * inner..(i + 1) * inner]
    }
}

/// Abstract "run inference" contract. The core depends on this; a
/// model-serving library implements it.
///
/// A backend is loaded once at startup. `invoke` receives a preprocessed
/// NHWC `[1, height, width, 3]` tensor and returns the model's output
/// tensors in model order.
pub trait InferenceBackend: Send {
    /// Backend identifier for logs.
    fn name(&self) -> &'static str;

    /// Returns true when the backend serves a capability.
    fn supports(&self, capability: InferenceCapability) -> bool;

    /// Model input dimensions as (height, width).
    fn input_shape(&self) -> (u32, u32);

    /// Run one forward pass. In-flight invocations are not cancellable and
    /// are assumed to complete quickly relative to the polling interval.
    fn invoke(&mut self, input: &Tensor) -> Result<Vec<Tensor>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_rejects_shape_mismatch() {
        assert!(Tensor::new(vec![2, 3], vec![0.0; 5]).is_err());
        assert!(Tensor::new(vec![2, 3], vec![0.0; 6]).is_ok());
    }

    #[test]
    fn rows_collapse_batch_dimension() {
        let t = Tensor::new(vec![1, 4, 3], (0..12).map(|v| v as f32).collect()).unwrap();
        assert_eq!(t.rows(), 4);
        assert_eq!(t.last_dim(), 3);
        assert_eq!(t.row(1), &[3.0, 4.0, 5.0]);
    }
}
