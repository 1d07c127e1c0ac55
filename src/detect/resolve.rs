//! Backend selection, resolved once at startup.
//!
//! `stub://` refs select the deterministic stub backends; anything else is a
//! model file path served by the tract backend when the `backend-tract`
//! feature is built in. No available backend is a fail-fast error: the
//! owning engine enters its terminal failure state and the rest of the
//! application continues.

use anyhow::{anyhow, Result};

use crate::detect::backend::{InferenceBackend, InferenceCapability};
use crate::detect::backends::{StubClassifierBackend, StubSsdBackend};

pub fn resolve_backend(
    model_path: &str,
    capability: InferenceCapability,
    input_height: u32,
    input_width: u32,
) -> Result<Box<dyn InferenceBackend>> {
    if model_path.starts_with("stub://") {
        let backend: Box<dyn InferenceBackend> = match capability {
            InferenceCapability::SsdDetection => Box::new(StubSsdBackend::new()),
            InferenceCapability::Classification => Box::new(StubClassifierBackend::new()),
            _ => {
                return Err(anyhow!(
                    "no stub backend serves capability {:?}",
                    capability
                ))
            }
        };
        log::info!("resolved backend '{}' for {}", backend.name(), model_path);
        return Ok(backend);
    }

    #[cfg(feature = "backend-tract")]
    {
        let backend =
            crate::detect::backends::TractBackend::load(model_path, input_height, input_width)?;
        use crate::detect::backend::InferenceBackend as _;
        if backend.supports(capability) {
            log::info!("resolved backend 'tract' for {}", model_path);
            return Ok(Box::new(backend));
        }
        return Err(anyhow!(
            "tract backend does not serve capability {:?}",
            capability
        ));
    }

    #[cfg(not(feature = "backend-tract"))]
    {
        let _ = (input_height, input_width);
        Err(anyhow!(
            "no inference backend available for {} (build with backend-tract, or use a stub:// ref)",
            model_path
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_refs_resolve_by_capability() {
        let detector =
            resolve_backend("stub://ssd", InferenceCapability::SsdDetection, 320, 320).unwrap();
        assert_eq!(detector.name(), "stub-ssd");
        assert_eq!(detector.input_shape(), (320, 320));

        let classifier =
            resolve_backend("stub://cls", InferenceCapability::Classification, 224, 224).unwrap();
        assert_eq!(classifier.name(), "stub-classifier");
    }

    #[cfg(not(feature = "backend-tract"))]
    #[test]
    fn missing_backend_is_fail_fast() {
        let result = resolve_backend(
            "models/ssd.onnx",
            InferenceCapability::SsdDetection,
            320,
            320,
        );
        assert!(result.is_err());
    }
}
