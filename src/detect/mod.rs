//! Detection stage: the abstract inference contract, concrete backends, the
//! detection engine (decode, filter, NMS), and the advisory classification
//! engine.

pub mod backend;
pub mod backends;
pub mod classify;
pub mod engine;
pub mod resolve;
pub mod result;

pub use backend::{InferenceBackend, InferenceCapability, Tensor};
pub use resolve::resolve_backend;

/// Default detector model input edge, in pixels.
pub const DETECTOR_INPUT_SIZE: u32 = 320;
/// Default dedicated-classifier model input edge, in pixels.
pub const CLASSIFIER_INPUT_SIZE: u32 = 224;
