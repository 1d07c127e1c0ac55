//! Concrete inference backends.

pub mod stub;
#[cfg(feature = "backend-tract")]
pub mod tract;

pub use stub::{StubClassifierBackend, StubSsdBackend};
#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;
