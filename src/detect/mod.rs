mod backend;
mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
pub use registry::{BackendRegistry, SharedDetector};
pub use result::{BoundingBox, Detection};

#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
