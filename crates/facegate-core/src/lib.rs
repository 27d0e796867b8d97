//! facegate-core: face embedding extraction, identity registry and match decisions.
//!
//! Uses SCRFD for face detection and ArcFace for face embeddings, both running
//! via ONNX Runtime for CPU inference. Everything here is synchronous; callers
//! decide where the blocking work runs.

pub mod detector;
pub mod extractor;
pub mod matcher;
pub mod recognizer;
pub mod registry;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use detector::{FaceDetector, ScrfdDetector};
pub use extractor::{EmbeddingExtractor, ExtractError};
pub use matcher::{decide, Decision, MatchConfig, Metric, Reason, Score};
pub use recognizer::{ArcFaceEmbedder, FaceEmbedder};
pub use registry::{IdentityStore, ReferenceImage, Registry, RegistryError};
pub use types::{BoundingBox, Embedding, IdentityRecord};
