// Capsule protocol
// Exclusion compiler, classifier, content codec, integrity hasher, artifact
// assembly and the reconstruction engine

pub mod artifact;
pub mod assemble;
pub mod classify;
pub mod codec;
pub mod compare;
pub mod compression;
pub mod digest;
pub mod engine;
pub mod error;
pub mod exclude;
pub mod path_utils;
pub mod scan;
pub mod signal;

// Re-export commonly used types for convenience
pub use artifact::{Artifact, ArtifactHeader, FileRecord};
pub use assemble::{Assembler, PackOptions, PackSummary};
pub use classify::{Classification, Classifier, ClassifierPolicy};
pub use codec::{CodecOptions, EncodedPayload, PayloadEncoding};
pub use compare::DiffReport;
pub use digest::TreeDigest;
pub use engine::{ReconstructionEngine, RunMode, RunOptions, RunReport, RunState};
pub use error::CapsuleError;
pub use exclude::{ExclusionRule, ExclusionRules};
pub use scan::SourceEntry;
