//! Shared protocol types for CardMint.
//!
//! Canonical definitions used across the watcher, worker pool, resolver and
//! control plane: identifiers, the scan-job status machine, extracted card
//! fields, the error taxonomy, configuration, fingerprinting and signing.

pub mod config;
pub mod defaults;
pub mod error;
pub mod fields;
pub mod fingerprint;
pub mod ids;
pub mod metrics;
pub mod signing;
pub mod status;
pub mod timings;

pub use config::{Config, ConfigHandle};
pub use error::{ErrorCode, StageError};
pub use fields::{
    Candidate, CandidateSource, ExtractedFields, HoloType, Rarity, ResolverDecision, TruthCore,
    VariantHint,
};
pub use ids::{EventId, JobId, ProcessorId, SessionId};
pub use status::JobStatus;
pub use timings::{InferencePath, PathCAction, PathCTelemetry, StageTimings};
