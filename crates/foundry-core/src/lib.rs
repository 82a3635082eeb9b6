//! Shared foundations for the Foundry build orchestration engine.
//!
//! This crate provides the types every Foundry crate depends on: the unified
//! error taxonomy, engine configuration and per-build guardrails, and the
//! traits through which the engine talks to its external collaborators
//! (provider routing, persistence, readiness validation).
//!
//! # Main types
//!
//! - [`EngineError`] — Unified error enum for the build engine.
//! - [`EngineResult`] — Convenience alias for `Result<T, EngineError>`.
//! - [`EngineConfig`] — Tunable engine parameters with TOML loading.
//! - [`BuildLimits`] — Per-build guardrail counters.
//! - [`ProviderRouter`] — Abstract AI provider interface.
//! - [`GeneratedFile`] — A parsed, path-sanitized output artifact.

/// Generated file artifacts shared with collaborators.
pub mod artifact;
/// Engine configuration, build modes, and guardrail limits.
pub mod config;
/// Error taxonomy and result alias.
pub mod error;
/// Provider routing, persistence, and validation collaborator traits.
pub mod provider;

pub use artifact::GeneratedFile;
pub use config::{BuildLimits, BuildMode, EngineConfig, PowerTier};
pub use error::{EngineError, EngineResult};
pub use provider::{
    GenerateOptions, ProviderId, ProviderRouter, ReadinessValidator, SnapshotSink,
    ValidationReport,
};
