//! Build orchestration engine: multi-agent application builds driven by a
//! lifecycle state machine.
//!
//! A [`BuildEngine`] owns every build's state behind per-build locks. Each
//! build walks `Pending → Planning → InProgress → {Testing, Reviewing} →
//! Completed | Failed | Cancelled`, with role-scoped agents executing tasks
//! through a bounded executor pool. Failures are classified into retry
//! strategies, escalated failures go through a provider consensus vote, and
//! exhausted tasks are superseded by solver-run recovery tasks. Lifecycle
//! events fan out non-blockingly to per-build subscribers, and a supervisor
//! evicts finished or abandoned builds after their TTL.

pub mod artifacts;
pub mod broadcast;
mod checkpoint;
pub mod consensus;
pub mod engine;
mod executor;
pub mod phases;
pub mod prompts;
mod queue;
pub mod registry;
pub mod retry;
mod supervisor;
pub mod types;

pub use broadcast::Subscription;
pub use engine::{BuildEngine, EngineBuilder};
pub use registry::BuildRegistry;
pub use retry::RetryStrategy;
pub use types::{
    Agent, AgentRole, AgentStatus, Build, BuildEvent, BuildRequest, BuildStatus, Checkpoint,
    EngineStats, ErrorAttempt, EventKind, Task, TaskOutput, TaskStatus, TaskType,
};

pub use foundry_core::{
    BuildLimits, BuildMode, EngineConfig, EngineError, EngineResult, GenerateOptions,
    GeneratedFile, PowerTier, ProviderId, ProviderRouter, ReadinessValidator, SnapshotSink,
    ValidationReport,
};
