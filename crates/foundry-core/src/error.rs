use thiserror::Error;
use uuid::Uuid;

/// A convenience `Result` alias using [`EngineError`].
pub type EngineResult<T> = Result<T, EngineError>;

/// Top-level error type for the Foundry build engine.
///
/// The provider-facing variants carry the classification the retry engine
/// needs: [`EngineError::TransientProvider`] failures are retried (with
/// backoff or a provider switch), [`EngineError::NonRetriableProvider`]
/// failures never are.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No build registered under the given id.
    #[error("Build not found: {0}")]
    BuildNotFound(Uuid),

    /// No agent registered under the given id.
    #[error("Agent not found: {0}")]
    AgentNotFound(Uuid),

    /// The build is already in a terminal state and accepts no more work.
    #[error("Build {0} is not active")]
    BuildNotActive(Uuid),

    /// A request or token guardrail was hit; fatal for the build.
    #[error("Budget exceeded: {0}")]
    BudgetExceeded(String),

    /// A provider failure that retrying cannot fix (bad model, bad config).
    #[error("Non-retriable provider error: {0}")]
    NonRetriableProvider(String),

    /// A transient provider failure (rate limit, network, overload).
    #[error("Transient provider error: {0}")]
    TransientProvider(String),

    /// Generated output failed the final readiness checks.
    #[error("Verification failure: {0}")]
    VerificationFailure(String),

    /// The consensus vote did not complete; the default strategy applies.
    #[error("Consensus timeout: {0}")]
    ConsensusTimeout(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Whether this error is fatal for the whole build rather than one task.
    ///
    /// Budget and config errors escalate directly; no retry can fix them.
    pub fn is_build_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::BudgetExceeded(_) | EngineError::Config(_)
        )
    }

    /// Whether a task failing with this error may be retried at all.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            EngineError::NonRetriableProvider(_)
                | EngineError::BudgetExceeded(_)
                | EngineError::BuildNotActive(_)
                | EngineError::Config(_)
        )
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
