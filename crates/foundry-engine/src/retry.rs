use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a failed task attempt should be handled next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Rate limited; wait before the next attempt.
    Backoff,
    /// Transient provider or network failure; try a different provider.
    SwitchProvider,
    /// Payload too large; cut the next attempt's token budget to 75%.
    ReduceContext,
    /// Output failed verification; inject corrective guidance and retry.
    FixAndRetry,
    /// Unclassified failure; plain retry up to the ceiling.
    StandardRetry,
    /// Configuration-class failure; never retried.
    NonRetriable,
}

impl std::fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RetryStrategy::Backoff => "backoff",
            RetryStrategy::SwitchProvider => "switch_provider",
            RetryStrategy::ReduceContext => "reduce_context",
            RetryStrategy::FixAndRetry => "fix_and_retry",
            RetryStrategy::StandardRetry => "standard_retry",
            RetryStrategy::NonRetriable => "non_retriable",
        };
        write!(f, "{s}")
    }
}

/// Whether an error message describes a failure no retry can fix.
pub fn is_non_retriable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("not active")
        || lower.contains("budget")
        || lower.contains("no providers")
        || lower.contains("no ai providers")
        || lower.contains("model not found")
        || lower.contains("invalid api key")
        || lower.contains("invalid request")
        || lower.contains("invalid configuration")
}

/// Classify a failure message into a retry strategy.
///
/// Non-retriable patterns win over everything else; among retriable classes
/// the first matching bucket applies, defaulting to a standard retry.
pub fn classify_failure(message: &str) -> RetryStrategy {
    let lower = message.to_lowercase();

    if is_non_retriable_message(message) {
        return RetryStrategy::NonRetriable;
    }
    if lower.contains("rate limit")
        || lower.contains("429")
        || lower.contains("quota")
        || lower.contains("too many requests")
    {
        return RetryStrategy::Backoff;
    }
    if lower.contains("context length")
        || lower.contains("context_length")
        || lower.contains("token limit")
        || lower.contains("maximum context")
        || lower.contains("max tokens exceeded")
    {
        return RetryStrategy::ReduceContext;
    }
    if lower.contains("503")
        || lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("connection")
        || lower.contains("unavailable")
        || lower.contains("overloaded")
    {
        return RetryStrategy::SwitchProvider;
    }
    if lower.contains("verification")
        || lower.contains("build failed")
        || lower.contains("syntax")
        || lower.contains("compilation")
        || lower.contains("lint")
    {
        return RetryStrategy::FixAndRetry;
    }
    RetryStrategy::StandardRetry
}

/// Delay before the next attempt: linear in the retry count.
pub fn backoff_delay(retry_count: u32) -> Duration {
    Duration::from_secs(u64::from(retry_count) * 2)
}

/// Token budget after a `ReduceContext` classification: 75% of the current
/// budget, floored so a task never runs with a useless allowance.
pub fn reduced_token_budget(max_tokens: u32) -> u32 {
    (max_tokens * 3 / 4).max(256)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
