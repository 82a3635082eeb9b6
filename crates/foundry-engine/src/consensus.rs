use crate::retry::RetryStrategy;
use foundry_core::{EngineConfig, GenerateOptions, ProviderId, ProviderRouter};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A recovery decision voted on by providers after an escalated failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    /// Retry the task as-is on the same provider.
    RetrySame,
    /// Retry on a different provider.
    SwitchProvider,
    /// Stop retrying and synthesize a solver recovery task.
    SpawnSolver,
    /// Give up on the task entirely.
    Abort,
}

impl std::fmt::Display for Vote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Vote::RetrySame => "retry_same",
            Vote::SwitchProvider => "switch_provider",
            Vote::SpawnSolver => "spawn_solver",
            Vote::Abort => "abort",
        };
        write!(f, "{s}")
    }
}

/// The decision a retry strategy implies when no vote overrides it.
pub fn default_vote_for(strategy: RetryStrategy) -> Vote {
    match strategy {
        RetryStrategy::SwitchProvider => Vote::SwitchProvider,
        RetryStrategy::NonRetriable => Vote::SpawnSolver,
        RetryStrategy::Backoff
        | RetryStrategy::ReduceContext
        | RetryStrategy::FixAndRetry
        | RetryStrategy::StandardRetry => Vote::RetrySame,
    }
}

/// Whether a failure escalates to a consensus vote: non-retriable failures,
/// failures that already burned a retry, and all-providers-failed reports.
pub fn should_run_consensus(
    strategy: RetryStrategy,
    retry_count: u32,
    all_providers_failed: bool,
) -> bool {
    strategy == RetryStrategy::NonRetriable || retry_count >= 1 || all_providers_failed
}

/// Extract a vote from a provider response. The first recognized keyword
/// wins; unrecognized responses count as no vote.
pub fn parse_vote(response: &str) -> Option<Vote> {
    let lower = response.to_lowercase();
    let candidates = [
        ("spawn_solver", Vote::SpawnSolver),
        ("spawn solver", Vote::SpawnSolver),
        ("switch_provider", Vote::SwitchProvider),
        ("switch provider", Vote::SwitchProvider),
        ("retry_same", Vote::RetrySame),
        ("retry same", Vote::RetrySame),
        ("abort", Vote::Abort),
    ];
    candidates
        .iter()
        .filter_map(|(kw, vote)| lower.find(kw).map(|pos| (pos, *vote)))
        .min_by_key(|(pos, _)| *pos)
        .map(|(_, vote)| vote)
}

/// Tally votes against the default decision.
///
/// Pure so it is testable without live providers: an alternative wins only
/// with at least `majority` votes; everything else, ties included, falls
/// back to the default.
pub fn tally(votes: &[Vote], default: Vote, majority: usize) -> Vote {
    let mut counts: Vec<(Vote, usize)> = Vec::new();
    for vote in votes {
        match counts.iter_mut().find(|(v, _)| v == vote) {
            Some((_, n)) => *n += 1,
            None => counts.push((*vote, 1)),
        }
    }
    counts
        .into_iter()
        .filter(|(vote, n)| *vote != default && *n >= majority)
        .max_by_key(|(_, n)| *n)
        .map_or(default, |(vote, _)| vote)
}

fn vote_prompt(error: &str, default: Vote) -> String {
    format!(
        "A build task failed with this error:\n{error}\n\n\
         The default recovery is \"{default}\". Vote for exactly one of: \
         retry_same, switch_provider, spawn_solver, abort. \
         Respond with the single keyword only."
    )
}

/// Solicit votes from up to `consensus_voters` top-ranked providers in
/// parallel and tally them. Provider errors and per-vote timeouts count as
/// votes for the default decision.
pub async fn run_failure_consensus(
    router: &Arc<dyn ProviderRouter>,
    available: &[ProviderId],
    error: &str,
    default_strategy: RetryStrategy,
    config: &EngineConfig,
) -> Vote {
    let default = default_vote_for(default_strategy);
    let voters: Vec<ProviderId> = ProviderId::rank_descending(available.to_vec())
        .into_iter()
        .take(config.consensus_voters)
        .collect();
    if voters.is_empty() {
        return default;
    }

    info!(
        voters = voters.len(),
        default = %default,
        "running failure consensus"
    );

    let prompt = vote_prompt(error, default);
    let timeout = Duration::from_secs(config.consensus_vote_timeout_secs);
    let calls = voters.iter().map(|provider| {
        let router = Arc::clone(router);
        let prompt = prompt.clone();
        let provider = *provider;
        async move {
            let options = GenerateOptions {
                max_tokens: 50,
                temperature: 0.0,
                system_prompt: None,
                power_mode: false,
            };
            match tokio::time::timeout(timeout, router.generate(provider, &prompt, options)).await
            {
                Ok(Ok(response)) => {
                    let vote = parse_vote(&response);
                    debug!(provider = %provider, vote = ?vote, "consensus vote received");
                    vote
                }
                Ok(Err(e)) => {
                    warn!(provider = %provider, error = %e, "consensus voter failed");
                    None
                }
                Err(_) => {
                    warn!(provider = %provider, "consensus vote timed out");
                    None
                }
            }
        }
    });

    let votes: Vec<Vote> = join_all(calls)
        .await
        .into_iter()
        .map(|v| v.unwrap_or(default))
        .collect();

    let decision = tally(&votes, default, config.consensus_majority);
    info!(decision = %decision, "consensus complete");
    decision
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use foundry_core::{EngineError, EngineResult};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn default_vote_mapping() {
        assert_eq!(default_vote_for(RetryStrategy::Backoff), Vote::RetrySame);
        assert_eq!(default_vote_for(RetryStrategy::SwitchProvider), Vote::SwitchProvider);
        assert_eq!(default_vote_for(RetryStrategy::NonRetriable), Vote::SpawnSolver);
        assert_eq!(default_vote_for(RetryStrategy::FixAndRetry), Vote::RetrySame);
    }

    #[test]
    fn consensus_trigger_condition() {
        assert!(should_run_consensus(RetryStrategy::NonRetriable, 0, false));
        assert!(should_run_consensus(RetryStrategy::StandardRetry, 1, false));
        assert!(should_run_consensus(RetryStrategy::Backoff, 0, true));
        assert!(!should_run_consensus(RetryStrategy::StandardRetry, 0, false));
    }

    #[test]
    fn parse_vote_first_keyword_wins() {
        assert_eq!(parse_vote("I vote switch_provider"), Some(Vote::SwitchProvider));
        assert_eq!(parse_vote("ABORT"), Some(Vote::Abort));
        assert_eq!(
            parse_vote("switch provider, though abort is tempting"),
            Some(Vote::SwitchProvider)
        );
        assert_eq!(parse_vote("no opinion"), None);
    }

    #[test]
    fn tally_requires_majority_to_override() {
        let default = Vote::RetrySame;
        // 2 of 3 vote to switch: override.
        let votes = [Vote::SwitchProvider, Vote::SwitchProvider, Vote::RetrySame];
        assert_eq!(tally(&votes, default, 2), Vote::SwitchProvider);
        // 1 of 3: default wins.
        let votes = [Vote::SwitchProvider, Vote::RetrySame, Vote::RetrySame];
        assert_eq!(tally(&votes, default, 2), Vote::RetrySame);
        // Empty: default wins.
        assert_eq!(tally(&[], default, 2), Vote::RetrySame);
    }

    #[test]
    fn tally_split_alternatives_fall_back_to_default() {
        let votes = [Vote::SwitchProvider, Vote::SpawnSolver, Vote::Abort];
        assert_eq!(tally(&votes, Vote::RetrySame, 2), Vote::RetrySame);
    }

    struct ScriptedRouter {
        responses: tokio::sync::Mutex<Vec<EngineResult<String>>>,
        calls: AtomicU32,
    }

    impl ScriptedRouter {
        fn new(responses: Vec<EngineResult<String>>) -> Self {
            Self {
                responses: tokio::sync::Mutex::new(responses),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ProviderRouter for ScriptedRouter {
        async fn generate(
            &self,
            _provider: ProviderId,
            _prompt: &str,
            _options: GenerateOptions,
        ) -> EngineResult<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().await;
            if responses.is_empty() {
                Err(EngineError::TransientProvider("no more scripted responses".into()))
            } else {
                responses.remove(0)
            }
        }

        async fn available_providers(&self) -> Vec<ProviderId> {
            vec![ProviderId::Claude, ProviderId::Gpt4, ProviderId::Gemini]
        }
    }

    #[tokio::test]
    async fn consensus_majority_overrides_default() {
        let router: Arc<dyn ProviderRouter> = Arc::new(ScriptedRouter::new(vec![
            Ok("spawn_solver".to_string()),
            Ok("spawn_solver".to_string()),
            Ok("retry_same".to_string()),
        ]));
        let decision = run_failure_consensus(
            &router,
            &[ProviderId::Claude, ProviderId::Gpt4, ProviderId::Gemini],
            "verification failed",
            RetryStrategy::StandardRetry,
            &EngineConfig::default(),
        )
        .await;
        assert_eq!(decision, Vote::SpawnSolver);
    }

    #[tokio::test]
    async fn voter_errors_count_for_default() {
        let router: Arc<dyn ProviderRouter> = Arc::new(ScriptedRouter::new(vec![
            Err(EngineError::TransientProvider("503".into())),
            Ok("spawn_solver".to_string()),
            Err(EngineError::TransientProvider("503".into())),
        ]));
        let decision = run_failure_consensus(
            &router,
            &[ProviderId::Claude, ProviderId::Gpt4, ProviderId::Gemini],
            "some failure",
            RetryStrategy::SwitchProvider,
            &EngineConfig::default(),
        )
        .await;
        // One solver vote against two defaulted errors: default stands.
        assert_eq!(decision, Vote::SwitchProvider);
    }

    #[tokio::test]
    async fn no_voters_returns_default() {
        let router: Arc<dyn ProviderRouter> = Arc::new(ScriptedRouter::new(vec![]));
        let decision = run_failure_consensus(
            &router,
            &[],
            "err",
            RetryStrategy::Backoff,
            &EngineConfig::default(),
        )
        .await;
        assert_eq!(decision, Vote::RetrySame);
    }

    #[tokio::test]
    async fn voter_count_capped_by_config() {
        let router = Arc::new(ScriptedRouter::new(vec![
            Ok("retry_same".to_string()),
            Ok("retry_same".to_string()),
            Ok("retry_same".to_string()),
            Ok("retry_same".to_string()),
        ]));
        let dyn_router: Arc<dyn ProviderRouter> = router.clone();
        let _ = run_failure_consensus(
            &dyn_router,
            &[
                ProviderId::Claude,
                ProviderId::Gpt4,
                ProviderId::Gemini,
                ProviderId::Grok,
            ],
            "err",
            RetryStrategy::StandardRetry,
            &EngineConfig::default(),
        )
        .await;
        assert_eq!(router.calls.load(Ordering::SeqCst), 3);
    }
}
