use crate::consensus::{self, Vote};
use crate::engine::{EngineCore, QueuedTask};
use crate::prompts;
use crate::retry::{self, RetryStrategy};
use crate::types::{AgentRole, EventKind, TaskStatus, TaskType};
use crate::artifacts::parse_task_output;
use foundry_core::{EngineError, EngineResult, GenerateOptions, ProviderId};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One executor in the pool. Pulls queued tasks off the shared dispatch
/// channel until the channel closes or the root scope is cancelled.
pub(crate) async fn worker_loop(
    core: Arc<EngineCore>,
    rx: Arc<Mutex<mpsc::Receiver<QueuedTask>>>,
    mut root_scope: watch::Receiver<bool>,
) {
    loop {
        let queued = {
            let mut rx = rx.lock().await;
            tokio::select! {
                queued = rx.recv() => queued,
                _ = root_scope.changed() => None,
            }
        };
        let Some(queued) = queued else { break };
        if *root_scope.borrow() {
            break;
        }
        if let Err(e) = execute_task(&core, queued).await {
            error!(
                build_id = %queued.build_id,
                task_id = %queued.task_id,
                error = %e,
                "task execution error"
            );
        }
    }
    debug!("executor worker stopped");
}

struct Attempt {
    agent_id: Uuid,
    role: AgentRole,
    provider: ProviderId,
    task_type: TaskType,
    prompt: String,
    options: GenerateOptions,
    backoff: std::time::Duration,
}

/// Run one queued task attempt end to end: budget gate, prompt assembly,
/// provider call under the per-task timeout, and result processing.
async fn execute_task(core: &Arc<EngineCore>, queued: QueuedTask) -> EngineResult<()> {
    let QueuedTask { build_id, task_id } = queued;
    // Builds evicted between enqueue and execution are simply skipped.
    let Ok(handle) = core.registry.get(build_id).await else {
        return Ok(());
    };
    let mut cancel = core.registry.cancel_scope(build_id).await?;

    let attempt = {
        let mut build = handle.write().await;
        if !build.is_active() || *cancel.borrow() {
            if let Some(task) = build.task_mut(task_id) {
                if !task.status.is_terminal() {
                    task.status = TaskStatus::Cancelled;
                }
            }
            return Ok(());
        }
        let Some(task) = build.task(task_id) else {
            return Ok(());
        };
        if task.status != TaskStatus::Pending {
            return Ok(());
        }

        if let Err(budget_err) = build.try_consume_request() {
            build.mark_task_failed(task_id, budget_err.to_string());
            drop(build);
            core.fail_build(build_id, &budget_err.to_string(), true).await;
            return Err(budget_err);
        }

        build.mark_task_in_progress(task_id);
        #[allow(clippy::expect_used)]
        let task = build.task(task_id).expect("task checked above");
        let agent_id = task
            .assigned_to
            .ok_or_else(|| EngineError::Config(format!("task {task_id} has no assignee")))?;
        let agent = build
            .agents
            .get(&agent_id)
            .ok_or(EngineError::AgentNotFound(agent_id))?;

        let role = agent.role;
        let mut max_tokens = prompts::max_tokens_for_role(role, &build);
        if task.retry_strategy == Some(RetryStrategy::ReduceContext) {
            max_tokens = retry::reduced_token_budget(max_tokens);
        }
        let backoff = if task.retry_strategy == Some(RetryStrategy::Backoff) {
            retry::backoff_delay(task.retry_count)
        } else {
            std::time::Duration::ZERO
        };

        Attempt {
            agent_id,
            role,
            provider: agent.provider,
            task_type: task.task_type,
            prompt: prompts::build_task_prompt(&build, task, role, &core.config),
            options: GenerateOptions {
                max_tokens,
                temperature: prompts::temperature_for_role(role),
                system_prompt: Some(prompts::system_prompt_for_role(role).to_string()),
                power_mode: build.power_tier.token_ceiling().is_some(),
            },
            backoff,
        }
    };

    core.emit(
        EventKind::AgentThinking,
        build_id,
        Some(attempt.agent_id),
        serde_json::json!({ "task_id": task_id, "role": attempt.role.to_string() }),
    )
    .await;

    if !attempt.backoff.is_zero() {
        tokio::select! {
            _ = tokio::time::sleep(attempt.backoff) => {}
            _ = cancel.changed() => {}
        }
        // A cancellation during the backoff window must not reach the
        // provider; the select above already consumed the notification.
        if *cancel.borrow() {
            return process_result(
                core,
                build_id,
                task_id,
                &attempt,
                Err(EngineError::BuildNotActive(build_id)),
            )
            .await;
        }
    }

    core.emit(
        EventKind::AgentGenerating,
        build_id,
        Some(attempt.agent_id),
        serde_json::json!({ "task_id": task_id, "provider": attempt.provider.to_string() }),
    )
    .await;

    // Await the provider bounded by the task timeout, abandoning immediately
    // when the build's scope is cancelled.
    let result: EngineResult<String> = tokio::select! {
        _ = cancel.changed() => Err(EngineError::BuildNotActive(build_id)),
        outcome = tokio::time::timeout(
            core.config.task_timeout(),
            core.router.generate(attempt.provider, &attempt.prompt, attempt.options.clone()),
        ) => match outcome {
            Ok(result) => result,
            Err(_) => Err(EngineError::TransientProvider(format!(
                "provider call timed out after {}s",
                core.config.task_timeout_secs
            ))),
        },
    };

    process_result(core, build_id, task_id, &attempt, result).await
}

/// Fold a provider result back into build state, driving the retry and
/// consensus machinery on failure.
async fn process_result(
    core: &Arc<EngineCore>,
    build_id: Uuid,
    task_id: Uuid,
    attempt: &Attempt,
    result: EngineResult<String>,
) -> EngineResult<()> {
    match result {
        Ok(response) => handle_success(core, build_id, task_id, attempt, &response).await,
        Err(EngineError::BuildNotActive(_)) => {
            // Cancellation observed mid-flight: never retried.
            let handle = core.registry.get(build_id).await?;
            let mut build = handle.write().await;
            if let Some(task) = build.task_mut(task_id) {
                if !task.status.is_terminal() {
                    task.status = TaskStatus::Cancelled;
                }
            }
            Ok(())
        }
        Err(e) => handle_failure(core, build_id, task_id, attempt, e).await,
    }
}

async fn handle_success(
    core: &Arc<EngineCore>,
    build_id: Uuid,
    task_id: Uuid,
    attempt: &Attempt,
    response: &str,
) -> EngineResult<()> {
    let output = parse_task_output(attempt.task_type, response);
    let files = output.files.len();

    let handle = core.registry.get(build_id).await?;
    let checkpoint_name = {
        let mut build = handle.write().await;
        if !build.mark_task_completed(task_id, output) {
            return Ok(());
        }
        if attempt.task_type.produces_code() && files > 0 {
            Some(format!("after {}", attempt.task_type))
        } else {
            None
        }
    };

    info!(
        build_id = %build_id,
        task_id = %task_id,
        role = %attempt.role,
        files,
        "task completed"
    );
    core.emit(
        EventKind::TaskCompleted,
        build_id,
        Some(attempt.agent_id),
        serde_json::json!({ "task_id": task_id, "files": files }),
    )
    .await;

    if let Some(name) = checkpoint_name {
        core.checkpoint(build_id, &name, "").await;
    }

    if attempt.task_type == TaskType::Plan {
        core.handle_plan_completion(build_id).await?;
        return Ok(());
    }

    core.update_progress(build_id).await;
    core.save_snapshot(build_id);
    core.check_build_completion(build_id).await;
    Ok(())
}

async fn handle_failure(
    core: &Arc<EngineCore>,
    build_id: Uuid,
    task_id: Uuid,
    attempt: &Attempt,
    error: EngineError,
) -> EngineResult<()> {
    let message = error.to_string();
    let strategy = retry::classify_failure(&message);
    let all_providers_failed = message.to_lowercase().contains("all providers failed");

    warn!(
        build_id = %build_id,
        task_id = %task_id,
        strategy = %strategy,
        error = %message,
        "task attempt failed"
    );

    let handle = core.registry.get(build_id).await?;
    let retry_count = {
        let mut build = handle.write().await;
        let Some(task) = build.task_mut(task_id) else {
            return Ok(());
        };
        task.record_error(&message, "provider");
        task.retry_strategy = Some(strategy);
        task.retry_count
    };

    // Escalated failures get a consensus vote before the next action.
    let decision = if consensus::should_run_consensus(strategy, retry_count, all_providers_failed) {
        core.emit(
            EventKind::ConsensusStarted,
            build_id,
            Some(attempt.agent_id),
            serde_json::json!({ "task_id": task_id, "default": strategy.to_string() }),
        )
        .await;
        let available = core.router.available_providers().await;
        let vote = consensus::run_failure_consensus(
            &core.router,
            &available,
            &message,
            strategy,
            &core.config,
        )
        .await;
        core.emit(
            EventKind::ConsensusDecision,
            build_id,
            Some(attempt.agent_id),
            serde_json::json!({ "task_id": task_id, "decision": vote.to_string() }),
        )
        .await;
        Some(vote)
    } else {
        None
    };

    let mut switch_to: Option<ProviderId> = None;
    if decision == Some(Vote::SwitchProvider) || strategy == RetryStrategy::SwitchProvider {
        let available = core.router.available_providers().await;
        switch_to = next_fallback_provider(&available, attempt.provider);
    }

    let (will_retry, abandoned) = {
        let mut build = handle.write().await;
        let Some(task) = build.task_mut(task_id) else {
            return Ok(());
        };
        if let Some(vote) = decision {
            task.input.insert(
                "consensus_decision".to_string(),
                serde_json::json!(vote.to_string()),
            );
            // The winning vote replaces the local classification, including
            // a non-retriable one.
            match vote {
                Vote::RetrySame => task.retry_strategy = Some(RetryStrategy::StandardRetry),
                Vote::SwitchProvider => {
                    task.retry_strategy = Some(RetryStrategy::SwitchProvider);
                }
                Vote::SpawnSolver | Vote::Abort => {
                    // Clamp the ceiling so the failure path below is taken.
                    task.max_retries = task.retry_count;
                }
            }
        }

        if task.can_retry() {
            if let Some(provider) = switch_to {
                if let Some(agent) = build.agents.get_mut(&attempt.agent_id) {
                    agent.provider = provider;
                    agent.model = provider.default_model().to_string();
                }
            }
            build.requeue_task(task_id);
            (true, false)
        } else {
            build.mark_task_failed(task_id, &message);
            let abandoned = decision == Some(Vote::Abort)
                || build.task(task_id).is_some_and(crate::types::Task::is_recovery);
            (false, abandoned)
        }
    };

    if will_retry {
        core.emit(
            EventKind::TaskRetrying,
            build_id,
            Some(attempt.agent_id),
            serde_json::json!({
                "task_id": task_id,
                "strategy": strategy.to_string(),
                "retry_count": retry_count + 1,
            }),
        )
        .await;
        core.enqueue_task(build_id, task_id).await;
        return Ok(());
    }

    core.emit(
        EventKind::TaskFailed,
        build_id,
        Some(attempt.agent_id),
        serde_json::json!({ "task_id": task_id, "error": message }),
    )
    .await;

    if abandoned {
        // A failed recovery task (or an abort vote) ends the build; another
        // recovery layer would loop forever.
        core.fail_build(build_id, &message, true).await;
        return Ok(());
    }

    core.enqueue_recovery(build_id, task_id).await?;
    core.update_progress(build_id).await;
    core.check_build_completion(build_id).await;
    Ok(())
}

/// The next provider to try after `current`: the highest-ranked available
/// provider that is not the current one.
pub(crate) fn next_fallback_provider(
    available: &[ProviderId],
    current: ProviderId,
) -> Option<ProviderId> {
    ProviderId::rank_descending(available.to_vec())
        .into_iter()
        .find(|p| *p != current)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
