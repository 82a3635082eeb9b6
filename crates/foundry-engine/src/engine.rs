use crate::artifacts::collect_generated_files;
use crate::broadcast::{BroadcastHub, Subscription};
use crate::executor;
use crate::phases;
use crate::prompts;
use crate::registry::{assign_providers_to_roles, BuildRegistry};
use crate::supervisor;
use crate::types::{
    Agent, AgentRole, AgentStatus, Build, BuildEvent, BuildRequest, BuildStatus, Checkpoint,
    EngineStats, EventKind, Task, TaskStatus, TaskType,
};
use foundry_core::{
    EngineConfig, EngineError, EngineResult, GenerateOptions, ProviderId, ProviderRouter,
    ReadinessValidator, SnapshotSink, ValidationReport,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A dispatch unit on the executor channel.
#[derive(Debug, Clone, Copy)]
pub(crate) struct QueuedTask {
    pub build_id: Uuid,
    pub task_id: Uuid,
}

/// Shared engine state: configuration, registries, the broadcast hub, and
/// the provider router. Executors, the phase scheduler, and the supervisor
/// all hold an `Arc` of this.
pub(crate) struct EngineCore {
    pub(crate) config: EngineConfig,
    pub(crate) registry: BuildRegistry,
    pub(crate) hub: BroadcastHub,
    pub(crate) router: Arc<dyn ProviderRouter>,
    pub(crate) validator: Option<Arc<dyn ReadinessValidator>>,
    pub(crate) snapshots: Option<Arc<dyn SnapshotSink>>,
    pub(crate) dispatch_tx: mpsc::Sender<QueuedTask>,
    pub(crate) root_cancel: watch::Sender<bool>,
}

impl EngineCore {
    /// Broadcast a lifecycle event to the build's subscribers.
    pub(crate) async fn emit(
        &self,
        kind: EventKind,
        build_id: Uuid,
        agent_id: Option<Uuid>,
        payload: serde_json::Value,
    ) {
        let mut event = BuildEvent::new(kind, build_id, payload);
        if let Some(agent_id) = agent_id {
            event = event.with_agent(agent_id);
        }
        self.hub.broadcast(event).await;
    }

    /// Hand a task to the executor pool.
    pub(crate) async fn enqueue_task(&self, build_id: Uuid, task_id: Uuid) {
        if self
            .dispatch_tx
            .send(QueuedTask { build_id, task_id })
            .await
            .is_err()
        {
            warn!(build_id = %build_id, task_id = %task_id, "dispatch channel closed");
        }
    }

    /// Capture a checkpoint for a build and announce it. A no-op for builds
    /// that no longer exist.
    pub(crate) async fn checkpoint(&self, build_id: Uuid, name: &str, description: &str) {
        let Ok(handle) = self.registry.get(build_id).await else {
            return;
        };
        let checkpoint = {
            let mut build = handle.write().await;
            build.create_checkpoint(name, description)
        };
        self.emit(
            EventKind::CheckpointCreated,
            build_id,
            None,
            serde_json::json!({ "sequence": checkpoint.sequence, "name": checkpoint.name }),
        )
        .await;
    }

    /// Recompute coarse build progress from task completion. Planning owns
    /// the first 20%; completion claims 100% separately, so this caps at 99.
    pub(crate) async fn update_progress(&self, build_id: Uuid) {
        let Ok(handle) = self.registry.get(build_id).await else {
            return;
        };
        let progress = {
            let mut build = handle.write().await;
            let (total, completed) = build
                .tasks
                .iter()
                .filter(|t| t.superseded_by.is_none())
                .fold((0usize, 0usize), |(total, completed), task| {
                    (
                        total + 1,
                        completed + usize::from(task.status == TaskStatus::Completed),
                    )
                });
            if total == 0 {
                return;
            }
            let progress = u8::try_from((20 + completed * 80 / total).min(99)).unwrap_or(99);
            build.set_progress(progress);
            build.progress
        };
        self.emit(
            EventKind::BuildProgress,
            build_id,
            None,
            serde_json::json!({ "progress": progress }),
        )
        .await;
    }

    /// Fail a build: cancel pending work, terminate its agents, stamp the
    /// error, and signal the cancellation scope.
    pub(crate) async fn fail_build(
        self: &Arc<Self>,
        build_id: Uuid,
        reason: &str,
        final_checkpoint: bool,
    ) {
        let Ok(handle) = self.registry.get(build_id).await else {
            return;
        };
        {
            let mut build = handle.write().await;
            if !build.is_active() {
                return;
            }
            build.cancel_pending_tasks();
            for agent in build.agents.values_mut() {
                agent.status = AgentStatus::Terminated;
            }
            build.error = Some(reason.to_string());
            build.set_status(BuildStatus::Failed);
            if final_checkpoint {
                build.create_checkpoint("final", reason);
            }
        }
        self.registry.cancel_build_scope(build_id).await;
        error!(build_id = %build_id, reason, "build failed");
        self.emit(
            EventKind::BuildFailed,
            build_id,
            None,
            serde_json::json!({ "error": reason }),
        )
        .await;
        self.save_snapshot(build_id);
    }

    /// Persist the build state and artifacts through the snapshot sink, off
    /// the caller's path. A no-op without a sink.
    pub(crate) fn save_snapshot(self: &Arc<Self>, build_id: Uuid) {
        let Some(sink) = self.snapshots.clone() else {
            return;
        };
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let Ok(handle) = core.registry.get(build_id).await else {
                return;
            };
            let (state, files) = {
                let build = handle.read().await;
                match serde_json::to_value(&*build) {
                    Ok(state) => (state, collect_generated_files(&build)),
                    Err(e) => {
                        warn!(build_id = %build_id, error = %e, "snapshot serialization failed");
                        return;
                    }
                }
            };
            if let Err(e) = sink.save_snapshot(build_id, state, &files).await {
                warn!(build_id = %build_id, error = %e, "snapshot save failed");
            }
        });
    }

    /// The plan task finished: spawn the worker team and start the phased
    /// pipeline. Roles whose spawn fails persistently are absorbed by the
    /// lead agent rather than failing the build.
    pub(crate) async fn handle_plan_completion(self: &Arc<Self>, build_id: Uuid) -> EngineResult<()> {
        let handle = self.registry.get(build_id).await?;
        let owner_id = {
            let mut build = handle.write().await;
            if !build.is_active() {
                return Ok(());
            }
            build.set_progress(20);
            build.owner_id.clone()
        };
        self.emit(
            EventKind::BuildProgress,
            build_id,
            None,
            serde_json::json!({ "progress": 20 }),
        )
        .await;

        let available = self.router.available_providers_for(&owner_id).await;
        if available.is_empty() {
            self.fail_build(build_id, "No AI providers available", true)
                .await;
            return Ok(());
        }
        let single_provider = available.len() == 1;
        let assignments = assign_providers_to_roles(&available, AgentRole::team_roles());

        for &role in AgentRole::team_roles() {
            let Some(&provider) = assignments.get(&role) else {
                continue;
            };
            match self
                .registry
                .spawn_agent_with_retries(build_id, role, provider, single_provider)
                .await
            {
                Ok(agent) => {
                    self.emit(
                        EventKind::AgentSpawned,
                        build_id,
                        Some(agent.id),
                        serde_json::json!({ "role": role.to_string(), "provider": provider.to_string() }),
                    )
                    .await;
                }
                Err(e) => {
                    warn!(
                        build_id = %build_id,
                        role = %role,
                        error = %e,
                        "spawn failed, lead agent absorbs role"
                    );
                }
            }
        }

        let core = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = phases::run_phased_pipeline(Arc::clone(&core), build_id).await {
                error!(build_id = %build_id, error = %e, "phased pipeline error");
            }
        });
        Ok(())
    }

    /// Decide whether the build is done. Runs once every task is terminal
    /// and the phase scheduler is not between phases: a failed, unsuperseded
    /// task fails the build; otherwise the readiness validator gets the
    /// final word, with one bounded recovery pass on a failed verdict.
    pub(crate) async fn check_build_completion(self: &Arc<Self>, build_id: Uuid) {
        let Ok(handle) = self.registry.get(build_id).await else {
            return;
        };

        enum Verdict {
            Fail(String),
            Validate(Vec<foundry_core::GeneratedFile>),
        }

        let verdict = {
            let build = handle.read().await;
            if !build.is_active()
                || build.phased_pipeline_active
                || build.tasks.is_empty()
                || !build.all_tasks_terminal()
            {
                return;
            }
            match build
                .tasks
                .iter()
                .find(|t| t.status == TaskStatus::Failed && t.superseded_by.is_none())
            {
                Some(task) => {
                    let last_error = task
                        .error_history
                        .last()
                        .map_or("unknown error", |e| e.error.as_str());
                    Verdict::Fail(format!("task {} failed: {last_error}", task.task_type))
                }
                None => Verdict::Validate(collect_generated_files(&build)),
            }
        };

        let files = match verdict {
            Verdict::Fail(reason) => {
                self.fail_build(build_id, &reason, true).await;
                return;
            }
            Verdict::Validate(files) => files,
        };

        let report = match &self.validator {
            Some(validator) => validator.validate(&files).await,
            None => ValidationReport {
                passed: true,
                issues: Vec::new(),
            },
        };

        if report.passed {
            let file_count = files.len();
            {
                let mut build = handle.write().await;
                if !build.set_status(BuildStatus::Completed) {
                    return;
                }
                build.set_progress(100);
                build.create_checkpoint("final", "build completed");
            }
            info!(build_id = %build_id, files = file_count, "build completed");
            self.emit(
                EventKind::BuildCompleted,
                build_id,
                None,
                serde_json::json!({ "files": file_count }),
            )
            .await;
            self.save_snapshot(build_id);
            return;
        }

        let issues = report.issues.join("; ");
        let recovery_task = {
            let mut build = handle.write().await;
            if build.readiness_recovery_attempts < self.config.readiness_recovery_limit {
                build.readiness_recovery_attempts += 1;
                build.set_status(BuildStatus::Reviewing);
                build.force_progress(95);
                let mut task = Task::new(build_id, TaskType::Review, "final_output_validation");
                task.status = TaskStatus::Failed;
                task.record_error(&issues, "verification");
                Some(build.add_task(task))
            } else {
                None
            }
        };

        match recovery_task {
            Some(task_id) => {
                warn!(build_id = %build_id, issues, "readiness validation failed, recovering");
                if let Err(e) = self.enqueue_recovery(build_id, task_id).await {
                    error!(build_id = %build_id, error = %e, "recovery scheduling failed");
                }
            }
            None => {
                self.fail_build(
                    build_id,
                    &format!("readiness validation failed: {issues}"),
                    true,
                )
                .await;
            }
        }
    }

    /// Supersede a failed task with a solver-run fix task carrying the full
    /// failure context. A failed recovery task ends the build instead of
    /// stacking another layer.
    pub(crate) async fn enqueue_recovery(
        self: &Arc<Self>,
        build_id: Uuid,
        failed_task_id: Uuid,
    ) -> EngineResult<()> {
        let handle = self.registry.get(build_id).await?;
        let (failure_context, failed_is_recovery, existing_solver, fallback_agent, description) = {
            let build = handle.read().await;
            if !build.is_active() {
                return Ok(());
            }
            let Some(task) = build.task(failed_task_id) else {
                return Ok(());
            };
            let context = format!(
                "Failed task: {} ({})\n{}",
                task.description,
                task.task_type,
                prompts::error_context(task, &self.config)
            );
            let fallback = [
                AgentRole::Backend,
                AgentRole::Frontend,
                AgentRole::Database,
                AgentRole::Reviewer,
            ]
            .iter()
            .find_map(|&role| build.agent_by_role(role).map(|a| a.id));
            (
                context,
                task.is_recovery(),
                build.agent_by_role(AgentRole::Solver).map(|a| a.id),
                fallback,
                task.description.clone(),
            )
        };

        if failed_is_recovery {
            self.fail_build(build_id, "recovery task failed; aborting build", true)
                .await;
            return Ok(());
        }

        let agent_id = match existing_solver {
            Some(id) => id,
            None => {
                let available = self.router.available_providers().await;
                let provider = ProviderId::rank_descending(available).first().copied();
                let spawned = match provider {
                    Some(provider) => {
                        match self
                            .registry
                            .spawn_agent(build_id, AgentRole::Solver, provider)
                            .await
                        {
                            Ok(agent) => {
                                self.emit(
                                    EventKind::AgentSpawned,
                                    build_id,
                                    Some(agent.id),
                                    serde_json::json!({ "role": "solver" }),
                                )
                                .await;
                                Some(agent.id)
                            }
                            Err(e) => {
                                warn!(build_id = %build_id, error = %e, "solver spawn failed");
                                None
                            }
                        }
                    }
                    None => None,
                };
                match spawned.or(fallback_agent) {
                    Some(id) => id,
                    None => {
                        self.fail_build(build_id, "no agent available for recovery", true)
                            .await;
                        return Ok(());
                    }
                }
            }
        };

        let recovery_task_id = {
            let mut build = handle.write().await;
            let task = Task::new(
                build_id,
                TaskType::Fix,
                format!("Recover from failed task: {description}"),
            )
            .with_priority(prompts::priority_for_role(AgentRole::Solver))
            .with_input("recovery_for", serde_json::json!(failed_task_id))
            .with_input("failure_context", serde_json::json!(failure_context));
            let task_id = build.assign_task(agent_id, task)?;
            if let Some(failed) = build.task_mut(failed_task_id) {
                // The recovery task takes over; the failed one no longer
                // counts against the build.
                failed.superseded_by = Some(task_id);
                failed.status = TaskStatus::Cancelled;
            }
            task_id
        };

        info!(
            build_id = %build_id,
            failed_task = %failed_task_id,
            recovery_task = %recovery_task_id,
            "recovery task scheduled"
        );
        self.emit(
            EventKind::RecoveryStarted,
            build_id,
            Some(agent_id),
            serde_json::json!({
                "failed_task": failed_task_id,
                "recovery_task": recovery_task_id,
            }),
        )
        .await;
        self.enqueue_task(build_id, recovery_task_id).await;
        Ok(())
    }

    /// Drop a build from the registry and close its subscriber queues.
    /// Returns whether the build existed.
    pub(crate) async fn evict_build(&self, build_id: Uuid) -> bool {
        let removed = self.registry.remove(build_id).await.is_some();
        if removed {
            let closed = self.hub.close_build(build_id).await;
            info!(build_id = %build_id, subscribers_closed = closed, "build evicted");
        }
        removed
    }
}

/// Configures a [`BuildEngine`] before its executor pool starts.
pub struct EngineBuilder {
    config: EngineConfig,
    router: Arc<dyn ProviderRouter>,
    validator: Option<Arc<dyn ReadinessValidator>>,
    snapshots: Option<Arc<dyn SnapshotSink>>,
}

impl EngineBuilder {
    /// Attach a readiness validator consulted before a build completes.
    pub fn validator(mut self, validator: Arc<dyn ReadinessValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Attach a snapshot sink that persists build state asynchronously.
    pub fn snapshot_sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.snapshots = Some(sink);
        self
    }

    /// Start the executor pool and the cleanup supervisor. Must run inside
    /// a tokio runtime.
    pub fn build(self) -> BuildEngine {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(1_024);
        let (root_cancel, root_rx) = watch::channel(false);
        let hub = BroadcastHub::new(&self.config);
        let core = Arc::new(EngineCore {
            config: self.config,
            registry: BuildRegistry::new(),
            hub,
            router: self.router,
            validator: self.validator,
            snapshots: self.snapshots,
            dispatch_tx,
            root_cancel,
        });

        let shared_rx = Arc::new(Mutex::new(dispatch_rx));
        let mut workers = Vec::with_capacity(core.config.executor_workers);
        for _ in 0..core.config.executor_workers {
            workers.push(tokio::spawn(executor::worker_loop(
                Arc::clone(&core),
                Arc::clone(&shared_rx),
                root_rx.clone(),
            )));
        }
        tokio::spawn(supervisor::run_cleanup_loop(Arc::clone(&core), root_rx));

        info!(workers = core.config.executor_workers, "engine started");
        BuildEngine {
            core,
            workers: Mutex::new(workers),
        }
    }
}

/// The build orchestration engine.
///
/// Owns every build's state behind per-build locks, dispatches tasks to a
/// bounded executor pool, fans lifecycle events out to subscribers, and
/// evicts finished builds after their TTL.
pub struct BuildEngine {
    pub(crate) core: Arc<EngineCore>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BuildEngine {
    /// An engine with neither validator nor snapshot sink.
    pub fn new(config: EngineConfig, router: Arc<dyn ProviderRouter>) -> Self {
        Self::builder(config, router).build()
    }

    pub fn builder(config: EngineConfig, router: Arc<dyn ProviderRouter>) -> EngineBuilder {
        EngineBuilder {
            config,
            router,
            validator: None,
            snapshots: None,
        }
    }

    /// Register a new build in `Pending`. Validates the guardrails before
    /// anything is allocated.
    pub async fn create_build(
        &self,
        owner_id: impl Into<String>,
        request: BuildRequest,
    ) -> EngineResult<Build> {
        let build = Build::new(owner_id, request);
        build.limits.validate()?;
        let build_id = build.id;
        let snapshot = build.clone();
        self.core.registry.insert(build).await;
        info!(build_id = %build_id, mode = %snapshot.mode, "build created");
        self.core
            .emit(
                EventKind::BuildCreated,
                build_id,
                None,
                serde_json::json!({ "mode": snapshot.mode.to_string() }),
            )
            .await;
        Ok(snapshot)
    }

    /// Start a pending build: verify provider availability, spawn the lead
    /// agent, queue the plan task, and arm the build watchdogs.
    pub async fn start_build(&self, build_id: Uuid) -> EngineResult<()> {
        let handle = self.core.registry.get(build_id).await?;
        let (owner_id, description) = {
            let build = handle.read().await;
            if build.status != BuildStatus::Pending {
                return Err(EngineError::Config(format!(
                    "build {build_id} is not pending"
                )));
            }
            (build.owner_id.clone(), build.description.clone())
        };

        let available = self.core.router.available_providers_for(&owner_id).await;
        if available.is_empty() {
            {
                let mut build = handle.write().await;
                build.error = Some("No AI providers available".to_string());
                build.set_status(BuildStatus::Failed);
            }
            self.core
                .emit(
                    EventKind::BuildFailed,
                    build_id,
                    None,
                    serde_json::json!({ "error": "No AI providers available" }),
                )
                .await;
            return Err(EngineError::Config("No AI providers available".to_string()));
        }
        let single_provider = available.len() == 1;
        let ranked = ProviderId::rank_descending(available);
        let lead_provider = match ranked.first() {
            Some(&provider) => provider,
            None => return Err(EngineError::Config("No AI providers available".to_string())),
        };

        {
            let mut build = handle.write().await;
            build.set_status(BuildStatus::Planning);
        }
        self.core
            .emit(EventKind::BuildStarted, build_id, None, serde_json::json!({}))
            .await;

        let lead = match self
            .core
            .registry
            .spawn_agent_with_retries(build_id, AgentRole::Lead, lead_provider, single_provider)
            .await
        {
            Ok(agent) => agent,
            Err(e) => {
                self.core
                    .fail_build(build_id, &format!("lead agent spawn failed: {e}"), false)
                    .await;
                return Err(e);
            }
        };
        self.core
            .emit(
                EventKind::AgentSpawned,
                build_id,
                Some(lead.id),
                serde_json::json!({ "role": "lead", "provider": lead_provider.to_string() }),
            )
            .await;

        let plan_task_id = {
            let mut build = handle.write().await;
            let task = Task::new(
                build_id,
                TaskType::Plan,
                format!("Create a development plan for: {description}"),
            )
            .with_priority(prompts::priority_for_role(AgentRole::Planner));
            build.assign_task(lead.id, task)?
        };
        self.core
            .emit(
                EventKind::TaskCreated,
                build_id,
                Some(lead.id),
                serde_json::json!({ "task_id": plan_task_id, "type": "plan" }),
            )
            .await;
        self.core.enqueue_task(build_id, plan_task_id).await;

        tokio::spawn(supervisor::watch_build_timeout(
            Arc::clone(&self.core),
            build_id,
        ));
        tokio::spawn(supervisor::monitor_inactivity(
            Arc::clone(&self.core),
            build_id,
        ));
        info!(build_id = %build_id, provider = %lead_provider, "build started");
        Ok(())
    }

    /// Relay a user message to the build's lead agent and return its reply.
    pub async fn send_message(&self, build_id: Uuid, message: &str) -> EngineResult<String> {
        let handle = self.core.registry.get(build_id).await?;
        let (lead, prompt, options) = {
            let build = handle.read().await;
            if !build.is_active() {
                return Err(EngineError::BuildNotActive(build_id));
            }
            let lead = build
                .agents
                .values()
                .find(|a| a.role == AgentRole::Lead)
                .cloned()
                .ok_or_else(|| {
                    EngineError::Config(format!("build {build_id} has no lead agent"))
                })?;
            let prompt = format!(
                "The user asks about the build \"{}\":\n{message}",
                build.description
            );
            let options = GenerateOptions {
                max_tokens: prompts::max_tokens_for_role(AgentRole::Lead, &build),
                temperature: prompts::temperature_for_role(AgentRole::Lead),
                system_prompt: Some(prompts::system_prompt_for_role(AgentRole::Lead).to_string()),
                power_mode: build.power_tier.token_ceiling().is_some(),
            };
            (lead, prompt, options)
        };

        let response = tokio::time::timeout(
            self.core.config.task_timeout(),
            self.core.router.generate(lead.provider, &prompt, options),
        )
        .await
        .map_err(|_| {
            EngineError::TransientProvider(format!(
                "provider call timed out after {}s",
                self.core.config.task_timeout_secs
            ))
        })??;

        {
            let mut build = handle.write().await;
            build.touch();
        }
        self.core
            .emit(
                EventKind::AgentMessage,
                build_id,
                Some(lead.id),
                serde_json::json!({ "message": message, "response": response }),
            )
            .await;
        Ok(response)
    }

    /// Cancel an active build: pending tasks are cancelled, agents
    /// terminated, and the cancellation scope signalled so in-flight
    /// provider calls are abandoned.
    pub async fn cancel_build(&self, build_id: Uuid) -> EngineResult<()> {
        let handle = self.core.registry.get(build_id).await?;
        {
            let mut build = handle.write().await;
            if !build.is_active() {
                return Err(EngineError::BuildNotActive(build_id));
            }
            build.cancel_pending_tasks();
            for agent in build.agents.values_mut() {
                agent.status = AgentStatus::Terminated;
            }
            build.set_status(BuildStatus::Cancelled);
        }
        self.core.registry.cancel_build_scope(build_id).await;
        info!(build_id = %build_id, "build cancelled");
        self.core
            .emit(
                EventKind::BuildCancelled,
                build_id,
                None,
                serde_json::json!({}),
            )
            .await;
        self.core.save_snapshot(build_id);
        Ok(())
    }

    /// Roll an active build back to an earlier checkpoint.
    pub async fn rollback_to_checkpoint(
        &self,
        build_id: Uuid,
        sequence: u32,
    ) -> EngineResult<Checkpoint> {
        let handle = self.core.registry.get(build_id).await?;
        let checkpoint = {
            let mut build = handle.write().await;
            build.rollback_to_checkpoint(sequence)?
        };
        self.core
            .emit(
                EventKind::RollbackApplied,
                build_id,
                None,
                serde_json::json!({ "sequence": sequence }),
            )
            .await;
        self.core.save_snapshot(build_id);
        Ok(checkpoint)
    }

    /// Subscribe to a build's event stream. The build must exist.
    pub async fn subscribe(&self, build_id: Uuid) -> EngineResult<Subscription> {
        self.core.registry.get(build_id).await?;
        self.core.hub.subscribe(build_id).await
    }

    /// Drop a subscription. Idempotent.
    pub async fn unsubscribe(&self, build_id: Uuid, subscriber_id: Uuid) {
        self.core.hub.unsubscribe(build_id, subscriber_id).await;
    }

    /// A point-in-time copy of a build.
    pub async fn get_build(&self, build_id: Uuid) -> EngineResult<Build> {
        let handle = self.core.registry.get(build_id).await?;
        let build = handle.read().await;
        Ok(build.clone())
    }

    /// A point-in-time copy of an agent, located through the global index.
    pub async fn get_agent(&self, agent_id: Uuid) -> EngineResult<Agent> {
        let build_id = self.core.registry.build_for_agent(agent_id).await?;
        let handle = self.core.registry.get(build_id).await?;
        let build = handle.read().await;
        build
            .agents
            .get(&agent_id)
            .cloned()
            .ok_or(EngineError::AgentNotFound(agent_id))
    }

    /// The checkpoint history of a build, oldest first.
    pub async fn get_checkpoints(&self, build_id: Uuid) -> EngineResult<Vec<Checkpoint>> {
        let handle = self.core.registry.get(build_id).await?;
        let build = handle.read().await;
        Ok(build.checkpoints.clone())
    }

    /// Drop a build from the registry immediately, cancelling its scope and
    /// closing its subscriber queues. Returns whether the build existed.
    /// The supervisor calls the same path on TTL expiry.
    pub async fn evict_build(&self, build_id: Uuid) -> bool {
        self.core.evict_build(build_id).await
    }

    /// Live resource counters.
    pub async fn stats(&self) -> EngineStats {
        let (builds, agents) = self.core.registry.counts().await;
        let mut active_builds = 0;
        for id in self.core.registry.build_ids().await {
            if let Ok(handle) = self.core.registry.get(id).await {
                if handle.read().await.is_active() {
                    active_builds += 1;
                }
            }
        }
        EngineStats {
            builds,
            active_builds,
            agents,
            subscribers: self.core.hub.total_subscribers().await,
        }
    }

    /// Stop accepting work and wind the executor pool down, waiting up to
    /// 30 seconds for in-flight tasks.
    pub async fn shutdown(&self) {
        let _ = self.core.root_cancel.send(true);
        let mut workers = self.workers.lock().await;
        for handle in workers.drain(..) {
            if tokio::time::timeout(Duration::from_secs(30), handle)
                .await
                .is_err()
            {
                warn!("executor worker did not stop within the grace period");
            }
        }
        debug!("engine stopped");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use foundry_core::BuildLimits;

    struct NoProviders;

    #[async_trait]
    impl ProviderRouter for NoProviders {
        async fn generate(
            &self,
            _provider: ProviderId,
            _prompt: &str,
            _options: GenerateOptions,
        ) -> EngineResult<String> {
            Err(EngineError::TransientProvider("no providers".to_string()))
        }

        async fn available_providers(&self) -> Vec<ProviderId> {
            Vec::new()
        }
    }

    struct EchoRouter;

    #[async_trait]
    impl ProviderRouter for EchoRouter {
        async fn generate(
            &self,
            _provider: ProviderId,
            prompt: &str,
            _options: GenerateOptions,
        ) -> EngineResult<String> {
            Ok(format!("ack: {}", prompt.len()))
        }

        async fn available_providers(&self) -> Vec<ProviderId> {
            vec![ProviderId::Claude]
        }
    }

    fn engine(router: Arc<dyn ProviderRouter>) -> BuildEngine {
        BuildEngine::new(EngineConfig::default(), router)
    }

    #[tokio::test]
    async fn create_and_get_build() {
        let engine = engine(Arc::new(EchoRouter));
        let build = engine
            .create_build("owner-1", BuildRequest::new("a todo app"))
            .await
            .unwrap();
        assert_eq!(build.status, BuildStatus::Pending);

        let fetched = engine.get_build(build.id).await.unwrap();
        assert_eq!(fetched.id, build.id);
        assert_eq!(fetched.description, "a todo app");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn create_build_rejects_zero_limits() {
        let engine = engine(Arc::new(EchoRouter));
        let limits = BuildLimits {
            max_agents: 0,
            max_retries: 1,
            max_requests: 10,
            max_tokens: 1_000,
        };
        let err = engine
            .create_build("owner", BuildRequest::new("x").with_limits(limits))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn start_build_without_providers_fails_the_build() {
        let engine = engine(Arc::new(NoProviders));
        let build = engine
            .create_build("owner", BuildRequest::new("app"))
            .await
            .unwrap();

        assert!(engine.start_build(build.id).await.is_err());
        let build = engine.get_build(build.id).await.unwrap();
        assert_eq!(build.status, BuildStatus::Failed);
        assert_eq!(build.error.as_deref(), Some("No AI providers available"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn start_build_twice_is_rejected() {
        let engine = engine(Arc::new(NoProviders));
        let build = engine
            .create_build("owner", BuildRequest::new("app"))
            .await
            .unwrap();
        let _ = engine.start_build(build.id).await;
        // Already failed, no longer pending.
        assert!(engine.start_build(build.id).await.is_err());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_build_is_terminal() {
        let engine = engine(Arc::new(EchoRouter));
        let build = engine
            .create_build("owner", BuildRequest::new("app"))
            .await
            .unwrap();

        engine.cancel_build(build.id).await.unwrap();
        let fetched = engine.get_build(build.id).await.unwrap();
        assert_eq!(fetched.status, BuildStatus::Cancelled);
        assert!(matches!(
            engine.cancel_build(build.id).await,
            Err(EngineError::BuildNotActive(_))
        ));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn subscribe_requires_existing_build() {
        let engine = engine(Arc::new(EchoRouter));
        assert!(matches!(
            engine.subscribe(Uuid::new_v4()).await,
            Err(EngineError::BuildNotFound(_))
        ));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_emits_event_to_subscribers() {
        let engine = engine(Arc::new(EchoRouter));
        let build = engine
            .create_build("owner", BuildRequest::new("app"))
            .await
            .unwrap();
        let mut sub = engine.subscribe(build.id).await.unwrap();

        engine.cancel_build(build.id).await.unwrap();
        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::BuildCancelled);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn rollback_through_the_engine() {
        let engine = engine(Arc::new(EchoRouter));
        let build = engine
            .create_build("owner", BuildRequest::new("app"))
            .await
            .unwrap();
        let handle = engine.core.registry.get(build.id).await.unwrap();
        {
            let mut build = handle.write().await;
            build.set_status(BuildStatus::InProgress);
            build.set_progress(30);
            build.create_checkpoint("one", "");
            build.set_progress(60);
            build.create_checkpoint("two", "");
        }

        let restored = engine.rollback_to_checkpoint(build.id, 1).await.unwrap();
        assert_eq!(restored.sequence, 1);
        let fetched = engine.get_build(build.id).await.unwrap();
        assert_eq!(fetched.progress, 30);
        assert_eq!(fetched.checkpoints.len(), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn stats_track_builds_and_subscribers() {
        let engine = engine(Arc::new(EchoRouter));
        let build = engine
            .create_build("owner", BuildRequest::new("app"))
            .await
            .unwrap();
        let _sub = engine.subscribe(build.id).await.unwrap();

        let stats = engine.stats().await;
        assert_eq!(stats.builds, 1);
        assert_eq!(stats.active_builds, 1);
        assert_eq!(stats.subscribers, 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn send_message_requires_lead_agent() {
        let engine = engine(Arc::new(EchoRouter));
        let build = engine
            .create_build("owner", BuildRequest::new("app"))
            .await
            .unwrap();
        // Pending build, no lead spawned yet.
        assert!(engine.send_message(build.id, "status?").await.is_err());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn eviction_removes_build_and_closes_subscribers() {
        let engine = engine(Arc::new(EchoRouter));
        let build = engine
            .create_build("owner", BuildRequest::new("app"))
            .await
            .unwrap();
        let mut sub = engine.subscribe(build.id).await.unwrap();

        assert!(engine.core.evict_build(build.id).await);
        assert!(matches!(
            engine.get_build(build.id).await,
            Err(EngineError::BuildNotFound(_))
        ));
        assert!(sub.receiver.recv().await.is_none());
        // Broadcasting to the evicted build is a no-op.
        engine
            .core
            .emit(EventKind::BuildProgress, build.id, None, serde_json::json!({}))
            .await;
        engine.shutdown().await;
    }
}
