use crate::retry::RetryStrategy;
use chrono::{DateTime, Utc};
use foundry_core::{BuildLimits, BuildMode, GeneratedFile, PowerTier, ProviderId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Lifecycle status of a build.
///
/// `Pending → Planning → InProgress → {Testing, Reviewing} → Completed |
/// Failed | Cancelled`. `InProgress` may re-enter `Testing`/`Reviewing`
/// through recovery flows. Terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Planning,
    InProgress,
    Testing,
    Reviewing,
    Completed,
    Failed,
    Cancelled,
}

impl BuildStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildStatus::Completed | BuildStatus::Failed | BuildStatus::Cancelled
        )
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Planning => "planning",
            BuildStatus::InProgress => "in_progress",
            BuildStatus::Testing => "testing",
            BuildStatus::Reviewing => "reviewing",
            BuildStatus::Completed => "completed",
            BuildStatus::Failed => "failed",
            BuildStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Role of an agent within a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentRole {
    /// Coordinates the build and absorbs work from failed spawns.
    Lead,
    /// Turns the request into an initial step list.
    Planner,
    /// Designs the system architecture.
    Architect,
    /// Generates UI code.
    Frontend,
    /// Generates API code.
    Backend,
    /// Designs the database schema.
    Database,
    /// Writes tests.
    Testing,
    /// Reviews code quality.
    Reviewer,
    /// Diagnoses and fixes failed tasks.
    Solver,
}

impl AgentRole {
    /// The worker roles scheduled through the phased pipeline, in spawn order.
    pub fn team_roles() -> &'static [AgentRole] {
        &[
            AgentRole::Architect,
            AgentRole::Database,
            AgentRole::Backend,
            AgentRole::Frontend,
            AgentRole::Testing,
            AgentRole::Reviewer,
        ]
    }

    /// Whether this role benefits from the strongest reasoning provider.
    pub fn is_reasoning(self) -> bool {
        matches!(
            self,
            AgentRole::Lead | AgentRole::Planner | AgentRole::Architect | AgentRole::Reviewer
        )
    }

    /// Whether this role is primarily code-producing.
    pub fn is_implementation(self) -> bool {
        matches!(
            self,
            AgentRole::Frontend | AgentRole::Backend | AgentRole::Database | AgentRole::Solver
        )
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentRole::Lead => "lead",
            AgentRole::Planner => "planner",
            AgentRole::Architect => "architect",
            AgentRole::Frontend => "frontend",
            AgentRole::Backend => "backend",
            AgentRole::Database => "database",
            AgentRole::Testing => "testing",
            AgentRole::Reviewer => "reviewer",
            AgentRole::Solver => "solver",
        };
        write!(f, "{s}")
    }
}

/// Status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Idle,
    Working,
    Completed,
    Error,
    Terminated,
}

/// A role-scoped worker bound to one provider, executing tasks for a single
/// build. Agents never outlive their build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub build_id: Uuid,
    pub role: AgentRole,
    pub provider: ProviderId,
    pub model: String,
    pub status: AgentStatus,
    pub current_task: Option<Uuid>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(build_id: Uuid, role: AgentRole, provider: ProviderId) -> Self {
        Self {
            id: Uuid::new_v4(),
            build_id,
            role,
            provider,
            model: provider.default_model().to_string(),
            status: AgentStatus::Idle,
            current_task: None,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

/// Kind of work a task represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Plan,
    Architecture,
    GenerateUi,
    GenerateApi,
    GenerateSchema,
    GenerateFile,
    Test,
    Review,
    Fix,
}

impl TaskType {
    /// Whether tasks of this type are expected to emit file artifacts.
    pub fn produces_code(self) -> bool {
        matches!(
            self,
            TaskType::GenerateUi
                | TaskType::GenerateApi
                | TaskType::GenerateSchema
                | TaskType::GenerateFile
                | TaskType::Test
                | TaskType::Fix
        )
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskType::Plan => "plan",
            TaskType::Architecture => "architecture",
            TaskType::GenerateUi => "generate_ui",
            TaskType::GenerateApi => "generate_api",
            TaskType::GenerateSchema => "generate_schema",
            TaskType::GenerateFile => "generate_file",
            TaskType::Test => "test",
            TaskType::Review => "review",
            TaskType::Fix => "fix",
        };
        write!(f, "{s}")
    }
}

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether this status is terminal for the task.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// One recorded failure of a task attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorAttempt {
    /// 1-based attempt number.
    pub attempt: u32,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    /// Short tag describing where the failure happened (e.g. "provider",
    /// "verification", "consensus").
    pub context: String,
}

/// Structured output of a completed task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskOutput {
    /// File artifacts extracted from the response.
    pub files: Vec<GeneratedFile>,
    /// Non-file messages (summaries, review notes, plan text).
    pub messages: Vec<String>,
}

/// Unit of schedulable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub build_id: Uuid,
    pub task_type: TaskType,
    pub description: String,
    /// Higher runs first among pending tasks.
    pub priority: u8,
    pub status: TaskStatus,
    pub assigned_to: Option<Uuid>,
    /// Structured input; carries failure context for recovery tasks and the
    /// recorded consensus decision.
    #[serde(default)]
    pub input: HashMap<String, serde_json::Value>,
    pub output: Option<TaskOutput>,
    pub retry_count: u32,
    pub retry_strategy: Option<RetryStrategy>,
    /// Failure history, oldest first.
    #[serde(default)]
    pub error_history: Vec<ErrorAttempt>,
    /// Retry ceiling, inherited from the build guardrails.
    pub max_retries: u32,
    /// Id of the recovery task that superseded this one, if any.
    pub superseded_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(build_id: Uuid, task_type: TaskType, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            build_id,
            task_type,
            description: description.into(),
            priority: 50,
            status: TaskStatus::Pending,
            assigned_to: None,
            input: HashMap::new(),
            output: None,
            retry_count: 0,
            retry_strategy: None,
            error_history: Vec::new(),
            max_retries: 3,
            superseded_by: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_assignee(mut self, agent_id: Uuid) -> Self {
        self.assigned_to = Some(agent_id);
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.input.insert(key.into(), value);
        self
    }

    /// Record a failed attempt in the error history.
    pub fn record_error(&mut self, error: impl Into<String>, context: impl Into<String>) {
        self.error_history.push(ErrorAttempt {
            attempt: self.retry_count + 1,
            error: error.into(),
            timestamp: Utc::now(),
            context: context.into(),
        });
    }

    /// Whether another retry attempt is allowed. `retry_count` counts
    /// requeues, so the failure being handled is attempt `retry_count + 1`;
    /// `max_retries` bounds total attempts, and the task fails on the last
    /// allowed one. Cancelled tasks and non-retriable classifications never
    /// retry.
    pub fn can_retry(&self) -> bool {
        self.status != TaskStatus::Cancelled
            && self.retry_strategy != Some(RetryStrategy::NonRetriable)
            && self.retry_count + 1 < self.max_retries
    }

    /// Whether this task was synthesized to recover from another failure.
    pub fn is_recovery(&self) -> bool {
        self.task_type == TaskType::Fix && self.input.contains_key("recovery_for")
    }
}

/// An immutable snapshot of artifacts and progress at a point in a build's
/// history. Append-only per build; sequence numbers are strictly increasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub sequence: u32,
    pub name: String,
    pub description: String,
    pub files: Vec<GeneratedFile>,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
}

/// Kinds of lifecycle events fanned out to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    BuildCreated,
    BuildStarted,
    BuildProgress,
    BuildCompleted,
    BuildFailed,
    BuildCancelled,
    AgentSpawned,
    AgentThinking,
    AgentGenerating,
    AgentMessage,
    TaskCreated,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskRetrying,
    ConsensusStarted,
    ConsensusDecision,
    RecoveryStarted,
    CheckpointCreated,
    RollbackApplied,
    InactivityWarning,
}

/// A transient lifecycle event. Never persisted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEvent {
    pub kind: EventKind,
    pub build_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl BuildEvent {
    pub fn new(kind: EventKind, build_id: Uuid, payload: serde_json::Value) -> Self {
        Self {
            kind,
            build_id,
            agent_id: None,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn with_agent(mut self, agent_id: Uuid) -> Self {
        self.agent_id = Some(agent_id);
        self
    }
}

/// A request to create a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub description: String,
    #[serde(default)]
    pub mode: BuildMode,
    #[serde(default)]
    pub power_tier: PowerTier,
    /// Explicit guardrail override; defaults derive from mode and tier.
    #[serde(default)]
    pub limits: Option<BuildLimits>,
}

impl BuildRequest {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            mode: BuildMode::default(),
            power_tier: PowerTier::default(),
            limits: None,
        }
    }

    pub fn with_mode(mut self, mode: BuildMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_power_tier(mut self, tier: PowerTier) -> Self {
        self.power_tier = tier;
        self
    }

    pub fn with_limits(mut self, limits: BuildLimits) -> Self {
        self.limits = Some(limits);
        self
    }
}

/// One end-to-end request to generate an application. The top-level unit of
/// orchestration, owned exclusively by the engine behind a per-build lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: Uuid,
    pub owner_id: String,
    pub status: BuildStatus,
    pub mode: BuildMode,
    pub power_tier: PowerTier,
    pub description: String,
    pub agents: HashMap<Uuid, Agent>,
    pub tasks: Vec<Task>,
    pub checkpoints: Vec<Checkpoint>,
    /// 0–100, monotonically non-decreasing except on rollback.
    pub progress: u8,
    pub limits: BuildLimits,
    pub requests_used: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Automatic recovery passes consumed by final-readiness failures.
    pub readiness_recovery_attempts: u32,
    /// Set while the phase scheduler is between phases, so completion checks
    /// do not mistake an empty in-flight window for a finished build.
    pub phased_pipeline_active: bool,
}

impl Build {
    pub fn new(owner_id: impl Into<String>, request: BuildRequest) -> Self {
        let limits = request
            .limits
            .unwrap_or_else(|| BuildLimits::for_mode(request.mode, request.power_tier));
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            status: BuildStatus::Pending,
            mode: request.mode,
            power_tier: request.power_tier,
            description: request.description,
            agents: HashMap::new(),
            tasks: Vec::new(),
            checkpoints: Vec::new(),
            progress: 0,
            limits,
            requests_used: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            readiness_recovery_attempts: 0,
            phased_pipeline_active: false,
        }
    }

    /// Whether the build still accepts work.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Transition the lifecycle status. Refused once terminal; terminal
    /// targets stamp `completed_at`. Returns whether the transition applied.
    pub fn set_status(&mut self, status: BuildStatus) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.touch();
        if status.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
        true
    }

    /// Raise progress, never lowering it. Rollback uses
    /// [`Build::force_progress`] instead.
    pub fn set_progress(&mut self, progress: u8) {
        if progress > self.progress {
            self.progress = progress.min(100);
            self.touch();
        }
    }

    /// Set progress unconditionally. Only rollback may move it backwards.
    pub fn force_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
        self.touch();
    }

    /// Bump the activity timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn add_agent(&mut self, agent: Agent) -> Uuid {
        let id = agent.id;
        self.agents.insert(id, agent);
        self.touch();
        id
    }

    pub fn add_task(&mut self, task: Task) -> Uuid {
        let id = task.id;
        self.tasks.push(task);
        self.touch();
        id
    }

    pub fn task(&self, id: Uuid) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_mut(&mut self, id: Uuid) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// First agent with the given role, if any.
    pub fn agent_by_role(&self, role: AgentRole) -> Option<&Agent> {
        self.agents.values().find(|a| a.role == role)
    }

    /// Number of tasks currently in progress.
    pub fn tasks_in_flight(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .count()
    }
}

/// Live resource counters for the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub builds: usize,
    pub active_builds: usize,
    pub agents: usize,
    pub subscribers: usize,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
