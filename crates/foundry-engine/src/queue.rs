use crate::types::{AgentStatus, Build, Task, TaskOutput, TaskStatus};
use chrono::Utc;
use foundry_core::{EngineError, EngineResult};
use uuid::Uuid;

/// Task queue and guardrail operations on a build.
///
/// All methods assume the caller holds the build's write lock; none of them
/// touch engine-level registries.
impl Build {
    /// Attach a task to an agent and queue it. Fails with `BuildNotActive`
    /// once the build is terminal and `AgentNotFound` for unknown agents.
    pub fn assign_task(&mut self, agent_id: Uuid, mut task: Task) -> EngineResult<Uuid> {
        if !self.is_active() {
            return Err(EngineError::BuildNotActive(self.id));
        }
        let agent = self
            .agents
            .get_mut(&agent_id)
            .ok_or(EngineError::AgentNotFound(agent_id))?;

        task.assigned_to = Some(agent_id);
        task.max_retries = self.limits.max_retries;
        agent.current_task = Some(task.id);
        agent.status = AgentStatus::Working;
        Ok(self.add_task(task))
    }

    /// Highest-priority pending task, creation time breaking ties.
    pub fn next_pending_task(&self) -> Option<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
            })
    }

    /// Move a pending task to in-progress. Returns false for unknown ids and
    /// tasks not in a runnable state.
    pub fn mark_task_in_progress(&mut self, id: Uuid) -> bool {
        match self.task_mut(id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::InProgress;
                self.touch();
                true
            }
            _ => false,
        }
    }

    /// Complete a task with its parsed output and release its agent.
    pub fn mark_task_completed(&mut self, id: Uuid, output: TaskOutput) -> bool {
        let Some(task) = self.task_mut(id) else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }
        task.status = TaskStatus::Completed;
        task.output = Some(output);
        task.completed_at = Some(Utc::now());
        let agent_id = task.assigned_to;
        self.release_agent(agent_id, AgentStatus::Idle, None);
        self.touch();
        true
    }

    /// Fail a task and mark its agent errored.
    pub fn mark_task_failed(&mut self, id: Uuid, error: impl Into<String>) -> bool {
        let error = error.into();
        let Some(task) = self.task_mut(id) else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }
        task.status = TaskStatus::Failed;
        task.completed_at = Some(Utc::now());
        let agent_id = task.assigned_to;
        self.release_agent(agent_id, AgentStatus::Error, Some(error));
        self.touch();
        true
    }

    /// Requeue a task for another attempt, bumping its retry counter.
    pub fn requeue_task(&mut self, id: Uuid) -> bool {
        match self.task_mut(id) {
            Some(task) if task.status == TaskStatus::InProgress => {
                task.status = TaskStatus::Pending;
                task.retry_count += 1;
                self.touch();
                true
            }
            _ => false,
        }
    }

    /// Cancel every pending task. Returns how many were cancelled.
    pub fn cancel_pending_tasks(&mut self) -> usize {
        let now = Utc::now();
        let mut cancelled = 0;
        for task in &mut self.tasks {
            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::Cancelled;
                task.completed_at = Some(now);
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            self.touch();
        }
        cancelled
    }

    /// Consume one unit of the request budget. A breach is fatal for the
    /// build; the caller fails it and cancels pending work.
    pub fn try_consume_request(&mut self) -> EngineResult<()> {
        if self.requests_used >= self.limits.max_requests {
            return Err(EngineError::BudgetExceeded(format!(
                "request budget of {} exhausted",
                self.limits.max_requests
            )));
        }
        self.requests_used += 1;
        self.touch();
        Ok(())
    }

    /// Whether every task has reached a terminal state.
    pub fn all_tasks_terminal(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }

    /// Completed tasks, oldest first.
    pub fn completed_tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
    }

    fn release_agent(&mut self, agent_id: Option<Uuid>, status: AgentStatus, error: Option<String>) {
        if let Some(agent) = agent_id.and_then(|id| self.agents.get_mut(&id)) {
            agent.current_task = None;
            agent.status = status;
            agent.error = error;
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
