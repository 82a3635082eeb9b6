use crate::engine::EngineCore;
use crate::prompts;
use crate::types::{AgentRole, Build, BuildStatus, EventKind, Task};
use foundry_core::EngineResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// An ordered group of roles whose tasks must all reach a terminal state
/// before the next group starts.
pub struct Phase {
    pub name: &'static str,
    pub roles: &'static [AgentRole],
    /// Build status entered when this phase starts, if it changes.
    pub status: Option<BuildStatus>,
}

/// The fixed phase order. Frontend and backend generate in parallel within
/// one phase; phases themselves are serialized so downstream agents always
/// see final upstream output.
pub fn phase_plan() -> &'static [Phase] {
    static PLAN: [Phase; 5] = [
        Phase {
            name: "architecture",
            roles: &[AgentRole::Architect],
            status: Some(BuildStatus::InProgress),
        },
        Phase {
            name: "database schema",
            roles: &[AgentRole::Database],
            status: None,
        },
        Phase {
            name: "code generation",
            roles: &[AgentRole::Frontend, AgentRole::Backend],
            status: None,
        },
        Phase {
            name: "testing",
            roles: &[AgentRole::Testing],
            status: Some(BuildStatus::Testing),
        },
        Phase {
            name: "review",
            roles: &[AgentRole::Reviewer],
            status: Some(BuildStatus::Reviewing),
        },
    ];
    &PLAN
}

/// Agents of the build matching a phase, in the phase's role order.
pub(crate) fn select_phase_agents(build: &Build, phase: &Phase) -> Vec<(Uuid, AgentRole)> {
    let mut selected = Vec::new();
    for &role in phase.roles {
        for agent in build.agents.values().filter(|a| a.role == role) {
            selected.push((agent.id, role));
        }
    }
    selected
}

enum PhaseOutcome {
    Completed,
    BuildTerminal,
    TimedOut,
}

/// Drive the build through the ordered phases. Each phase creates one task
/// per phase agent, dispatches them, and blocks on the polling barrier until
/// every task is terminal. Empty phases are skipped.
pub(crate) async fn run_phased_pipeline(core: Arc<EngineCore>, build_id: Uuid) -> EngineResult<()> {
    let handle = core.registry.get(build_id).await?;
    {
        let mut build = handle.write().await;
        build.phased_pipeline_active = true;
    }

    for phase in phase_plan() {
        let agents = {
            let build = handle.read().await;
            if !build.is_active() {
                break;
            }
            select_phase_agents(&build, phase)
        };
        if agents.is_empty() {
            info!(build_id = %build_id, phase = phase.name, "phase has no agents, skipping");
            continue;
        }

        let task_ids = {
            let mut build = handle.write().await;
            if let Some(status) = phase.status {
                if !build.set_status(status) {
                    break;
                }
            }
            let description = build.description.clone();
            let mut ids = Vec::with_capacity(agents.len());
            for (agent_id, role) in &agents {
                let task = Task::new(
                    build_id,
                    prompts::task_type_for_role(*role),
                    prompts::task_description_for_role(*role, &description),
                )
                .with_priority(prompts::priority_for_role(*role));
                ids.push(build.assign_task(*agent_id, task)?);
            }
            ids
        };

        info!(
            build_id = %build_id,
            phase = phase.name,
            tasks = task_ids.len(),
            "phase started"
        );
        for (task_id, (agent_id, _)) in task_ids.iter().zip(&agents) {
            core.emit(
                EventKind::TaskCreated,
                build_id,
                Some(*agent_id),
                serde_json::json!({ "task_id": task_id, "phase": phase.name }),
            )
            .await;
            core.enqueue_task(build_id, *task_id).await;
        }

        match wait_for_phase(&core, build_id, &task_ids).await? {
            PhaseOutcome::Completed => {
                core.checkpoint(build_id, &format!("after {}", phase.name), "phase complete")
                    .await;
                core.update_progress(build_id).await;
            }
            PhaseOutcome::BuildTerminal => break,
            PhaseOutcome::TimedOut => {
                warn!(build_id = %build_id, phase = phase.name, "phase timed out");
                core.fail_build(
                    build_id,
                    &format!("phase \"{}\" timed out", phase.name),
                    true,
                )
                .await;
                break;
            }
        }
    }

    {
        let mut build = handle.write().await;
        build.phased_pipeline_active = false;
    }
    core.check_build_completion(build_id).await;
    Ok(())
}

/// The barrier: poll task statuses at the configured interval until every
/// phase task is terminal, the build goes terminal, the build's scope is
/// cancelled, or the phase timeout elapses.
async fn wait_for_phase(
    core: &Arc<EngineCore>,
    build_id: Uuid,
    task_ids: &[Uuid],
) -> EngineResult<PhaseOutcome> {
    let handle = core.registry.get(build_id).await?;
    let mut cancel = core.registry.cancel_scope(build_id).await?;
    let deadline = Instant::now() + Duration::from_secs(core.config.phase_timeout_secs);
    let poll = Duration::from_millis(core.config.phase_poll_ms);

    loop {
        {
            let build = handle.read().await;
            if !build.is_active() {
                return Ok(PhaseOutcome::BuildTerminal);
            }
            let all_terminal = task_ids
                .iter()
                .all(|id| build.task(*id).map_or(true, |t| t.status.is_terminal()));
            if all_terminal {
                return Ok(PhaseOutcome::Completed);
            }
        }
        if Instant::now() >= deadline {
            return Ok(PhaseOutcome::TimedOut);
        }
        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = cancel.changed() => return Ok(PhaseOutcome::BuildTerminal),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::{Agent, BuildRequest};
    use foundry_core::ProviderId;

    #[test]
    fn plan_order_and_statuses() {
        let plan = phase_plan();
        let names: Vec<&str> = plan.iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec![
                "architecture",
                "database schema",
                "code generation",
                "testing",
                "review"
            ]
        );
        assert_eq!(plan[3].status, Some(BuildStatus::Testing));
        assert_eq!(plan[4].status, Some(BuildStatus::Reviewing));
    }

    #[test]
    fn code_generation_runs_frontend_and_backend_in_parallel() {
        let plan = phase_plan();
        assert_eq!(plan[2].roles, [AgentRole::Frontend, AgentRole::Backend]);
    }

    #[test]
    fn select_agents_matches_roles_in_order() {
        let mut build = Build::new("o", BuildRequest::new("app"));
        let backend = Agent::new(build.id, AgentRole::Backend, ProviderId::Gpt4);
        let backend_id = backend.id;
        let frontend = Agent::new(build.id, AgentRole::Frontend, ProviderId::Gpt4);
        let frontend_id = frontend.id;
        build.add_agent(backend);
        build.add_agent(frontend);
        build.add_agent(Agent::new(build.id, AgentRole::Lead, ProviderId::Claude));

        let selected = select_phase_agents(&build, &phase_plan()[2]);
        assert_eq!(
            selected,
            vec![
                (frontend_id, AgentRole::Frontend),
                (backend_id, AgentRole::Backend)
            ]
        );
    }

    #[test]
    fn select_agents_empty_when_role_missing() {
        let build = Build::new("o", BuildRequest::new("app"));
        assert!(select_phase_agents(&build, &phase_plan()[0]).is_empty());
    }
}
