use crate::types::{Agent, AgentRole, Build};
use foundry_core::{EngineError, EngineResult, ProviderId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

/// A build plus its cancellation scope, as held by the registry.
pub(crate) struct ManagedBuild {
    pub build: Arc<RwLock<Build>>,
    cancel_tx: watch::Sender<bool>,
}

impl ManagedBuild {
    fn new(build: Build) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            build: Arc::new(RwLock::new(build)),
            cancel_tx,
        }
    }

    /// A receiver on the build's cancellation scope. Tasks select on it.
    pub fn cancel_scope(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Signal every derived task scope to abandon work.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

/// Engine-level registries: builds-by-id and agents-by-id, behind one coarse
/// lock. The lock is held briefly and never across a provider call or a
/// broadcast; per-build state serializes through the build's own lock,
/// always acquired before this one is re-entered (build→global ordering).
pub struct BuildRegistry {
    inner: RwLock<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    builds: HashMap<Uuid, ManagedBuild>,
    /// agent id → owning build id.
    agents: HashMap<Uuid, Uuid>,
}

impl BuildRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Register a build and return its shared handle.
    pub async fn insert(&self, build: Build) -> Arc<RwLock<Build>> {
        let id = build.id;
        let managed = ManagedBuild::new(build);
        let handle = Arc::clone(&managed.build);
        self.inner.write().await.builds.insert(id, managed);
        handle
    }

    /// Shared handle to a build.
    pub async fn get(&self, id: Uuid) -> EngineResult<Arc<RwLock<Build>>> {
        self.inner
            .read()
            .await
            .builds
            .get(&id)
            .map(|m| Arc::clone(&m.build))
            .ok_or(EngineError::BuildNotFound(id))
    }

    /// Cancellation receiver for a build's scope.
    pub async fn cancel_scope(&self, id: Uuid) -> EngineResult<watch::Receiver<bool>> {
        self.inner
            .read()
            .await
            .builds
            .get(&id)
            .map(ManagedBuild::cancel_scope)
            .ok_or(EngineError::BuildNotFound(id))
    }

    /// Signal a build's cancellation scope.
    pub async fn cancel_build_scope(&self, id: Uuid) {
        if let Some(managed) = self.inner.read().await.builds.get(&id) {
            managed.cancel();
        }
    }

    /// Remove a build, cancelling its scope and deregistering its agents.
    /// Returns the build handle for final bookkeeping, if it existed.
    pub async fn remove(&self, id: Uuid) -> Option<Arc<RwLock<Build>>> {
        let mut inner = self.inner.write().await;
        let managed = inner.builds.remove(&id)?;
        managed.cancel();
        inner.agents.retain(|_, build_id| *build_id != id);
        Some(managed.build)
    }

    /// Index an agent under its build.
    pub async fn register_agent(&self, agent_id: Uuid, build_id: Uuid) {
        self.inner.write().await.agents.insert(agent_id, build_id);
    }

    /// Owning build of an agent.
    pub async fn build_for_agent(&self, agent_id: Uuid) -> EngineResult<Uuid> {
        self.inner
            .read()
            .await
            .agents
            .get(&agent_id)
            .copied()
            .ok_or(EngineError::AgentNotFound(agent_id))
    }

    /// Snapshot of all live build ids.
    pub async fn build_ids(&self) -> Vec<Uuid> {
        self.inner.read().await.builds.keys().copied().collect()
    }

    /// Live build and agent counts.
    pub async fn counts(&self) -> (usize, usize) {
        let inner = self.inner.read().await;
        (inner.builds.len(), inner.agents.len())
    }

    /// Allocate an agent under a build and index it globally. Fails when the
    /// build does not exist.
    pub async fn spawn_agent(
        &self,
        build_id: Uuid,
        role: AgentRole,
        provider: ProviderId,
    ) -> EngineResult<Agent> {
        let handle = self.get(build_id).await?;
        let agent = {
            let mut build = handle.write().await;
            if build.agents.len() as u32 >= build.limits.max_agents {
                return Err(EngineError::Config(format!(
                    "agent limit of {} reached for build {build_id}",
                    build.limits.max_agents
                )));
            }
            let agent = Agent::new(build_id, role, provider);
            build.add_agent(agent.clone());
            agent
        };
        self.register_agent(agent.id, build_id).await;
        info!(build_id = %build_id, role = %role, provider = %provider, "agent spawned");
        Ok(agent)
    }

    /// Spawn with linear-delay retries. Single-provider setups get more
    /// attempts because there is no alternative to fall back to; persistent
    /// failure is reported to the caller, which reassigns the role to the
    /// lead agent rather than failing the build.
    pub async fn spawn_agent_with_retries(
        &self,
        build_id: Uuid,
        role: AgentRole,
        provider: ProviderId,
        single_provider: bool,
    ) -> EngineResult<Agent> {
        let attempts: u32 = if single_provider { 3 } else { 1 };
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.spawn_agent(build_id, role, provider).await {
                Ok(agent) => return Ok(agent),
                Err(e) => {
                    warn!(
                        build_id = %build_id,
                        role = %role,
                        attempt,
                        error = %e,
                        "agent spawn failed"
                    );
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(EngineError::BuildNotFound(build_id)))
    }
}

impl Default for BuildRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Pick a capability-ranked lead provider and map each role to a provider.
///
/// Reasoning-heavy roles prefer the top-ranked provider, implementation
/// roles the runner-up, testing the third; every preference falls back to
/// the lead provider when unavailable.
pub fn assign_providers_to_roles(
    available: &[ProviderId],
    roles: &[AgentRole],
) -> HashMap<AgentRole, ProviderId> {
    let mut assignments = HashMap::new();
    let ranked = ProviderId::rank_descending(available.to_vec());
    let Some(&lead) = ranked.first() else {
        return assignments;
    };

    for &role in roles {
        let preferred = if role.is_reasoning() {
            ranked.first()
        } else if role.is_implementation() {
            ranked.get(1)
        } else {
            ranked.get(2)
        };
        assignments.insert(role, preferred.copied().unwrap_or(lead));
    }
    assignments
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::BuildRequest;
    use foundry_core::BuildLimits;

    async fn registry_with_build() -> (BuildRegistry, Uuid) {
        let registry = BuildRegistry::new();
        let build = Build::new("owner", BuildRequest::new("app"));
        let id = build.id;
        registry.insert(build).await;
        (registry, id)
    }

    #[tokio::test]
    async fn insert_and_get() {
        let (registry, id) = registry_with_build().await;
        assert!(registry.get(id).await.is_ok());
        assert!(matches!(
            registry.get(Uuid::new_v4()).await,
            Err(EngineError::BuildNotFound(_))
        ));
    }

    #[tokio::test]
    async fn spawn_registers_agent_globally() {
        let (registry, build_id) = registry_with_build().await;
        let agent = registry
            .spawn_agent(build_id, AgentRole::Backend, ProviderId::Gpt4)
            .await
            .unwrap();
        assert_eq!(registry.build_for_agent(agent.id).await.unwrap(), build_id);
        let build = registry.get(build_id).await.unwrap();
        assert!(build.read().await.agents.contains_key(&agent.id));
    }

    #[tokio::test]
    async fn spawn_fails_for_missing_build() {
        let registry = BuildRegistry::new();
        let err = registry
            .spawn_agent(Uuid::new_v4(), AgentRole::Lead, ProviderId::Claude)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BuildNotFound(_)));
    }

    #[tokio::test]
    async fn spawn_respects_agent_limit() {
        let registry = BuildRegistry::new();
        let limits = BuildLimits {
            max_agents: 1,
            max_retries: 1,
            max_requests: 10,
            max_tokens: 1_000,
        };
        let build = Build::new("o", BuildRequest::new("x").with_limits(limits));
        let build_id = build.id;
        registry.insert(build).await;

        registry
            .spawn_agent(build_id, AgentRole::Lead, ProviderId::Claude)
            .await
            .unwrap();
        assert!(registry
            .spawn_agent(build_id, AgentRole::Backend, ProviderId::Gpt4)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn remove_cancels_and_deregisters() {
        let (registry, build_id) = registry_with_build().await;
        let agent = registry
            .spawn_agent(build_id, AgentRole::Backend, ProviderId::Gpt4)
            .await
            .unwrap();
        let mut scope = registry.cancel_scope(build_id).await.unwrap();

        assert!(registry.remove(build_id).await.is_some());
        assert!(*scope.borrow_and_update());
        assert!(registry.build_for_agent(agent.id).await.is_err());
        assert!(registry.get(build_id).await.is_err());
    }

    #[tokio::test]
    async fn cancel_scope_observed_by_receivers() {
        let (registry, build_id) = registry_with_build().await;
        let mut scope = registry.cancel_scope(build_id).await.unwrap();
        assert!(!*scope.borrow());
        registry.cancel_build_scope(build_id).await;
        scope.changed().await.unwrap();
        assert!(*scope.borrow());
    }

    #[test]
    fn role_affinity_with_full_provider_set() {
        let available = vec![
            ProviderId::Ollama,
            ProviderId::Gemini,
            ProviderId::Claude,
            ProviderId::Gpt4,
        ];
        let roles = [
            AgentRole::Architect,
            AgentRole::Backend,
            AgentRole::Testing,
            AgentRole::Reviewer,
        ];
        let assignments = assign_providers_to_roles(&available, &roles);
        assert_eq!(assignments[&AgentRole::Architect], ProviderId::Claude);
        assert_eq!(assignments[&AgentRole::Reviewer], ProviderId::Claude);
        assert_eq!(assignments[&AgentRole::Backend], ProviderId::Gpt4);
        assert_eq!(assignments[&AgentRole::Testing], ProviderId::Gemini);
    }

    #[test]
    fn role_affinity_falls_back_to_lead() {
        let available = vec![ProviderId::Gemini];
        let roles = [AgentRole::Architect, AgentRole::Backend, AgentRole::Testing];
        let assignments = assign_providers_to_roles(&available, &roles);
        for role in roles {
            assert_eq!(assignments[&role], ProviderId::Gemini);
        }
    }

    #[test]
    fn no_providers_no_assignments() {
        let assignments = assign_providers_to_roles(&[], &[AgentRole::Backend]);
        assert!(assignments.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_with_retries_exhausts_single_provider_attempts() {
        let registry = BuildRegistry::new();
        let limits = BuildLimits {
            max_agents: 1,
            max_retries: 1,
            max_requests: 10,
            max_tokens: 1_000,
        };
        let build = Build::new("o", BuildRequest::new("x").with_limits(limits));
        let build_id = build.id;
        registry.insert(build).await;
        registry
            .spawn_agent(build_id, AgentRole::Lead, ProviderId::Claude)
            .await
            .unwrap();

        // The agent limit rejects every attempt; the retry loop sleeps
        // between them and surfaces the last error.
        let err = registry
            .spawn_agent_with_retries(build_id, AgentRole::Backend, ProviderId::Gpt4, true)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[tokio::test]
    async fn spawn_with_retries_surfaces_last_error() {
        let registry = BuildRegistry::new();
        let err = registry
            .spawn_agent_with_retries(Uuid::new_v4(), AgentRole::Backend, ProviderId::Gpt4, false)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BuildNotFound(_)));
    }
}
