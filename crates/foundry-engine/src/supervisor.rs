use crate::engine::EngineCore;
use crate::types::EventKind;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Periodic eviction sweep. Runs until the engine's root scope is cancelled.
pub(crate) async fn run_cleanup_loop(core: Arc<EngineCore>, mut root: watch::Receiver<bool>) {
    let mut ticker =
        tokio::time::interval(Duration::from_secs(core.config.cleanup_interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; skip it.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = sweep_builds(&core).await;
                let stale = core.hub.remove_stale().await;
                if evicted > 0 || stale > 0 {
                    info!(evicted, stale_subscribers = stale, "cleanup sweep");
                }
            }
            _ = root.changed() => break,
        }
    }
    debug!("cleanup supervisor stopped");
}

/// One eviction pass over the registry. Returns how many builds were
/// removed.
///
/// Terminal builds are evicted after their TTL, or after the shorter grace
/// period once nothing is in flight. Non-terminal builds are evicted only
/// when abandoned: no subscribers and no state change for the inactive TTL.
pub(crate) async fn sweep_builds(core: &Arc<EngineCore>) -> usize {
    let now = Utc::now();
    let age = |t: DateTime<Utc>| u64::try_from((now - t).num_seconds()).unwrap_or(0);
    let mut evicted = 0;

    for id in core.registry.build_ids().await {
        let Ok(handle) = core.registry.get(id).await else {
            continue;
        };
        let subscribers = core.hub.subscriber_count(id).await;
        let should_evict = {
            let build = handle.read().await;
            if build.status.is_terminal() {
                let since_end = build.completed_at.map_or_else(|| age(build.updated_at), age);
                since_end >= core.config.build_ttl_secs
                    || (build.tasks_in_flight() == 0
                        && since_end >= core.config.terminal_grace_secs)
            } else {
                subscribers == 0 && age(build.updated_at) >= core.config.inactive_build_ttl_secs
            }
        };
        if should_evict && core.evict_build(id).await {
            evicted += 1;
        }
    }
    evicted
}

/// Fail a build that outlives its mode's overall timeout. Returns early
/// when the build's scope is cancelled first.
pub(crate) async fn watch_build_timeout(core: Arc<EngineCore>, build_id: Uuid) {
    let Ok(handle) = core.registry.get(build_id).await else {
        return;
    };
    let mode = handle.read().await.mode;
    let Ok(mut cancel) = core.registry.cancel_scope(build_id).await else {
        return;
    };

    tokio::select! {
        _ = tokio::time::sleep(core.config.build_timeout(mode)) => {}
        _ = cancel.changed() => return,
    }

    let still_active = match core.registry.get(build_id).await {
        Ok(handle) => handle.read().await.is_active(),
        Err(_) => false,
    };
    if still_active {
        warn!(build_id = %build_id, mode = %mode, "build timeout exceeded");
        core.fail_build(build_id, "Build timeout exceeded", true)
            .await;
    }
}

/// Emit inactivity warnings for a build that stops making progress. The
/// monitor only warns; it never terminates the build, and it goes quiet
/// after the configured number of warnings.
pub(crate) async fn monitor_inactivity(core: Arc<EngineCore>, build_id: Uuid) {
    let Ok(mut cancel) = core.registry.cancel_scope(build_id).await else {
        return;
    };
    let check = Duration::from_secs(core.config.inactivity_check_secs);
    let mut warnings = 0u32;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(check) => {}
            _ = cancel.changed() => return,
        }
        let Ok(handle) = core.registry.get(build_id).await else {
            return;
        };
        let idle_secs = {
            let build = handle.read().await;
            if !build.is_active() {
                return;
            }
            (Utc::now() - build.updated_at).num_seconds()
        };
        if idle_secs >= i64::try_from(core.config.inactivity_threshold_secs).unwrap_or(i64::MAX) {
            warnings += 1;
            warn!(build_id = %build_id, idle_secs, warnings, "build inactive");
            core.emit(
                EventKind::InactivityWarning,
                build_id,
                None,
                serde_json::json!({ "idle_secs": idle_secs, "warning": warnings }),
            )
            .await;
            if warnings >= core.config.max_inactivity_warnings {
                return;
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
