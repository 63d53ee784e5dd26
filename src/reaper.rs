//! Periodic cleanup of idle sessions and finished background commands.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::manager::SandboxManager;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub evicted: usize,
    pub pruned_commands: usize,
}

/// One pass over the registry: handles idle longer than `idle_timeout` are
/// killed remotely (best effort) and evicted; live handles have their
/// finished background commands dropped.
pub async fn sweep(manager: &SandboxManager, idle_timeout: Duration) -> SweepReport {
    let mut report = SweepReport::default();

    for handle in manager.registry().handles().await {
        let idle = handle.idle_for().await;
        if idle > idle_timeout {
            info!(
                session_id = %handle.session_id,
                sandbox_id = %handle.sandbox_id(),
                idle_secs = idle.as_secs(),
                "reaping idle sandbox"
            );
            if manager.evict_idle(&handle).await {
                report.evicted += 1;
            }
            continue;
        }

        match manager.executor().prune_finished(&handle).await {
            Ok(n) => report.pruned_commands += n,
            Err(e) => debug!(
                session_id = %handle.session_id,
                error = %e,
                "could not list processes for pruning"
            ),
        }
    }

    report
}

/// Spawn the reaper loop. The first sweep runs one `every` after start.
pub fn spawn_reaper(
    manager: Arc<SandboxManager>,
    every: Duration,
    idle_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if every.is_zero() {
            warn!("reaper interval is zero, idle reaping disabled");
            return;
        }
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let report = sweep(&manager, idle_timeout).await;
            if report.evicted > 0 || report.pruned_commands > 0 {
                info!(
                    evicted = report.evicted,
                    pruned_commands = report.pruned_commands,
                    "reaper sweep"
                );
            }
        }
    })
}
