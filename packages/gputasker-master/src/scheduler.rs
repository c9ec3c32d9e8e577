//! The driver loop. Each tick: refresh settings from the environment,
//! sweep stale heartbeats into LOST, recycle legacy states, then claim
//! READY tasks under the `dispatching_at` lease and spawn one supervisor
//! per claim. Task errors never take the loop down.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{GpuUpdateMode, MasterConfig};
use crate::notify::Notifier;
use crate::store::Store;
use crate::supervisor;

pub async fn run(store: Arc<Store>, notifier: Notifier) {
    let mut warned_ssh_mode = false;
    loop {
        let tick_start = Instant::now();
        // Settings and credentials are re-read every tick so they can be
        // rotated without restarting the master.
        let config = MasterConfig::from_env();

        if let Err(err) = tick(&store, &notifier, &config, &mut warned_ssh_mode).await {
            log::error!("scheduler tick failed: {:#}", err);
        }

        let elapsed = tick_start.elapsed();
        let interval = Duration::from_secs(config.loop_interval_seconds);
        if elapsed < interval {
            tokio::time::sleep(interval - elapsed).await;
        }
    }
}

async fn tick(
    store: &Arc<Store>,
    notifier: &Notifier,
    config: &MasterConfig,
    warned_ssh_mode: &mut bool,
) -> anyhow::Result<()> {
    let now = Utc::now();

    match store.mark_stale_running_tasks_as_lost(now, config.heartbeat_stale_seconds) {
        Ok(0) => {}
        Ok(marked) => log::warn!("⚠️  marked {} run log(s) as lost", marked),
        Err(err) => log::error!("loss sweep failed: {:#}", err),
    }

    if config.gpu_update_mode == GpuUpdateMode::Ssh && !*warned_ssh_mode {
        log::warn!(
            "GPUTASKER_GPU_UPDATE_MODE=ssh is a legacy mode without a poller; \
             GPU state only refreshes from agent reports"
        );
        *warned_ssh_mode = true;
    }

    // Legacy cleanup: recycle tasks stranded at the obsolete SCHEDULING state.
    match store.reset_legacy_scheduling() {
        Ok(0) => {}
        Ok(recycled) => log::info!("♻️  recycled {} legacy scheduling task(s)", recycled),
        Err(err) => log::error!("legacy cleanup failed: {:#}", err),
    }

    let stale_before = now - ChronoDuration::seconds(config.claim_stale_seconds);
    let task_ids = store.ready_task_ids(stale_before)?;
    if !task_ids.is_empty() {
        log::info!("📋 {} task(s) eligible for dispatch", task_ids.len());
    }

    for task_id in task_ids {
        let claimed = match store.claim_task(task_id, stale_before, now) {
            Ok(claimed) => claimed,
            Err(err) => {
                log::error!("claim of task {} failed: {:#}", task_id, err);
                continue;
            }
        };
        if !claimed {
            continue;
        }
        log::info!("🎯 claimed task {}, spawning supervisor", task_id);
        tokio::spawn(supervisor::run_task(
            store.clone(),
            notifier.clone(),
            config.clone(),
            task_id,
        ));
        // Smear SSH and store load across the tick.
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    Ok(())
}
