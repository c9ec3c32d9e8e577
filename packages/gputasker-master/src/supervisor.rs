//! Per-task supervisor: places a claimed task on a node, locks GPUs,
//! launches the remote process group and blocks until it exits, then
//! reconciles terminal state. One supervisor runs per in-flight task.

use anyhow::{Context, Result};
use chrono::Utc;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use crate::config::MasterConfig;
use crate::models::{Node, RunLog, RunLogStatus, Task, TaskStatus};
use crate::notify::{Notifier, TaskEvent};
use crate::remote::{self, RemoteGroup, SshTarget};
use crate::store::Store;

/// Sanitize a task name for use in a log file name: keep
/// `[0-9A-Za-z._-]`, collapse everything else into single underscores.
pub fn safe_filename(name: &str, limit: usize) -> String {
    let mut out = String::new();
    let mut last_was_sub = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
            out.push(c);
            last_was_sub = false;
        } else if !last_was_sub {
            out.push('_');
            last_was_sub = true;
        }
    }
    let trimmed = out.trim_matches(|c| matches!(c, '.' | '_' | '-'));
    let base = if trimmed.is_empty() { "task" } else { trimmed };
    base.chars().take(limit).collect()
}

/// Entry point spawned by the scheduler per claimed task. Never panics the
/// driver; every failure is contained and logged here.
pub async fn run_task(store: Arc<Store>, notifier: Notifier, config: MasterConfig, task_id: i64) {
    if let Err(err) = dispatch(&store, &notifier, &config, task_id).await {
        log::error!("❌ supervisor for task {} failed: {:#}", task_id, err);
    }
}

async fn dispatch(
    store: &Arc<Store>,
    notifier: &Notifier,
    config: &MasterConfig,
    task_id: i64,
) -> Result<()> {
    // Reload inside the worker; the claim snapshot may be stale.
    let task = match store.task_by_id(task_id)? {
        Some(task) => task,
        None => return Ok(()),
    };
    if task.status != TaskStatus::Ready.as_i64() {
        store.clear_claim(task_id)?;
        return Ok(());
    }

    let placement = match place(store, config, &task).await {
        Ok(placement) => placement,
        Err(err) => {
            // Selection failed outright; drop the claim so the task is not
            // stuck leased until expiry.
            store.clear_claim_if_ready(task_id)?;
            return Err(err);
        }
    };
    let Some((node, gpus, run_log)) = placement else {
        // No eligible node this round: stay READY, release the lease.
        store.clear_claim_if_ready(task_id)?;
        return Ok(());
    };

    let result = execute(store, notifier, config, &task, &node, &gpus, &run_log).await;
    if let Err(err) = &result {
        log::error!("❌ task {}-{} errored: {:#}", task.id, task.name, err);
        store.clear_claim_if_ready(task.id)?;
        store.set_run_log_status_if(run_log.id, RunLogStatus::Running, RunLogStatus::Failed)?;
        store.set_task_status_if(task.id, TaskStatus::Running, TaskStatus::Failed)?;
        append_to_log(&run_log.log_file_path, &format!("\n{err:#}\n"));
    }
    // Reservations are released on every exit path, under our log id.
    if let Err(err) = store.release_gpus(node.id, &gpus, Some(run_log.id)) {
        log::error!("failed to release gpus for log {}: {:#}", run_log.id, err);
    }
    result
}

/// Walk candidate nodes, pick GPUs and atomically lock them under a fresh
/// run-log. A partial lock is restored under the same log id and the next
/// candidate is tried.
async fn place(
    store: &Arc<Store>,
    config: &MasterConfig,
    task: &Task,
) -> Result<Option<(Node, Vec<u32>, RunLog)>> {
    let candidates: Vec<Node> = match task.assign_node_id {
        Some(node_id) => store.node_by_id(node_id)?.into_iter().collect(),
        None => store.list_nodes()?,
    };

    let now = Utc::now();
    let index = store.run_logs_for_task(task.id)?.len();

    for node in candidates {
        let Some(available) =
            store.available_gpu_indices(&node, task, now, config.node_stale_seconds)?
        else {
            continue;
        };
        let chosen: Vec<u32> = available
            .into_iter()
            .take(task.gpu_count as usize)
            .collect();

        let log_file_path = config.running_log_dir.join(format!(
            "{}_{}_{}_{}_{}.log",
            task.id,
            safe_filename(&task.name, 80),
            node.address,
            index,
            Utc::now().timestamp(),
        ));
        let run_log = store.create_run_log(
            task.id,
            node.id,
            &chosen,
            &log_file_path.to_string_lossy(),
        )?;

        let locked = store.try_lock_gpus(node.id, &chosen, run_log.id)?;
        if locked == chosen.len() {
            return Ok(Some((node, chosen, run_log)));
        }

        // Partial lock: restore only rows held under our id, drop the
        // tentative run-log, move on.
        if let Err(err) = store.release_gpus(node.id, &chosen, Some(run_log.id)) {
            log::error!("failed to restore partial lock on {}: {:#}", node.display(), err);
        }
        store.delete_run_log(run_log.id)?;
    }
    Ok(None)
}

async fn execute(
    store: &Arc<Store>,
    notifier: &Notifier,
    config: &MasterConfig,
    task: &Task,
    node: &Node,
    gpus: &[u32],
    run_log: &RunLog,
) -> Result<()> {
    // Only the claim winner moves READY → RUNNING.
    if !store.start_task(task.id)? {
        log::warn!("task {} was taken by another actor, backing off", task.id);
        store.set_run_log_status_if(run_log.id, RunLogStatus::Running, RunLogStatus::Failed)?;
        return Ok(());
    }

    let target = SshTarget::for_node(config, node);
    let mut group = RemoteGroup::launch(
        &target,
        gpus,
        &task.cmd,
        &task.workspace,
        Path::new(&run_log.log_file_path),
        run_log.id,
    )
    .await
    .context("remote launch failed")?;

    let (remote_pid, remote_pgid) = group.read_marker_and_stream(config.ssh_timeout).await;
    let local_pid = group.local_pid();
    store.record_run_log_launch(run_log.id, local_pid, remote_pid, remote_pgid, Utc::now())?;
    log::info!(
        "🚀 task {}-{} running on {} gpus=[{}] ssh_pid={} remote_pid={} remote_pgid={}",
        task.id,
        task.name,
        node.display(),
        run_log.gpus,
        local_pid,
        remote_pid.map_or("-".into(), |p| p.to_string()),
        remote_pgid.map_or("-".into(), |p| p.to_string()),
    );

    notifier.emit(TaskEvent::TaskStarted {
        task_id: task.id,
        task_name: task.name.clone(),
        run_log_id: run_log.id,
        node: node.display(),
        gpus: run_log.gpus.clone(),
        timestamp: Utc::now(),
    });

    let exit_code = group.wait().await.context("wait on remote process failed")?;
    log::info!(
        "🏁 task {}-{} stopped, exit code {}",
        task.id,
        task.name,
        exit_code
    );

    // Terminal writes are compare-and-sets from RUNNING so they never
    // clobber a kill or a loss transition that won the race.
    let log_outcome = if exit_code == 0 {
        RunLogStatus::Done
    } else {
        RunLogStatus::Failed
    };
    store.set_run_log_status_if(run_log.id, RunLogStatus::Running, log_outcome)?;
    let task_outcome = if exit_code == 0 {
        TaskStatus::Done
    } else {
        TaskStatus::Failed
    };
    store.set_task_status_if(task.id, TaskStatus::Running, task_outcome)?;

    let event = if exit_code == 0 {
        TaskEvent::TaskFinished {
            task_id: task.id,
            task_name: task.name.clone(),
            run_log_id: run_log.id,
            exit_code,
            timestamp: Utc::now(),
        }
    } else {
        TaskEvent::TaskFailed {
            task_id: task.id,
            task_name: task.name.clone(),
            run_log_id: run_log.id,
            exit_code,
            timestamp: Utc::now(),
        }
    };
    notifier.emit(event);
    Ok(())
}

fn append_to_log(path: &str, text: &str) {
    if path.is_empty() {
        return;
    }
    let opened = std::fs::OpenOptions::new().create(true).append(true).open(path);
    match opened {
        Ok(mut file) => {
            let _ = file.write_all(text.as_bytes());
        }
        Err(err) => log::error!("failed to append to {}: {}", path, err),
    }
}

// ===== Kill path =====

/// Terminate a RUNNING or LOST run-log: TERM then KILL against the remote
/// process group, falling back to the remote PID, falling back to the local
/// SSH supervisor PID. Every step is best-effort; afterwards the run-log is
/// FAILED, the task is FAILED if it was still RUNNING, and GPUs are
/// released under the log id.
pub async fn kill_run_log(store: &Store, config: &MasterConfig, log_id: i64) -> Result<()> {
    let Some(run_log) = store.run_log_by_id(log_id)? else {
        return Ok(());
    };
    let status = RunLogStatus::from_i64(run_log.status);
    if !matches!(status, Some(RunLogStatus::Running) | Some(RunLogStatus::Lost)) {
        return Ok(());
    }

    let node = match run_log.node_id {
        Some(node_id) => store.node_by_id(node_id)?,
        None => None,
    };

    match (&node, run_log.remote_pgid, run_log.remote_pid) {
        (Some(node), Some(pgid), _) => {
            let target = SshTarget::for_node(config, node);
            log::info!("🛑 killing process group {} on {}", pgid, node.display());
            if let Err(err) = remote::kill_remote_group(&target, pgid).await {
                log::error!("remote group kill failed: {:#}", err);
            }
        }
        (Some(node), None, Some(pid)) => {
            let target = SshTarget::for_node(config, node);
            log::info!("🛑 killing remote pid {} on {}", pid, node.display());
            if let Err(err) = remote::kill_remote_pid(&target, pid).await {
                log::error!("remote pid kill failed: {:#}", err);
            }
        }
        _ => {
            // Last resort: kill the local SSH supervisor. The remote side
            // may be orphaned.
            if run_log.pid > 0 {
                log::warn!("🛑 no remote pid/pgid for log {}, killing local ssh pid {}", log_id, run_log.pid);
                let _ = std::process::Command::new("kill")
                    .arg("-KILL")
                    .arg(run_log.pid.to_string())
                    .status();
            }
        }
    }

    store.set_run_log_status(log_id, RunLogStatus::Failed)?;
    store.set_task_status_if(run_log.task_id, TaskStatus::Running, TaskStatus::Failed)?;
    if let Some(node_id) = run_log.node_id {
        let gpus = run_log.gpu_indices();
        if !gpus.is_empty() {
            store.release_gpus(node_id, &gpus, Some(log_id))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_filename_collapses_and_trims() {
        assert_eq!(safe_filename("train resnet/50!", 80), "train_resnet_50");
        assert_eq!(safe_filename("..hidden..", 80), "hidden");
        assert_eq!(safe_filename("///", 80), "task");
        assert_eq!(safe_filename("", 80), "task");
        assert_eq!(safe_filename("abcdef", 3), "abc");
        assert_eq!(safe_filename("v1.2-final_run", 80), "v1.2-final_run");
    }
}
