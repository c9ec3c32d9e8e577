//! Running-task metadata scan.
//!
//! Each launched workload drops `<log_id>.json` into the metadata directory
//! and removes it on exit (trap EXIT). The scan turns surviving files into
//! heartbeats; a file whose recorded PID is dead is deleted so the master
//! never revives a run-log for a process that already exited.

use std::path::Path;
use std::process::Command;

use gputasker_protocol::{RunningTaskMeta, TaskHeartbeat};

/// `kill -0` probe for local process liveness.
pub fn pid_alive(pid: i64) -> bool {
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

pub fn collect_running_tasks(dir: &Path) -> Vec<TaskHeartbeat> {
    collect_with_liveness(dir, pid_alive)
}

fn collect_with_liveness(dir: &Path, alive: impl Fn(i64) -> bool) -> Vec<TaskHeartbeat> {
    let mut heartbeats = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return heartbeats;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&content) else {
            continue;
        };
        // Files written by older launch scripts may omit the id field; the
        // file name carries it.
        let meta = match serde_json::from_value::<RunningTaskMeta>(value) {
            Ok(meta) => meta,
            Err(_) => {
                let Some(stem_id) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<i64>().ok())
                else {
                    continue;
                };
                RunningTaskMeta {
                    running_log_id: stem_id,
                    remote_pid: None,
                    remote_pgid: None,
                    timestamp: None,
                }
            }
        };

        if let Some(pid) = meta.remote_pid {
            if pid > 0 && !alive(pid) {
                // The workload exited but its trap never fired (e.g. a
                // SIGKILL); drop the stale file instead of reporting it.
                if let Err(err) = std::fs::remove_file(&path) {
                    log::warn!("failed to remove stale {}: {}", path.display(), err);
                }
                continue;
            }
        }

        heartbeats.push(TaskHeartbeat {
            running_log_id: meta.running_log_id,
            remote_pid: meta.remote_pid,
            remote_pgid: meta.remote_pgid,
        });
    }

    heartbeats
}
