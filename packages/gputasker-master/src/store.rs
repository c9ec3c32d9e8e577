//! Transactional persistence for nodes, GPUs, tasks and run-logs.
//!
//! One SQLite file, connection per call. Every concurrent-sensitive write is
//! a single guarded `UPDATE`, so the atomic primitives (`claim_task`,
//! `try_lock_gpus`, `release_gpus`, the status compare-and-sets) are
//! serializable under SQLite's own locking.

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::RngCore;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};

use crate::models::{format_gpu_list, Gpu, Node, RunLog, RunLogStatus, Task, TaskStatus};
use gputasker_protocol::{GpuSample, TaskHeartbeat};

pub struct Store {
    path: PathBuf,
}

/// Fields for a new task submission.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub name: String,
    pub owner: String,
    pub workspace: String,
    pub cmd: String,
    pub gpu_count: u32,
    pub exclusive: bool,
    pub min_memory_mib: u64,
    pub max_used_utilization: u32,
    pub assign_node_id: Option<i64>,
    pub priority: i64,
    pub ready: bool,
}

/// Outcome of folding one task heartbeat into the store.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeartbeatApplied {
    pub updated: bool,
    pub revived: bool,
}

/// Timestamps are persisted as fixed-width UTC RFC 3339 text so that SQL
/// string comparison equals chronological comparison.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Normalize command text: LF line endings, exactly one trailing newline.
pub fn normalize_cmd(cmd: &str) -> String {
    let mut normalized = cmd.replace("\r\n", "\n");
    if !normalized.is_empty() && !normalized.ends_with('\n') {
        normalized.push('\n');
    }
    normalized
}

fn generate_report_token() -> String {
    let mut raw = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            path: path.as_ref().to_path_buf(),
        };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).context("failed to open store database")?;
        conn.execute_batch(
            "PRAGMA busy_timeout=10000;
             PRAGMA foreign_keys=ON;",
        )?;
        Ok(conn)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS nodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                address TEXT NOT NULL,
                ssh_port INTEGER NOT NULL DEFAULT 22,
                hostname TEXT,
                report_token TEXT NOT NULL UNIQUE,
                can_schedule INTEGER NOT NULL DEFAULT 1,
                valid INTEGER NOT NULL DEFAULT 1,
                last_report_at TEXT,
                UNIQUE(address, ssh_port)
            );

            CREATE TABLE IF NOT EXISTS gpus (
                uuid TEXT PRIMARY KEY,
                node_id INTEGER NOT NULL REFERENCES nodes(id) ON DELETE CASCADE,
                idx INTEGER NOT NULL,
                name TEXT NOT NULL DEFAULT '',
                utilization INTEGER NOT NULL DEFAULT 0,
                memory_total INTEGER NOT NULL DEFAULT 0,
                memory_used INTEGER NOT NULL DEFAULT 0,
                processes TEXT NOT NULL DEFAULT '',
                busy_by_self INTEGER NOT NULL DEFAULT 0,
                busy_by_log_id INTEGER,
                free INTEGER NOT NULL DEFAULT 0,
                update_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                owner TEXT NOT NULL DEFAULT '',
                workspace TEXT NOT NULL DEFAULT '~',
                cmd TEXT NOT NULL,
                gpu_count INTEGER NOT NULL DEFAULT 1,
                exclusive INTEGER NOT NULL DEFAULT 0,
                min_memory_mib INTEGER NOT NULL DEFAULT 0,
                max_used_utilization INTEGER NOT NULL DEFAULT 0,
                assign_node_id INTEGER REFERENCES nodes(id) ON DELETE SET NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                status INTEGER NOT NULL DEFAULT 0,
                dispatching_at TEXT,
                create_at TEXT NOT NULL,
                update_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS run_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                idx INTEGER NOT NULL,
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                node_id INTEGER REFERENCES nodes(id) ON DELETE SET NULL,
                pid INTEGER NOT NULL DEFAULT -1,
                remote_pid INTEGER,
                remote_pgid INTEGER,
                gpus TEXT NOT NULL DEFAULT '',
                log_file_path TEXT NOT NULL DEFAULT '',
                remark TEXT NOT NULL DEFAULT '',
                status INTEGER NOT NULL DEFAULT 1,
                last_heartbeat_at TEXT,
                start_at TEXT NOT NULL,
                update_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_run_logs_status ON run_logs(status);
            CREATE INDEX IF NOT EXISTS idx_run_logs_task ON run_logs(task_id);
            CREATE INDEX IF NOT EXISTS idx_gpus_node ON gpus(node_id);
            COMMIT;",
        )?;
        Ok(())
    }

    // ===== Nodes =====

    pub fn create_node(&self, address: &str, ssh_port: u16) -> Result<Node> {
        let conn = self.conn()?;
        let token = generate_report_token();
        conn.execute(
            "INSERT INTO nodes (address, ssh_port, report_token) VALUES (?1, ?2, ?3)",
            params![address, ssh_port, token],
        )?;
        let id = conn.last_insert_rowid();
        self.node_by_id(id)?
            .ok_or_else(|| anyhow::anyhow!("node {} vanished after insert", id))
    }

    pub fn node_by_id(&self, id: i64) -> Result<Option<Node>> {
        let conn = self.conn()?;
        let node = conn
            .query_row("SELECT * FROM nodes WHERE id = ?1", params![id], row_to_node)
            .optional()?;
        Ok(node)
    }

    pub fn node_by_token(&self, token: &str) -> Result<Option<Node>> {
        let conn = self.conn()?;
        let node = conn
            .query_row(
                "SELECT * FROM nodes WHERE report_token = ?1",
                params![token],
                row_to_node,
            )
            .optional()?;
        Ok(node)
    }

    pub fn node_by_address(&self, address: &str) -> Result<Option<Node>> {
        let conn = self.conn()?;
        let node = conn
            .query_row(
                "SELECT * FROM nodes WHERE address = ?1 ORDER BY id LIMIT 1",
                params![address],
                row_to_node,
            )
            .optional()?;
        Ok(node)
    }

    pub fn list_nodes(&self) -> Result<Vec<Node>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM nodes ORDER BY address, ssh_port")?;
        let nodes = stmt
            .query_map([], row_to_node)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(nodes)
    }

    pub fn set_node_hostname(&self, id: i64, hostname: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE nodes SET hostname = ?1 WHERE id = ?2",
            params![hostname, id],
        )?;
        Ok(())
    }

    /// Operator switch: a disabled node keeps reporting but receives no
    /// placements.
    pub fn set_node_can_schedule(&self, id: i64, can_schedule: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE nodes SET can_schedule = ?1 WHERE id = ?2",
            params![can_schedule, id],
        )?;
        Ok(())
    }

    /// Record that a node reported: refreshes liveness and marks it valid.
    pub fn touch_node_report(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE nodes SET valid = 1, last_report_at = ?1 WHERE id = ?2",
            params![ts(now), id],
        )?;
        Ok(())
    }

    // ===== GPUs =====

    /// Upsert one reported GPU by UUID, re-binding it to the reporting node.
    /// Reservation fields (`busy_by_self`, `busy_by_log_id`) are never
    /// touched by reports.
    pub fn apply_gpu_sample(&self, node_id: i64, sample: &GpuSample, now: DateTime<Utc>) -> Result<()> {
        let processes = sample
            .processes
            .iter()
            .filter_map(|p| serde_json::to_string(p).ok())
            .collect::<Vec<_>>()
            .join("\n");
        let free = sample.processes.is_empty();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO gpus (uuid, node_id, idx, name, utilization, memory_total, memory_used, processes, free, update_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(uuid) DO UPDATE SET
                node_id = excluded.node_id,
                idx = excluded.idx,
                name = excluded.name,
                utilization = excluded.utilization,
                memory_total = excluded.memory_total,
                memory_used = excluded.memory_used,
                processes = excluded.processes,
                free = excluded.free,
                update_at = excluded.update_at",
            params![
                sample.uuid,
                node_id,
                sample.index,
                sample.name,
                sample.utilization,
                sample.memory_total as i64,
                sample.memory_used as i64,
                processes,
                free,
                ts(now),
            ],
        )?;
        Ok(())
    }

    pub fn gpus_for_node(&self, node_id: i64) -> Result<Vec<Gpu>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM gpus WHERE node_id = ?1 ORDER BY idx")?;
        let gpus = stmt
            .query_map(params![node_id], row_to_gpu)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(gpus)
    }

    /// GPU indices on `node` that satisfy the task's requirements, or `None`
    /// when the node is not eligible or has too few qualifying devices.
    pub fn available_gpu_indices(
        &self,
        node: &Node,
        task: &Task,
        now: DateTime<Utc>,
        node_stale_seconds: i64,
    ) -> Result<Option<Vec<u32>>> {
        if !node.can_schedule || !node.is_reporting_alive(now, node_stale_seconds) {
            return Ok(None);
        }
        let conn = self.conn()?;
        let sql = if task.exclusive {
            "SELECT idx FROM gpus WHERE node_id = ?1 AND busy_by_self = 0 AND free = 1 ORDER BY idx"
        } else {
            "SELECT idx FROM gpus WHERE node_id = ?1 AND busy_by_self = 0
               AND (memory_total - memory_used) >= ?2
               AND (100 - utilization) >= ?3
             ORDER BY idx"
        };
        let mut stmt = conn.prepare(sql)?;
        let indices: Vec<u32> = if task.exclusive {
            stmt.query_map(params![node.id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?
        } else {
            stmt.query_map(
                params![node.id, task.min_memory_mib as i64, task.max_used_utilization],
                |row| row.get(0),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };
        if indices.len() >= task.gpu_count as usize {
            Ok(Some(indices))
        } else {
            Ok(None)
        }
    }

    /// Atomically mark the listed GPUs busy under `log_id`. Only rows that
    /// are currently unreserved flip; the caller compares the returned count
    /// against the request size and releases under the same `log_id` on a
    /// partial lock.
    pub fn try_lock_gpus(&self, node_id: i64, indices: &[u32], log_id: i64) -> Result<usize> {
        if indices.is_empty() {
            return Ok(0);
        }
        let conn = self.conn()?;
        let placeholders = vec!["?"; indices.len()].join(",");
        let sql = format!(
            "UPDATE gpus SET busy_by_self = 1, busy_by_log_id = ?, update_at = ?
             WHERE node_id = ? AND busy_by_self = 0 AND idx IN ({placeholders})"
        );
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![
            Box::new(log_id),
            Box::new(ts(Utc::now())),
            Box::new(node_id),
        ];
        for idx in indices {
            values.push(Box::new(*idx));
        }
        let changed = conn.execute(
            &sql,
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
        )?;
        Ok(changed)
    }

    /// Release GPUs. With a `log_id`, only rows reserved under that run-log
    /// are cleared, so a release can never steal another task's hold.
    pub fn release_gpus(&self, node_id: i64, indices: &[u32], log_id: Option<i64>) -> Result<usize> {
        if indices.is_empty() {
            return Ok(0);
        }
        let conn = self.conn()?;
        let placeholders = vec!["?"; indices.len()].join(",");
        let guard = if log_id.is_some() {
            " AND busy_by_log_id = ?"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE gpus SET busy_by_self = 0, busy_by_log_id = NULL, update_at = ?
             WHERE node_id = ? AND idx IN ({placeholders}){guard}"
        );
        let mut values: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(ts(Utc::now())), Box::new(node_id)];
        for idx in indices {
            values.push(Box::new(*idx));
        }
        if let Some(id) = log_id {
            values.push(Box::new(id));
        }
        let changed = conn.execute(
            &sql,
            rusqlite::params_from_iter(values.iter().map(|v| v.as_ref())),
        )?;
        Ok(changed)
    }

    // ===== Tasks =====

    pub fn create_task(&self, new: &NewTask) -> Result<Task> {
        let now = ts(Utc::now());
        let status = if new.ready {
            TaskStatus::Ready
        } else {
            TaskStatus::Unready
        };
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tasks (name, owner, workspace, cmd, gpu_count, exclusive, min_memory_mib,
                                max_used_utilization, assign_node_id, priority, status, create_at, update_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
            params![
                new.name,
                new.owner,
                new.workspace,
                normalize_cmd(&new.cmd),
                new.gpu_count,
                new.exclusive,
                new.min_memory_mib as i64,
                new.max_used_utilization,
                new.assign_node_id,
                new.priority,
                status.as_i64(),
                now,
            ],
        )?;
        let id = conn.last_insert_rowid();
        self.task_by_id(id)?
            .ok_or_else(|| anyhow::anyhow!("task {} vanished after insert", id))
    }

    pub fn task_by_id(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.conn()?;
        let task = conn
            .query_row("SELECT * FROM tasks WHERE id = ?1", params![id], row_to_task)
            .optional()?;
        Ok(task)
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM tasks ORDER BY id")?;
        let tasks = stmt
            .query_map([], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// READY tasks whose claim lease is absent or expired, in dispatch order.
    pub fn ready_task_ids(&self, stale_before: DateTime<Utc>) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM tasks
             WHERE status = 0 AND (dispatching_at IS NULL OR dispatching_at < ?1)
             ORDER BY priority DESC, create_at ASC",
        )?;
        let ids = stmt
            .query_map(params![ts(stale_before)], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }

    /// Atomic claim: succeeds iff the task is READY and its lease is absent
    /// or expired. On success the lease is refreshed to `now`. Idempotent
    /// across retries in the sense that a second caller within the lease
    /// window fails cleanly.
    pub fn claim_task(&self, task_id: i64, stale_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tasks SET dispatching_at = ?1, update_at = ?1
             WHERE id = ?2 AND status = 0 AND (dispatching_at IS NULL OR dispatching_at < ?3)",
            params![ts(now), task_id, ts(stale_before)],
        )?;
        Ok(changed == 1)
    }

    /// Clear the claim lease unconditionally.
    pub fn clear_claim(&self, task_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE tasks SET dispatching_at = NULL, update_at = ?1 WHERE id = ?2",
            params![ts(Utc::now()), task_id],
        )?;
        Ok(())
    }

    /// Clear the claim lease only while the task is still READY.
    pub fn clear_claim_if_ready(&self, task_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE tasks SET dispatching_at = NULL, update_at = ?1 WHERE id = ?2 AND status = 0",
            params![ts(Utc::now()), task_id],
        )?;
        Ok(())
    }

    /// Compare-and-set READY → RUNNING, clearing the claim lease in the same
    /// statement. Returns false when another actor moved the task first.
    pub fn start_task(&self, task_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = 1, dispatching_at = NULL, update_at = ?1
             WHERE id = ?2 AND status = 0",
            params![ts(Utc::now()), task_id],
        )?;
        Ok(changed == 1)
    }

    /// Compare-and-set on task status. Terminal writes go through here so
    /// that DONE/FAILED are sticky.
    pub fn set_task_status_if(&self, task_id: i64, from: TaskStatus, to: TaskStatus) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = ?1, update_at = ?2 WHERE id = ?3 AND status = ?4",
            params![to.as_i64(), ts(Utc::now()), task_id, from.as_i64()],
        )?;
        Ok(changed == 1)
    }

    /// Operator restart: back to READY with a fresh lease, prior run-logs
    /// untouched.
    pub fn restart_task(&self, task_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = 0, dispatching_at = NULL, update_at = ?1 WHERE id = ?2",
            params![ts(Utc::now()), task_id],
        )?;
        Ok(changed == 1)
    }

    /// Delete a task and (via cascade) its run-logs. Returns the log file
    /// paths so the caller can unlink them.
    pub fn delete_task(&self, task_id: i64) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT log_file_path FROM run_logs WHERE task_id = ?1")?;
        let paths: Vec<String> = stmt
            .query_map(params![task_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        conn.execute("DELETE FROM tasks WHERE id = ?1", params![task_id])?;
        Ok(paths.into_iter().filter(|p| !p.is_empty()).collect())
    }

    /// Legacy cleanup: tasks stranded at the obsolete SCHEDULING(-3) state
    /// go back to READY.
    pub fn reset_legacy_scheduling(&self) -> Result<usize> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = 0, dispatching_at = NULL, update_at = ?1 WHERE status = -3",
            params![ts(Utc::now())],
        )?;
        Ok(changed)
    }

    // ===== Run-logs =====

    pub fn create_run_log(
        &self,
        task_id: i64,
        node_id: i64,
        gpus: &[u32],
        log_file_path: &str,
    ) -> Result<RunLog> {
        let conn = self.conn()?;
        let index: u32 = conn.query_row(
            "SELECT COUNT(*) FROM run_logs WHERE task_id = ?1",
            params![task_id],
            |row| row.get(0),
        )?;
        let now = ts(Utc::now());
        conn.execute(
            "INSERT INTO run_logs (idx, task_id, node_id, pid, gpus, log_file_path, status, start_at, update_at)
             VALUES (?1, ?2, ?3, -1, ?4, ?5, 1, ?6, ?6)",
            params![index, task_id, node_id, format_gpu_list(gpus), log_file_path, now],
        )?;
        let id = conn.last_insert_rowid();
        self.run_log_by_id(id)?
            .ok_or_else(|| anyhow::anyhow!("run log {} vanished after insert", id))
    }

    pub fn run_log_by_id(&self, id: i64) -> Result<Option<RunLog>> {
        let conn = self.conn()?;
        let log = conn
            .query_row(
                "SELECT * FROM run_logs WHERE id = ?1",
                params![id],
                row_to_run_log,
            )
            .optional()?;
        Ok(log)
    }

    pub fn run_logs_for_task(&self, task_id: i64) -> Result<Vec<RunLog>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM run_logs WHERE task_id = ?1 ORDER BY idx")?;
        let logs = stmt
            .query_map(params![task_id], row_to_run_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(logs)
    }

    pub fn delete_run_log(&self, id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM run_logs WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Persist launch facts: local SSH PID, parsed remote PID/PGID, and the
    /// first heartbeat stamp.
    pub fn record_run_log_launch(
        &self,
        id: i64,
        pid: i64,
        remote_pid: Option<i64>,
        remote_pgid: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE run_logs SET pid = ?1, remote_pid = ?2, remote_pgid = ?3,
                    last_heartbeat_at = ?4, update_at = ?4
             WHERE id = ?5",
            params![pid, remote_pid, remote_pgid, ts(now), id],
        )?;
        Ok(())
    }

    /// Compare-and-set on run-log status.
    pub fn set_run_log_status_if(
        &self,
        id: i64,
        from: RunLogStatus,
        to: RunLogStatus,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE run_logs SET status = ?1, update_at = ?2 WHERE id = ?3 AND status = ?4",
            params![to.as_i64(), ts(Utc::now()), id, from.as_i64()],
        )?;
        Ok(changed == 1)
    }

    /// Unconditional status write; only the kill path uses this (a killed
    /// run-log becomes FAILED from any source state).
    pub fn set_run_log_status(&self, id: i64, to: RunLogStatus) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE run_logs SET status = ?1, update_at = ?2 WHERE id = ?3",
            params![to.as_i64(), ts(Utc::now()), id],
        )?;
        Ok(())
    }

    pub fn running_run_logs(&self) -> Result<Vec<RunLog>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT * FROM run_logs WHERE status = 1 ORDER BY id")?;
        let logs = stmt
            .query_map([], row_to_run_log)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(logs)
    }

    // ===== Heartbeats & loss detection =====

    /// Fold one agent heartbeat into the store.
    ///
    /// The agent is authoritative for liveness, not identity: PID/PGID are
    /// back-filled only when the master has no launch-time value. A
    /// non-RUNNING run-log revives to RUNNING; a LOST parent task revives
    /// too, while DONE/FAILED tasks stay put.
    pub fn apply_task_heartbeat(
        &self,
        node_id: i64,
        heartbeat: &TaskHeartbeat,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatApplied> {
        let Some(log) = self.run_log_by_id(heartbeat.running_log_id)? else {
            return Ok(HeartbeatApplied::default());
        };
        // A heartbeat for a run-log launched on a different node is spoofed
        // or stale; drop it.
        if log.node_id != Some(node_id) {
            return Ok(HeartbeatApplied::default());
        }

        let revived = log.status != RunLogStatus::Running.as_i64();
        let conn = self.conn()?;
        conn.execute(
            "UPDATE run_logs SET
                last_heartbeat_at = ?1,
                remote_pid = COALESCE(remote_pid, ?2),
                remote_pgid = COALESCE(remote_pgid, ?3),
                status = 1,
                update_at = ?1
             WHERE id = ?4",
            params![ts(now), heartbeat.remote_pid, heartbeat.remote_pgid, log.id],
        )?;
        // Revive the parent only out of LOST; terminal statuses are sticky.
        conn.execute(
            "UPDATE tasks SET status = 1, update_at = ?1 WHERE id = ?2 AND status = -4",
            params![ts(now), log.task_id],
        )?;
        Ok(HeartbeatApplied {
            updated: true,
            revived,
        })
    }

    /// Sweep RUNNING run-logs whose heartbeat went stale: run-log → LOST,
    /// parent task → LOST (only from RUNNING). GPU reservations are kept;
    /// the node may be partitioned but still computing. Run-logs that never
    /// recorded a heartbeat predate the heartbeat system and are skipped.
    pub fn mark_stale_running_tasks_as_lost(
        &self,
        now: DateTime<Utc>,
        heartbeat_stale_seconds: i64,
    ) -> Result<usize> {
        let mut marked = 0;
        for log in self.running_run_logs()? {
            let Some(last) = log.last_heartbeat_at else {
                continue;
            };
            if (now - last).num_seconds() <= heartbeat_stale_seconds {
                continue;
            }
            if self.set_run_log_status_if(log.id, RunLogStatus::Running, RunLogStatus::Lost)? {
                marked += 1;
                log::warn!(
                    "💔 run log {} (task {}) heartbeat stale, marked lost",
                    log.id,
                    log.task_id
                );
            }
            self.set_task_status_if(log.task_id, TaskStatus::Running, TaskStatus::Lost)?;
        }
        Ok(marked)
    }
}

// ===== Row mappers =====

fn row_to_node(row: &Row<'_>) -> rusqlite::Result<Node> {
    Ok(Node {
        id: row.get("id")?,
        address: row.get("address")?,
        ssh_port: row.get("ssh_port")?,
        hostname: row.get("hostname")?,
        report_token: row.get("report_token")?,
        can_schedule: row.get("can_schedule")?,
        valid: row.get("valid")?,
        last_report_at: row
            .get::<_, Option<String>>("last_report_at")?
            .and_then(|s| parse_ts(&s)),
    })
}

fn row_to_gpu(row: &Row<'_>) -> rusqlite::Result<Gpu> {
    Ok(Gpu {
        uuid: row.get("uuid")?,
        node_id: row.get("node_id")?,
        index: row.get("idx")?,
        name: row.get("name")?,
        utilization: row.get("utilization")?,
        memory_total: row.get::<_, i64>("memory_total")?.max(0) as u64,
        memory_used: row.get::<_, i64>("memory_used")?.max(0) as u64,
        processes: row.get("processes")?,
        busy_by_self: row.get("busy_by_self")?,
        busy_by_log_id: row.get("busy_by_log_id")?,
        free: row.get("free")?,
        update_at: row
            .get::<_, String>("update_at")
            .map(|s| parse_ts(&s).unwrap_or_else(Utc::now))?,
    })
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get("id")?,
        name: row.get("name")?,
        owner: row.get("owner")?,
        workspace: row.get("workspace")?,
        cmd: row.get("cmd")?,
        gpu_count: row.get("gpu_count")?,
        exclusive: row.get("exclusive")?,
        min_memory_mib: row.get::<_, i64>("min_memory_mib")?.max(0) as u64,
        max_used_utilization: row.get("max_used_utilization")?,
        assign_node_id: row.get("assign_node_id")?,
        priority: row.get("priority")?,
        status: row.get("status")?,
        dispatching_at: row
            .get::<_, Option<String>>("dispatching_at")?
            .and_then(|s| parse_ts(&s)),
        create_at: row
            .get::<_, String>("create_at")
            .map(|s| parse_ts(&s).unwrap_or_else(Utc::now))?,
        update_at: row
            .get::<_, String>("update_at")
            .map(|s| parse_ts(&s).unwrap_or_else(Utc::now))?,
    })
}

fn row_to_run_log(row: &Row<'_>) -> rusqlite::Result<RunLog> {
    Ok(RunLog {
        id: row.get("id")?,
        index: row.get("idx")?,
        task_id: row.get("task_id")?,
        node_id: row.get("node_id")?,
        pid: row.get("pid")?,
        remote_pid: row.get("remote_pid")?,
        remote_pgid: row.get("remote_pgid")?,
        gpus: row.get("gpus")?,
        log_file_path: row.get("log_file_path")?,
        remark: row.get("remark")?,
        status: row.get("status")?,
        last_heartbeat_at: row
            .get::<_, Option<String>>("last_heartbeat_at")?
            .and_then(|s| parse_ts(&s)),
        start_at: row
            .get::<_, String>("start_at")
            .map(|s| parse_ts(&s).unwrap_or_else(Utc::now))?,
        update_at: row
            .get::<_, String>("update_at")
            .map(|s| parse_ts(&s).unwrap_or_else(Utc::now))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn temp_store() -> Store {
        let path = std::env::temp_dir().join(format!("gputasker-store-{}.db", uuid::Uuid::new_v4()));
        Store::open(path).unwrap()
    }

    fn sample(uuid: &str, index: u32, free: bool) -> GpuSample {
        GpuSample {
            uuid: uuid.to_string(),
            index,
            name: "A100".to_string(),
            utilization: if free { 0 } else { 90 },
            memory_total: 81920,
            memory_used: if free { 0 } else { 80000 },
            processes: if free {
                Vec::new()
            } else {
                vec![gputasker_protocol::GpuProcess {
                    pid: 999,
                    command: "python".to_string(),
                    gpu_memory_usage: 70000,
                    username: "bob".to_string(),
                }]
            },
        }
    }

    fn submit(store: &Store, name: &str, priority: i64) -> Task {
        store
            .create_task(&NewTask {
                name: name.to_string(),
                owner: "alice".to_string(),
                workspace: "~".to_string(),
                cmd: "sleep 1; exit 0".to_string(),
                gpu_count: 1,
                exclusive: false,
                min_memory_mib: 0,
                max_used_utilization: 0,
                assign_node_id: None,
                priority,
                ready: true,
            })
            .unwrap()
    }

    #[test]
    fn report_tokens_are_unique_and_long() {
        let store = temp_store();
        let a = store.create_node("10.0.0.1", 22).unwrap();
        let b = store.create_node("10.0.0.2", 22).unwrap();
        assert_ne!(a.report_token, b.report_token);
        // 32 random bytes, base64url without padding.
        assert_eq!(a.report_token.len(), 43);
        assert!(store.node_by_token(&a.report_token).unwrap().is_some());
        assert!(store.node_by_token("bogus").unwrap().is_none());
    }

    #[test]
    fn command_text_is_normalized_at_write() {
        let store = temp_store();
        let task = store
            .create_task(&NewTask {
                name: "t".into(),
                owner: String::new(),
                workspace: "~".into(),
                cmd: "echo a\r\necho b".into(),
                gpu_count: 1,
                exclusive: false,
                min_memory_mib: 0,
                max_used_utilization: 0,
                assign_node_id: None,
                priority: 0,
                ready: true,
            })
            .unwrap();
        assert_eq!(task.cmd, "echo a\necho b\n");
        assert_eq!(normalize_cmd(""), "");
        assert_eq!(normalize_cmd("x\n"), "x\n");
    }

    #[test]
    fn claim_is_exclusive_until_the_lease_expires() {
        let store = temp_store();
        let task = submit(&store, "train", 0);
        let now = Utc::now();
        let stale_before = now - ChronoDuration::seconds(60);

        assert!(store.claim_task(task.id, stale_before, now).unwrap());
        // A concurrent driver sharing the store loses the race.
        assert!(!store.claim_task(task.id, stale_before, now).unwrap());
        assert!(store.ready_task_ids(stale_before).unwrap().is_empty());

        // Once the lease ages past the horizon the task is re-claimable.
        let later = now + ChronoDuration::seconds(120);
        let later_stale = later - ChronoDuration::seconds(60);
        assert_eq!(store.ready_task_ids(later_stale).unwrap(), vec![task.id]);
        assert!(store.claim_task(task.id, later_stale, later).unwrap());
    }

    #[test]
    fn claim_requires_ready_status() {
        let store = temp_store();
        let task = submit(&store, "train", 0);
        assert!(store.start_task(task.id).unwrap());
        let now = Utc::now();
        assert!(!store
            .claim_task(task.id, now - ChronoDuration::seconds(60), now)
            .unwrap());
    }

    #[test]
    fn dispatch_order_is_priority_then_age() {
        let store = temp_store();
        let low = submit(&store, "low", 0);
        let high_old = submit(&store, "high-old", 5);
        let high_new = submit(&store, "high-new", 5);
        let ids = store
            .ready_task_ids(Utc::now() - ChronoDuration::seconds(60))
            .unwrap();
        assert_eq!(ids, vec![high_old.id, high_new.id, low.id]);
    }

    #[test]
    fn partial_lock_restores_under_id_without_disturbing_other_holders() {
        let store = temp_store();
        let node = store.create_node("10.0.0.1", 22).unwrap();
        let now = Utc::now();
        for (uuid, index) in [("GPU-a", 0), ("GPU-b", 1), ("GPU-c", 2)] {
            store.apply_gpu_sample(node.id, &sample(uuid, index, true), now).unwrap();
        }

        // Another supervisor already holds GPU 1 under log 100.
        assert_eq!(store.try_lock_gpus(node.id, &[1], 100).unwrap(), 1);

        // Our lock of 0..=2 only lands on two rows.
        let locked = store.try_lock_gpus(node.id, &[0, 1, 2], 200).unwrap();
        assert_eq!(locked, 2);

        // Restoring under our id releases exactly our rows.
        assert_eq!(store.release_gpus(node.id, &[0, 1, 2], Some(200)).unwrap(), 2);
        let gpus = store.gpus_for_node(node.id).unwrap();
        assert!(!gpus[0].busy_by_self);
        assert!(gpus[1].busy_by_self);
        assert_eq!(gpus[1].busy_by_log_id, Some(100));
        assert!(!gpus[2].busy_by_self);

        // A release under the wrong id never clears a foreign hold.
        assert_eq!(store.release_gpus(node.id, &[1], Some(200)).unwrap(), 0);
        assert_eq!(store.release_gpus(node.id, &[1], Some(100)).unwrap(), 1);
    }

    #[test]
    fn terminal_statuses_are_sticky() {
        let store = temp_store();
        let task = submit(&store, "train", 0);
        assert!(store.start_task(task.id).unwrap());
        assert!(!store.start_task(task.id).unwrap());

        assert!(store
            .set_task_status_if(task.id, TaskStatus::Running, TaskStatus::Done)
            .unwrap());
        // A racing reap or loss sweep cannot overwrite DONE.
        assert!(!store
            .set_task_status_if(task.id, TaskStatus::Running, TaskStatus::Failed)
            .unwrap());
        assert!(!store
            .set_task_status_if(task.id, TaskStatus::Running, TaskStatus::Lost)
            .unwrap());
        assert_eq!(
            store.task_by_id(task.id).unwrap().unwrap().status,
            TaskStatus::Done.as_i64()
        );

        // Only an explicit operator restart moves it back to READY.
        assert!(store.restart_task(task.id).unwrap());
        let task = store.task_by_id(task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Ready.as_i64());
        assert!(task.dispatching_at.is_none());
    }

    #[test]
    fn gpu_upsert_rebinds_to_the_reporting_node() {
        let store = temp_store();
        let node_a = store.create_node("10.0.0.1", 22).unwrap();
        let node_b = store.create_node("10.0.0.2", 22).unwrap();
        let now = Utc::now();

        store.apply_gpu_sample(node_a.id, &sample("GPU-x", 0, true), now).unwrap();
        store.apply_gpu_sample(node_b.id, &sample("GPU-x", 3, false), now).unwrap();

        assert!(store.gpus_for_node(node_a.id).unwrap().is_empty());
        let gpus = store.gpus_for_node(node_b.id).unwrap();
        assert_eq!(gpus.len(), 1);
        assert_eq!(gpus[0].index, 3);
        assert!(!gpus[0].free);
    }

    #[test]
    fn heartbeat_backfills_only_null_pids_and_revives_lost() {
        let store = temp_store();
        let node = store.create_node("10.0.0.1", 22).unwrap();
        let task = submit(&store, "train", 0);
        store.start_task(task.id).unwrap();
        let log = store.create_run_log(task.id, node.id, &[0], "/tmp/a.log").unwrap();
        let launch_time = Utc::now();
        store
            .record_run_log_launch(log.id, 7777, Some(4321), None, launch_time)
            .unwrap();

        // Node partition: both levels go LOST.
        store.set_run_log_status_if(log.id, RunLogStatus::Running, RunLogStatus::Lost).unwrap();
        store.set_task_status_if(task.id, TaskStatus::Running, TaskStatus::Lost).unwrap();

        let heartbeat = TaskHeartbeat {
            running_log_id: log.id,
            remote_pid: Some(1111),
            remote_pgid: Some(2222),
        };
        let later = launch_time + ChronoDuration::seconds(30);
        let applied = store.apply_task_heartbeat(node.id, &heartbeat, later).unwrap();
        assert!(applied.updated);
        assert!(applied.revived);

        let log = store.run_log_by_id(log.id).unwrap().unwrap();
        // Launch-time pid wins; the null pgid is back-filled.
        assert_eq!(log.remote_pid, Some(4321));
        assert_eq!(log.remote_pgid, Some(2222));
        assert_eq!(log.status, RunLogStatus::Running.as_i64());
        assert_eq!(
            log.last_heartbeat_at.unwrap().timestamp_micros(),
            later.timestamp_micros()
        );
        assert_eq!(
            store.task_by_id(task.id).unwrap().unwrap().status,
            TaskStatus::Running.as_i64()
        );
    }

    #[test]
    fn heartbeat_never_revives_terminal_tasks() {
        let store = temp_store();
        let node = store.create_node("10.0.0.1", 22).unwrap();
        let task = submit(&store, "train", 0);
        store.start_task(task.id).unwrap();
        let log = store.create_run_log(task.id, node.id, &[0], "/tmp/a.log").unwrap();
        store.set_run_log_status_if(log.id, RunLogStatus::Running, RunLogStatus::Lost).unwrap();
        store.set_task_status_if(task.id, TaskStatus::Running, TaskStatus::Done).unwrap();

        let heartbeat = TaskHeartbeat {
            running_log_id: log.id,
            remote_pid: None,
            remote_pgid: None,
        };
        let applied = store.apply_task_heartbeat(node.id, &heartbeat, Utc::now()).unwrap();
        assert!(applied.updated);
        assert!(applied.revived);
        // The run-log revives, the DONE task does not.
        assert_eq!(
            store.task_by_id(task.id).unwrap().unwrap().status,
            TaskStatus::Done.as_i64()
        );
    }

    #[test]
    fn heartbeat_from_the_wrong_node_is_dropped() {
        let store = temp_store();
        let node_a = store.create_node("10.0.0.1", 22).unwrap();
        let node_b = store.create_node("10.0.0.2", 22).unwrap();
        let task = submit(&store, "train", 0);
        let log = store.create_run_log(task.id, node_a.id, &[0], "/tmp/a.log").unwrap();

        let heartbeat = TaskHeartbeat {
            running_log_id: log.id,
            remote_pid: Some(1),
            remote_pgid: Some(1),
        };
        let applied = store.apply_task_heartbeat(node_b.id, &heartbeat, Utc::now()).unwrap();
        assert!(!applied.updated);
        assert!(store.run_log_by_id(log.id).unwrap().unwrap().last_heartbeat_at.is_none());
    }

    #[test]
    fn loss_sweep_marks_stale_logs_and_keeps_reservations() {
        let store = temp_store();
        let node = store.create_node("10.0.0.1", 22).unwrap();
        let now = Utc::now();
        store.apply_gpu_sample(node.id, &sample("GPU-a", 0, true), now).unwrap();

        let fresh_task = submit(&store, "fresh", 0);
        store.start_task(fresh_task.id).unwrap();
        let fresh = store.create_run_log(fresh_task.id, node.id, &[0], "").unwrap();
        store.record_run_log_launch(fresh.id, 1, None, None, now).unwrap();

        let stale_task = submit(&store, "stale", 0);
        store.start_task(stale_task.id).unwrap();
        let stale = store.create_run_log(stale_task.id, node.id, &[0], "").unwrap();
        store.try_lock_gpus(node.id, &[0], stale.id).unwrap();
        store
            .record_run_log_launch(stale.id, 2, None, None, now - ChronoDuration::seconds(300))
            .unwrap();

        // Predates heartbeats entirely; must not be mass-LOST on upgrade.
        let legacy_task = submit(&store, "legacy", 0);
        store.start_task(legacy_task.id).unwrap();
        let legacy = store.create_run_log(legacy_task.id, node.id, &[0], "").unwrap();

        let marked = store.mark_stale_running_tasks_as_lost(now, 180).unwrap();
        assert_eq!(marked, 1);

        assert_eq!(
            store.run_log_by_id(stale.id).unwrap().unwrap().status,
            RunLogStatus::Lost.as_i64()
        );
        assert_eq!(
            store.task_by_id(stale_task.id).unwrap().unwrap().status,
            TaskStatus::Lost.as_i64()
        );
        assert_eq!(
            store.run_log_by_id(fresh.id).unwrap().unwrap().status,
            RunLogStatus::Running.as_i64()
        );
        assert_eq!(
            store.run_log_by_id(legacy.id).unwrap().unwrap().status,
            RunLogStatus::Running.as_i64()
        );
        // GPUs stay reserved; the node may still be computing.
        let gpus = store.gpus_for_node(node.id).unwrap();
        assert!(gpus[0].busy_by_self);
        assert_eq!(gpus[0].busy_by_log_id, Some(stale.id));
    }

    #[test]
    fn exclusive_placement_ignores_gpus_with_foreign_processes() {
        let store = temp_store();
        let node = store.create_node("10.0.0.1", 22).unwrap();
        let now = Utc::now();
        store.touch_node_report(node.id, now).unwrap();
        let node = store.node_by_id(node.id).unwrap().unwrap();
        store.apply_gpu_sample(node.id, &sample("GPU-a", 0, true), now).unwrap();
        store.apply_gpu_sample(node.id, &sample("GPU-b", 1, false), now).unwrap();

        let mut task = submit(&store, "train", 0);
        task.gpu_count = 2;
        task.exclusive = true;
        assert!(store
            .available_gpu_indices(&node, &task, now, 180)
            .unwrap()
            .is_none());

        task.gpu_count = 1;
        assert_eq!(
            store.available_gpu_indices(&node, &task, now, 180).unwrap(),
            Some(vec![0])
        );
    }

    #[test]
    fn shared_placement_applies_memory_and_utilization_thresholds() {
        let store = temp_store();
        let node = store.create_node("10.0.0.1", 22).unwrap();
        let now = Utc::now();
        store.touch_node_report(node.id, now).unwrap();
        let node = store.node_by_id(node.id).unwrap().unwrap();
        // busy: 1920 MiB free, 10% idle. idle: fully free.
        store.apply_gpu_sample(node.id, &sample("GPU-busy", 0, false), now).unwrap();
        store.apply_gpu_sample(node.id, &sample("GPU-idle", 1, true), now).unwrap();

        let mut task = submit(&store, "train", 0);
        task.min_memory_mib = 10000;
        task.max_used_utilization = 50;
        assert_eq!(
            store.available_gpu_indices(&node, &task, now, 180).unwrap(),
            Some(vec![1])
        );

        task.min_memory_mib = 0;
        task.max_used_utilization = 0;
        assert_eq!(
            store.available_gpu_indices(&node, &task, now, 180).unwrap(),
            Some(vec![0, 1])
        );
    }

    #[test]
    fn placement_requires_a_live_schedulable_node() {
        let store = temp_store();
        let node = store.create_node("10.0.0.1", 22).unwrap();
        let now = Utc::now();
        store.apply_gpu_sample(node.id, &sample("GPU-a", 0, true), now).unwrap();

        let task = submit(&store, "train", 0);
        // Never reported: not live.
        let unreported = store.node_by_id(node.id).unwrap().unwrap();
        assert!(store
            .available_gpu_indices(&unreported, &task, now, 180)
            .unwrap()
            .is_none());

        // Reported long ago: stale.
        store
            .touch_node_report(node.id, now - ChronoDuration::seconds(300))
            .unwrap();
        let stale = store.node_by_id(node.id).unwrap().unwrap();
        assert!(store
            .available_gpu_indices(&stale, &task, now, 180)
            .unwrap()
            .is_none());

        store.touch_node_report(node.id, now).unwrap();
        let live = store.node_by_id(node.id).unwrap().unwrap();
        assert!(store.available_gpu_indices(&live, &task, now, 180).unwrap().is_some());
    }

    #[test]
    fn run_log_indices_are_monotonic_per_task() {
        let store = temp_store();
        let node = store.create_node("10.0.0.1", 22).unwrap();
        let task = submit(&store, "train", 0);
        let first = store.create_run_log(task.id, node.id, &[0, 1], "/tmp/0.log").unwrap();
        let second = store.create_run_log(task.id, node.id, &[2], "/tmp/1.log").unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(second.index, 1);
        assert_eq!(first.gpus, "0,1");
        assert_eq!(first.pid, -1);
        assert_eq!(first.status, RunLogStatus::Running.as_i64());
    }

    #[test]
    fn deleting_a_task_cascades_to_run_logs_and_returns_paths() {
        let store = temp_store();
        let node = store.create_node("10.0.0.1", 22).unwrap();
        let task = submit(&store, "train", 0);
        let log = store.create_run_log(task.id, node.id, &[0], "/tmp/doomed.log").unwrap();

        let paths = store.delete_task(task.id).unwrap();
        assert_eq!(paths, vec!["/tmp/doomed.log".to_string()]);
        assert!(store.task_by_id(task.id).unwrap().is_none());
        assert!(store.run_log_by_id(log.id).unwrap().is_none());
    }

    #[test]
    fn legacy_scheduling_tasks_are_recycled_to_ready() {
        let store = temp_store();
        let task = submit(&store, "train", 0);
        let conn = store.conn().unwrap();
        conn.execute("UPDATE tasks SET status = -3 WHERE id = ?1", params![task.id])
            .unwrap();
        drop(conn);

        assert_eq!(store.reset_legacy_scheduling().unwrap(), 1);
        let task = store.task_by_id(task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Ready.as_i64());
    }
}
