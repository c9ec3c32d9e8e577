use chrono::{DateTime, Utc};
use gputasker_protocol::GpuProcess;

// ===== Status encodings =====
//
// Integer codes are persisted and must stay stable across releases.
// -3 was a legacy SCHEDULING state; only the scheduler's cleanup sweep
// still recognizes the numeral.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Unready,
    Failed,
    Lost,
    Ready,
    Running,
    Done,
}

impl TaskStatus {
    pub fn as_i64(&self) -> i64 {
        match self {
            TaskStatus::Unready => -2,
            TaskStatus::Failed => -1,
            TaskStatus::Lost => -4,
            TaskStatus::Ready => 0,
            TaskStatus::Running => 1,
            TaskStatus::Done => 2,
        }
    }

    pub fn from_i64(code: i64) -> Option<Self> {
        match code {
            -2 => Some(TaskStatus::Unready),
            -1 => Some(TaskStatus::Failed),
            -4 => Some(TaskStatus::Lost),
            0 => Some(TaskStatus::Ready),
            1 => Some(TaskStatus::Running),
            2 => Some(TaskStatus::Done),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Unready => "unready",
            TaskStatus::Failed => "failed",
            TaskStatus::Lost => "lost",
            TaskStatus::Ready => "ready",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLogStatus {
    Failed,
    Lost,
    Running,
    Done,
}

impl RunLogStatus {
    pub fn as_i64(&self) -> i64 {
        match self {
            RunLogStatus::Failed => -1,
            RunLogStatus::Lost => -2,
            RunLogStatus::Running => 1,
            RunLogStatus::Done => 2,
        }
    }

    pub fn from_i64(code: i64) -> Option<Self> {
        match code {
            -1 => Some(RunLogStatus::Failed),
            -2 => Some(RunLogStatus::Lost),
            1 => Some(RunLogStatus::Running),
            2 => Some(RunLogStatus::Done),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunLogStatus::Failed => "failed",
            RunLogStatus::Lost => "lost",
            RunLogStatus::Running => "running",
            RunLogStatus::Done => "done",
        }
    }
}

// ===== Rows =====

/// A GPU host reachable over SSH, running one agent.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: i64,
    pub address: String,
    pub ssh_port: u16,
    pub hostname: Option<String>,
    /// Bearer token for the report endpoints. Issued once at creation,
    /// immutable thereafter.
    pub report_token: String,
    pub can_schedule: bool,
    pub valid: bool,
    pub last_report_at: Option<DateTime<Utc>>,
}

impl Node {
    /// Liveness in report mode: a node is live iff it reported recently.
    pub fn is_reporting_alive(&self, now: DateTime<Utc>, stale_seconds: i64) -> bool {
        match self.last_report_at {
            Some(last) => (now - last).num_seconds() <= stale_seconds,
            None => false,
        }
    }

    pub fn display(&self) -> String {
        format!("{}:{}", self.address, self.ssh_port)
    }
}

/// One GPU device on a node, keyed by its stable device UUID.
#[derive(Debug, Clone)]
pub struct Gpu {
    pub uuid: String,
    pub node_id: i64,
    pub index: u32,
    pub name: String,
    pub utilization: u32,
    pub memory_total: u64,
    pub memory_used: u64,
    /// Compact JSON, one process per line.
    pub processes: String,
    pub busy_by_self: bool,
    pub busy_by_log_id: Option<i64>,
    /// No foreign processes were seen in the latest report.
    pub free: bool,
    pub update_at: DateTime<Utc>,
}

impl Gpu {
    pub fn process_list(&self) -> Vec<GpuProcess> {
        self.processes
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

/// A queued or running workload.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: i64,
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
    pub status: i64,
    pub dispatching_at: Option<DateTime<Utc>>,
    pub create_at: DateTime<Utc>,
    pub update_at: DateTime<Utc>,
}

impl Task {
    pub fn status_enum(&self) -> Option<TaskStatus> {
        TaskStatus::from_i64(self.status)
    }
}

/// One execution attempt of a task.
#[derive(Debug, Clone)]
pub struct RunLog {
    pub id: i64,
    pub index: u32,
    pub task_id: i64,
    pub node_id: Option<i64>,
    /// Local PID of the supervising SSH process on the master.
    pub pid: i64,
    pub remote_pid: Option<i64>,
    pub remote_pgid: Option<i64>,
    /// Comma-separated GPU indices.
    pub gpus: String,
    pub log_file_path: String,
    pub remark: String,
    pub status: i64,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub start_at: DateTime<Utc>,
    pub update_at: DateTime<Utc>,
}

impl RunLog {
    pub fn status_enum(&self) -> Option<RunLogStatus> {
        RunLogStatus::from_i64(self.status)
    }

    pub fn gpu_indices(&self) -> Vec<u32> {
        parse_gpu_list(&self.gpus)
    }
}

/// Parse a comma-separated GPU index list, skipping anything unparsable.
pub fn parse_gpu_list(gpus: &str) -> Vec<u32> {
    gpus.split(',')
        .filter_map(|item| item.trim().parse::<u32>().ok())
        .collect()
}

pub fn format_gpu_list(indices: &[u32]) -> String {
    indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for code in [-2, -1, -4, 0, 1, 2] {
            assert_eq!(TaskStatus::from_i64(code).unwrap().as_i64(), code);
        }
        for code in [-1, -2, 1, 2] {
            assert_eq!(RunLogStatus::from_i64(code).unwrap().as_i64(), code);
        }
        // Legacy SCHEDULING is not a live status.
        assert!(TaskStatus::from_i64(-3).is_none());
    }

    #[test]
    fn gpu_list_parsing_skips_garbage() {
        assert_eq!(parse_gpu_list("0,1, 3"), vec![0, 1, 3]);
        assert_eq!(parse_gpu_list("0,,x,2"), vec![0, 2]);
        assert_eq!(parse_gpu_list(""), Vec::<u32>::new());
        assert_eq!(format_gpu_list(&[2, 5]), "2,5");
    }
}
