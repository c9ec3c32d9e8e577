use serde::{Deserialize, Serialize};

/// One process currently holding memory on a GPU, as seen by
/// `nvidia-smi --query-compute-apps` joined against `ps` for the owner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GpuProcess {
    pub pid: i64,
    pub command: String,
    pub gpu_memory_usage: u64,
    /// Owner username; `unknown` when the PID could not be joined.
    #[serde(default = "default_username")]
    pub username: String,
}

fn default_username() -> String {
    "unknown".to_string()
}

/// One GPU device snapshot reported by an agent.
///
/// `uuid` is the only required field; everything else defaults so that a
/// partially-filled entry still folds into the store. An entry with a
/// wrong-typed field fails deserialization and is skipped by the endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuSample {
    pub uuid: String,
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub utilization: u32,
    #[serde(default)]
    pub memory_total: u64,
    #[serde(default)]
    pub memory_used: u64,
    #[serde(default)]
    pub processes: Vec<GpuProcess>,
}

/// Body of `POST /api/v1/report_gpu/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuReport {
    pub token: String,
    pub gpus: Vec<GpuSample>,
    pub timestamp: i64,
}

/// Ack for `/report_gpu/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuReportAck {
    pub ok: bool,
    pub updated: u32,
    pub server: String,
    pub ts: i64,
}

/// One running-task heartbeat entry scanned from the metadata directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskHeartbeat {
    #[serde(alias = "log_id")]
    pub running_log_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_pid: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_pgid: Option<i64>,
}

/// Body of `POST /api/v1/report_tasks/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReport {
    pub token: String,
    pub tasks: Vec<TaskHeartbeat>,
    pub timestamp: i64,
}

/// Ack for `/report_tasks/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskReportAck {
    pub ok: bool,
    pub updated: u32,
    pub revived: u32,
    pub ts: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_sample_defaults_missing_fields() {
        let sample: GpuSample =
            serde_json::from_str(r#"{"uuid":"GPU-abc","index":1,"name":"A100"}"#).unwrap();
        assert_eq!(sample.uuid, "GPU-abc");
        assert_eq!(sample.utilization, 0);
        assert!(sample.processes.is_empty());
    }

    #[test]
    fn gpu_sample_rejects_wrong_types() {
        assert!(serde_json::from_str::<GpuSample>(r#"{"uuid":"g","index":"one"}"#).is_err());
        assert!(serde_json::from_str::<GpuSample>(r#"{"index":0}"#).is_err());
    }

    #[test]
    fn heartbeat_accepts_log_id_alias() {
        let hb: TaskHeartbeat = serde_json::from_str(r#"{"log_id":7}"#).unwrap();
        assert_eq!(hb.running_log_id, 7);
        assert_eq!(hb.remote_pid, None);
    }
}
