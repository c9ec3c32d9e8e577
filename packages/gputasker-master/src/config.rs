//! Environment-driven master settings.
//!
//! Everything is read from `GPUTASKER_*` variables; the scheduler re-reads
//! the environment at the top of every tick so intervals and credentials can
//! be rotated without a restart. Unparsable values fall back to defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuUpdateMode {
    /// Agents push reports over HTTP (default).
    Report,
    /// Legacy SSH polling; recognized but not reimplemented.
    Ssh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushAgentMode {
    /// Push only when the remote copy is absent.
    Missing,
    /// Push when absent or content differs (default).
    Update,
    /// Push unconditionally.
    Always,
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub bind_addr: SocketAddr,
    pub db_path: PathBuf,
    pub running_log_dir: PathBuf,
    /// Local path of the agent binary/script pushed to nodes.
    pub agent_source_path: PathBuf,
    /// Report endpoint URL handed to agents at start.
    pub server_url: String,
    pub ssh_user: String,
    pub ssh_private_key_path: Option<String>,
    pub ssh_timeout: Duration,
    pub loop_interval_seconds: u64,
    pub claim_stale_seconds: i64,
    pub node_stale_seconds: i64,
    pub heartbeat_stale_seconds: i64,
    pub gpu_update_mode: GpuUpdateMode,
    pub push_agent: bool,
    pub push_agent_mode: PushAgentMode,
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => !matches!(v.trim(), "0" | "false" | "False"),
        Err(_) => default,
    }
}

impl MasterConfig {
    pub fn from_env() -> Self {
        let bind_addr: SocketAddr = env_str("GPUTASKER_BIND_ADDR", "0.0.0.0:8888")
            .parse()
            .unwrap_or_else(|_| "0.0.0.0:8888".parse().unwrap());
        let server_url = env_str(
            "GPUTASKER_SERVER_URL",
            &format!("http://127.0.0.1:{}/api/v1/report_gpu/", bind_addr.port()),
        );
        let gpu_update_mode = match env_str("GPUTASKER_GPU_UPDATE_MODE", "report").to_lowercase().as_str() {
            "ssh" => GpuUpdateMode::Ssh,
            _ => GpuUpdateMode::Report,
        };
        let push_agent_mode = match env_str("GPUTASKER_REMOTE_PUSH_AGENT_MODE", "update")
            .to_lowercase()
            .as_str()
        {
            "missing" => PushAgentMode::Missing,
            "always" => PushAgentMode::Always,
            _ => PushAgentMode::Update,
        };
        Self {
            bind_addr,
            db_path: PathBuf::from(env_str("GPUTASKER_DB_PATH", "gputasker.db")),
            running_log_dir: PathBuf::from(env_str("GPUTASKER_RUNNING_LOG_DIR", "running_log")),
            agent_source_path: PathBuf::from(env_str(
                "GPUTASKER_AGENT_SOURCE",
                "agent/gputasker-agent",
            )),
            server_url,
            ssh_user: env_str("GPUTASKER_SSH_USER", "root"),
            ssh_private_key_path: std::env::var("GPUTASKER_SSH_PRIVATE_KEY")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            ssh_timeout: Duration::from_secs(env_i64("GPUTASKER_SSH_TIMEOUT_SECONDS", 60).max(1) as u64),
            loop_interval_seconds: env_i64("GPUTASKER_LOOP_INTERVAL_SECONDS", 10).max(1) as u64,
            claim_stale_seconds: env_i64("GPUTASKER_DISPATCH_CLAIM_STALE_SECONDS", 60).max(5),
            node_stale_seconds: env_i64("GPUTASKER_NODE_STALE_SECONDS", 180),
            heartbeat_stale_seconds: env_i64("GPUTASKER_TASK_HEARTBEAT_STALE_SECONDS", 180),
            gpu_update_mode,
            push_agent: env_bool("GPUTASKER_REMOTE_PUSH_AGENT", true),
            push_agent_mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = MasterConfig::from_env();
        assert!(cfg.loop_interval_seconds >= 1);
        assert!(cfg.claim_stale_seconds >= 5);
        assert_eq!(cfg.node_stale_seconds, 180);
    }

    #[test]
    fn env_bool_parses_falsey_spellings() {
        std::env::set_var("GPUTASKER_TEST_BOOL", "false");
        assert!(!env_bool("GPUTASKER_TEST_BOOL", true));
        std::env::set_var("GPUTASKER_TEST_BOOL", "1");
        assert!(env_bool("GPUTASKER_TEST_BOOL", false));
        std::env::remove_var("GPUTASKER_TEST_BOOL");
    }
}
