//! Per-node GPU agent: probes local hardware, scans running-task metadata,
//! and reports both to the master on a fixed interval over blocking HTTP.
//!
//! A rejected token (401/403) is the one fatal condition; the agent exits
//! with code 0 so a `Restart=on-failure` unit does not thrash. Everything
//! else is retried next tick.

mod probe;
mod tasks;

use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use gputasker_protocol::{GpuReport, TaskReport};

struct AgentConfig {
    server_url: String,
    tasks_url: String,
    token: String,
    report_interval: Duration,
    request_timeout: Duration,
    exit_after_consecutive_failures: u32,
    report_tasks: bool,
    running_tasks_dir: PathBuf,
}

fn env_trimmed(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = env_trimmed("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

impl AgentConfig {
    fn from_env() -> Self {
        let server_url = env_trimmed("GPUTASKER_SERVER_URL")
            .unwrap_or_else(|| "http://127.0.0.1:8888/api/v1/report_gpu/".to_string());
        let tasks_url = env_trimmed("GPUTASKER_TASKS_API_URL")
            .unwrap_or_else(|| server_url.replace("/report_gpu/", "/report_tasks/"));
        let interval = env_trimmed("GPUTASKER_REPORT_INTERVAL")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);
        let timeout = env_trimmed("GPUTASKER_REQUEST_TIMEOUT")
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(5.0);
        Self {
            server_url,
            tasks_url,
            token: env_trimmed("GPUTASKER_AGENT_TOKEN").unwrap_or_default(),
            report_interval: Duration::from_secs(interval),
            request_timeout: Duration::from_secs_f64(timeout.max(0.1)),
            exit_after_consecutive_failures: env_trimmed(
                "GPUTASKER_EXIT_AFTER_CONSECUTIVE_FAILURES",
            )
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
            report_tasks: !matches!(
                std::env::var("GPUTASKER_REPORT_TASKS").as_deref(),
                Ok("0") | Ok("false") | Ok("False")
            ),
            running_tasks_dir: expand_home(
                &env_trimmed("GPUTASKER_RUNNING_TASKS_DIR")
                    .unwrap_or_else(|| "~/.gputasker/running_tasks".to_string()),
            ),
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

enum TickOutcome {
    Ok,
    Failed,
    TokenRejected,
}

fn post_report<T: serde::Serialize>(
    client: &reqwest::blocking::Client,
    url: &str,
    payload: &T,
    what: &str,
) -> Result<bool, ()> {
    match client.post(url).json(payload).send() {
        Ok(response) => {
            let status = response.status().as_u16();
            match status {
                200 => Ok(true),
                401 | 403 => {
                    log::error!("agent token rejected by {} endpoint ({})", what, status);
                    Err(())
                }
                _ => {
                    let body = response.text().unwrap_or_default();
                    log::warn!("{} endpoint responded with {}: {}", what, status, body);
                    Ok(false)
                }
            }
        }
        Err(err) => {
            log::error!("failed to report {}: {}", what, err);
            Ok(false)
        }
    }
}

fn send_report(client: &reqwest::blocking::Client, config: &AgentConfig) -> TickOutcome {
    let gpus = probe::collect_gpu_data();
    let gpu_count = gpus.len();
    let payload = GpuReport {
        token: config.token.clone(),
        gpus,
        timestamp: unix_now(),
    };
    let ok_gpu = match post_report(client, &config.server_url, &payload, "gpu") {
        Ok(ok) => {
            if ok {
                log::info!("📡 reported {} gpu(s)", gpu_count);
            }
            ok
        }
        Err(()) => return TickOutcome::TokenRejected,
    };

    let mut ok_tasks = true;
    if config.report_tasks {
        let heartbeats = tasks::collect_running_tasks(&config.running_tasks_dir);
        let task_count = heartbeats.len();
        let payload = TaskReport {
            token: config.token.clone(),
            tasks: heartbeats,
            timestamp: unix_now(),
        };
        ok_tasks = match post_report(client, &config.tasks_url, &payload, "tasks") {
            Ok(ok) => {
                if ok {
                    log::info!("💓 reported {} running task(s)", task_count);
                }
                ok
            }
            Err(()) => return TickOutcome::TokenRejected,
        };
    }

    if ok_gpu && ok_tasks {
        TickOutcome::Ok
    } else {
        TickOutcome::Failed
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(
        env_logger::Env::new().filter_or("GPUTASKER_AGENT_LOGLEVEL", "info"),
    )
    .init();

    let config = AgentConfig::from_env();
    if config.token.is_empty() {
        log::error!("missing agent token; set GPUTASKER_AGENT_TOKEN before starting");
        return Ok(());
    }

    log::info!(
        "🚀 GPUTasker Agent v{} reporting to {} every {:?}",
        env!("CARGO_PKG_VERSION"),
        config.server_url,
        config.report_interval,
    );
    if config.report_tasks {
        log::info!(
            "💓 task heartbeats enabled ({} → {})",
            config.running_tasks_dir.display(),
            config.tasks_url,
        );
    }

    let client = reqwest::blocking::Client::builder()
        .timeout(config.request_timeout)
        .build()?;

    let mut consecutive_failures = 0u32;
    loop {
        let started = Instant::now();
        match send_report(&client, &config) {
            TickOutcome::TokenRejected => {
                // Exit 0 on purpose: a supervisor restarting on failure
                // would hammer the master with a bad token forever.
                log::error!("exiting due to token rejection");
                return Ok(());
            }
            TickOutcome::Ok => consecutive_failures = 0,
            TickOutcome::Failed => {
                consecutive_failures += 1;
                if config.exit_after_consecutive_failures > 0
                    && consecutive_failures >= config.exit_after_consecutive_failures
                {
                    log::error!(
                        "exiting after {} consecutive failures",
                        consecutive_failures
                    );
                    return Ok(());
                }
            }
        }
        let elapsed = started.elapsed();
        if elapsed < config.report_interval {
            std::thread::sleep(config.report_interval - elapsed);
        }
    }
}
