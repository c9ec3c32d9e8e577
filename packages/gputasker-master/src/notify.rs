//! Task lifecycle notifications.
//!
//! Supervisors emit structured events over an unbounded channel; a
//! background worker serializes each one and writes it to the operator log.
//! The log sink is the boundary to the out-of-scope mail/UI notifiers —
//! swapping the worker body is all an integration needs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskStarted {
        task_id: i64,
        task_name: String,
        run_log_id: i64,
        node: String,
        gpus: String,
        timestamp: DateTime<Utc>,
    },
    TaskFinished {
        task_id: i64,
        task_name: String,
        run_log_id: i64,
        exit_code: i32,
        timestamp: DateTime<Utc>,
    },
    TaskFailed {
        task_id: i64,
        task_name: String,
        run_log_id: i64,
        exit_code: i32,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<TaskEvent>,
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskEvent>();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(json) => log::info!("📣 {}", json),
                    Err(err) => log::error!("failed to serialize task event: {}", err),
                }
            }
        });
        Self { tx }
    }

    /// Emit an event (non-blocking).
    pub fn emit(&self, event: TaskEvent) {
        if let Err(err) = self.tx.send(event) {
            log::error!("failed to emit task event: {}", err);
        }
    }
}
