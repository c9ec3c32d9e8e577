//! Master ingress: the two agent-facing report endpoints.
//!
//! Bodies are parsed leniently, matching the wire contract exactly:
//! malformed JSON → 400, missing/non-string token → 401, unknown token →
//! 403, missing/non-array payload → 400. Individual entries that fail to
//! deserialize are skipped silently.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::models::Node;
use crate::store::Store;
use gputasker_protocol::{GpuReportAck, GpuSample, TaskHeartbeat, TaskReportAck};

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<Store>,
}

pub fn create_router(store: Arc<Store>) -> Router {
    Router::new()
        .route("/api/v1/report_gpu/", post(report_gpu_handler))
        .route("/api/v1/report_tasks/", post(report_tasks_handler))
        .with_state(ApiState { store })
}

fn error_response(status: StatusCode, error: &str) -> Response {
    (status, Json(json!({ "ok": false, "error": error }))).into_response()
}

/// Shared preamble: parse the body, check the token shape, resolve the node.
fn authenticate(store: &Store, body: &Bytes) -> Result<(Value, Node), Response> {
    let payload: Value = serde_json::from_slice(body)
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "invalid_json"))?;
    let token = match payload.get("token") {
        Some(Value::String(token)) if !token.is_empty() => token.clone(),
        _ => return Err(error_response(StatusCode::UNAUTHORIZED, "missing_token")),
    };
    let node = match store.node_by_token(&token) {
        Ok(Some(node)) => node,
        Ok(None) => return Err(error_response(StatusCode::FORBIDDEN, "invalid_token")),
        Err(err) => {
            log::error!("token lookup failed: {}", err);
            return Err(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_error",
            ));
        }
    };
    Ok((payload, node))
}

async fn report_gpu_handler(State(state): State<ApiState>, body: Bytes) -> Response {
    let (payload, node) = match authenticate(&state.store, &body) {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    let gpus = match payload.get("gpus") {
        Some(Value::Array(gpus)) => gpus.clone(),
        Some(_) => return error_response(StatusCode::BAD_REQUEST, "invalid_gpus"),
        None => return error_response(StatusCode::BAD_REQUEST, "missing_gpus"),
    };

    let now = Utc::now();
    if let Err(err) = state.store.touch_node_report(node.id, now) {
        log::error!("failed to touch node {}: {}", node.display(), err);
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "store_error");
    }

    let mut updated = 0u32;
    for entry in gpus {
        let Ok(sample) = serde_json::from_value::<GpuSample>(entry) else {
            continue;
        };
        if sample.uuid.is_empty() {
            continue;
        }
        match state.store.apply_gpu_sample(node.id, &sample, now) {
            Ok(()) => updated += 1,
            Err(err) => log::error!("failed to fold gpu {}: {}", sample.uuid, err),
        }
    }
    log::debug!("🖥️  {} reported {} gpu(s)", node.display(), updated);

    Json(GpuReportAck {
        ok: true,
        updated,
        server: node.display(),
        ts: now.timestamp(),
    })
    .into_response()
}

async fn report_tasks_handler(State(state): State<ApiState>, body: Bytes) -> Response {
    let (payload, node) = match authenticate(&state.store, &body) {
        Ok(ok) => ok,
        Err(response) => return response,
    };
    let tasks = match payload.get("tasks") {
        Some(Value::Array(tasks)) => tasks.clone(),
        Some(_) => return error_response(StatusCode::BAD_REQUEST, "invalid_tasks"),
        None => return error_response(StatusCode::BAD_REQUEST, "missing_tasks"),
    };

    // A task heartbeat doubles as a node liveness signal.
    let now = Utc::now();
    if let Err(err) = state.store.touch_node_report(node.id, now) {
        log::error!("failed to touch node {}: {}", node.display(), err);
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "store_error");
    }

    let mut updated = 0u32;
    let mut revived = 0u32;
    for entry in tasks {
        let Ok(heartbeat) = serde_json::from_value::<TaskHeartbeat>(entry) else {
            continue;
        };
        match state.store.apply_task_heartbeat(node.id, &heartbeat, now) {
            Ok(applied) => {
                if applied.updated {
                    updated += 1;
                }
                if applied.revived {
                    revived += 1;
                    log::info!(
                        "💓 run log {} revived by heartbeat from {}",
                        heartbeat.running_log_id,
                        node.display()
                    );
                }
            }
            Err(err) => log::error!(
                "failed to fold heartbeat for log {}: {}",
                heartbeat.running_log_id,
                err
            ),
        }
    }

    Json(TaskReportAck {
        ok: true,
        updated,
        revived,
        ts: now.timestamp(),
    })
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    fn temp_store() -> Arc<Store> {
        let path = std::env::temp_dir().join(format!("gputasker-api-{}.db", uuid::Uuid::new_v4()));
        Arc::new(Store::open(path).unwrap())
    }

    async fn post(router: Router, uri: &str, body: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn missing_token_is_401_and_unknown_token_is_403() {
        let store = temp_store();
        let router = create_router(store);

        let (status, body) = post(router.clone(), "/api/v1/report_gpu/", r#"{"gpus":[]}"#).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "missing_token");

        let (status, body) = post(
            router,
            "/api/v1/report_gpu/",
            r#"{"token":"nope","gpus":[]}"#,
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "invalid_token");
    }

    #[tokio::test]
    async fn malformed_body_and_missing_gpus_are_400() {
        let store = temp_store();
        let node = store.create_node("10.0.0.1", 22).unwrap();
        let router = create_router(store);

        let (status, _) = post(router.clone(), "/api/v1/report_gpu/", "not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = post(
            router.clone(),
            "/api/v1/report_gpu/",
            &format!(r#"{{"token":"{}"}}"#, node.report_token),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "missing_gpus");

        let (status, body) = post(
            router,
            "/api/v1/report_gpu/",
            &format!(r#"{{"token":"{}","gpus":"zero"}}"#, node.report_token),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_gpus");
    }

    #[tokio::test]
    async fn gpu_report_folds_entries_and_skips_garbage() {
        let store = temp_store();
        let node = store.create_node("10.0.0.1", 22).unwrap();
        let router = create_router(store.clone());

        let body = format!(
            r#"{{"token":"{}","timestamp":0,"gpus":[
                {{"uuid":"GPU-a","index":0,"name":"A100","utilization":5,"memory_total":81920,"memory_used":100}},
                "not a dict",
                {{"index":1}},
                {{"uuid":"GPU-b","index":1,"name":"A100","utilization":0,"memory_total":81920,"memory_used":0,
                  "processes":[{{"pid":9,"command":"python","gpu_memory_usage":512,"username":"alice"}}]}}
            ]}}"#,
            node.report_token
        );
        let (status, ack) = post(router, "/api/v1/report_gpu/", &body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["ok"], true);
        assert_eq!(ack["updated"], 2);

        let gpus = store.gpus_for_node(node.id).unwrap();
        assert_eq!(gpus.len(), 2);
        assert!(gpus[0].free);
        assert!(!gpus[1].free);
        assert_eq!(gpus[1].process_list()[0].username, "alice");

        let node = store.node_by_id(node.id).unwrap().unwrap();
        assert!(node.last_report_at.is_some());
    }

    #[tokio::test]
    async fn task_report_rejects_cross_node_heartbeats() {
        let store = temp_store();
        let node_a = store.create_node("10.0.0.1", 22).unwrap();
        let node_b = store.create_node("10.0.0.2", 22).unwrap();
        let task = store
            .create_task(&crate::store::NewTask {
                name: "train".into(),
                owner: "alice".into(),
                workspace: "~".into(),
                cmd: "echo hi".into(),
                gpu_count: 1,
                exclusive: false,
                min_memory_mib: 0,
                max_used_utilization: 0,
                assign_node_id: None,
                priority: 0,
                ready: true,
            })
            .unwrap();
        let log = store
            .create_run_log(task.id, node_a.id, &[0], "/tmp/x.log")
            .unwrap();
        let router = create_router(store.clone());

        let body = format!(
            r#"{{"token":"{}","timestamp":0,"tasks":[{{"running_log_id":{}}}]}}"#,
            node_b.report_token, log.id
        );
        let (status, ack) = post(router, "/api/v1/report_tasks/", &body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ack["updated"], 0);

        let log = store.run_log_by_id(log.id).unwrap().unwrap();
        assert!(log.last_heartbeat_at.is_none());
    }
}
