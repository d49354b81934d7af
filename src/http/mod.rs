//! Inspect HTTP 端点
//!
//! `POST /inspect/:app`，请求体原样作为查询负载。

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::core::MachineError;
use crate::engine::CompletionStatus;
use crate::machine::{InspectResult, MachineManager};

/// Inspect 响应体
#[derive(Debug, Serialize)]
pub struct InspectResponse {
    pub status: CompletionStatus,
    /// 异常负载（0x 十六进制）
    pub exception: Option<String>,
    pub reports: Vec<String>,
    pub processed_input_count: u64,
}

impl From<InspectResult> for InspectResponse {
    fn from(result: InspectResult) -> Self {
        Self {
            status: result.status,
            exception: result.exception().map(to_hex),
            reports: result.reports.iter().map(|r| to_hex(r)).collect(),
            processed_input_count: result.processed_inputs,
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// 创建 Inspect 路由
pub fn router(manager: Arc<MachineManager>) -> Router {
    Router::new()
        .route("/inspect/:app", post(inspect))
        .route("/health", get(|| async { "OK" }))
        .with_state(manager)
}

/// POST /inspect/:app
async fn inspect(
    State(manager): State<Arc<MachineManager>>,
    Path(app): Path<String>,
    body: Bytes,
) -> Response {
    let Some(machine) = manager.get_machine(&app).await else {
        return error_response(StatusCode::NOT_FOUND, format!("application {app} not found"));
    };

    match machine.inspect(&CancellationToken::new(), &body).await {
        Ok(result) => Json(InspectResponse::from(result)).into_response(),
        Err(e @ (MachineError::Closed | MachineError::Broken)) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
        Err(e) => {
            tracing::warn!(app = %app, "Inspect failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::backend::mock::template_hash;
    use crate::backend::{MockFactory, Step};
    use crate::machine::{Application, LoadOptions};
    use crate::repository::MemoryRepository;

    async fn manager(factory: MockFactory, dir: &tempfile::TempDir) -> Arc<MachineManager> {
        let repo = Arc::new(MemoryRepository::new());
        repo.add_application(Application::new("echo", dir.path(), template_hash(dir.path())))
            .await;
        let manager = Arc::new(MachineManager::new(repo, Arc::new(factory), LoadOptions::default()));
        manager
            .update_machines(&CancellationToken::new())
            .await
            .unwrap();
        manager
    }

    async fn post(router: Router, uri: &str, body: &'static [u8]) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_inspect_returns_hex_reports() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(manager(MockFactory::default(), &dir).await);

        let (status, body) = post(router, "/inspect/echo", b"\x01\x02").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ACCEPTED");
        assert_eq!(body["reports"][0], "0x0102");
        assert_eq!(body["exception"], serde_json::Value::Null);
        assert_eq!(body["processed_input_count"], 0);
    }

    #[tokio::test]
    async fn test_inspect_exception() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MockFactory::new(|_, _| vec![Step::Exception(b"\xff".to_vec())]);
        let router = router(manager(factory, &dir).await);

        let (status, body) = post(router, "/inspect/echo", b"q").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "EXCEPTION");
        assert_eq!(body["exception"], "0xff");
    }

    #[tokio::test]
    async fn test_unknown_application() {
        let dir = tempfile::tempdir().unwrap();
        let router = router(manager(MockFactory::default(), &dir).await);

        let (status, body) = post(router, "/inspect/nope", b"q").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_closed_machine_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(MockFactory::default(), &dir).await;
        let machine = manager.get_machine("echo").await.unwrap();
        machine.close().await.unwrap();

        let (status, _) = post(router(manager), "/inspect/echo", b"q").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
