//! API-key-gated HTTP trigger for the deal pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use dealpress_pipeline::{DealPipeline, PipelineConfig};
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dealpress-web";

/// Paths served without a key, matching the usual API-docs allow-list.
const OPEN_PATHS: [&str; 4] = ["/openapi.json", "/docs", "/docs/oauth2-redirect", "/redoc"];

pub struct AppState {
    pipeline: Arc<DealPipeline>,
    api_key: String,
    running: AtomicBool,
}

impl AppState {
    pub fn new(pipeline: DealPipeline, api_key: impl Into<String>) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            api_key: api_key.into(),
            running: AtomicBool::new(false),
        }
    }

    fn try_begin_run(&self) -> bool {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn finish_run(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/run", post(run_handler))
        .route("/health", get(health_handler))
        .route("/docs", get(docs_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(PipelineConfig::from_env()).await
}

pub async fn serve(config: PipelineConfig) -> anyhow::Result<()> {
    let port = config.port;
    let api_key = config.app_api_key.clone();
    let pipeline = DealPipeline::new(config)?;
    let state = Arc::new(AppState::new(pipeline, api_key));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "trigger endpoint listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if OPEN_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }
    let presented = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if presented.is_empty() || presented != state.api_key {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"detail": "Unauthorized"})),
        )
            .into_response();
    }
    next.run(request).await
}

async fn run_handler(State(state): State<Arc<AppState>>) -> Response {
    if !state.try_begin_run() {
        return (
            StatusCode::CONFLICT,
            Json(serde_json::json!({"status": "already_running"})),
        )
            .into_response();
    }
    let run_id = Uuid::new_v4();
    let task_state = state.clone();
    tokio::spawn(async move {
        match task_state.pipeline.run_with_id(run_id).await {
            Ok(report) => info!(
                %run_id,
                processed = report.processed,
                skipped = report.skipped,
                errored = report.errored,
                "triggered run finished"
            ),
            Err(error) => warn!(%run_id, %error, "triggered run failed"),
        }
        task_state.finish_run();
    });
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "status": "processing_started",
            "run_id": run_id,
        })),
    )
        .into_response()
}

async fn health_handler() -> Response {
    Json(serde_json::json!({"status": "ok"})).into_response()
}

async fn docs_handler() -> Response {
    Json(serde_json::json!({
        "service": "dealpress",
        "routes": [
            {"method": "POST", "path": "/run"},
            {"method": "GET", "path": "/health"},
            {"method": "GET", "path": "/docs"},
        ],
    }))
    .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use dealpress_storage::MemoryTable;
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn test_state(work: &TempDir, api_key: &str) -> Arc<AppState> {
        let config = PipelineConfig {
            sheet_id: String::new(),
            sheet_name: "Sheet1".to_string(),
            sheets_api_base: String::new(),
            sheets_api_token: String::new(),
            app_api_key: api_key.to_string(),
            image_host_api_key: String::new(),
            image_host_endpoint: String::new(),
            catalog_api_endpoint: None,
            catalog_access_key: None,
            catalog_secret_key: None,
            catalog_partner_tag: None,
            gemini_api_key: None,
            gemini_model: "gemini-1.5-flash".to_string(),
            promo_scraper_enabled: false,
            promo_enabled: true,
            promo_default_message: "Limited-time deal available!".to_string(),
            promo_expired_message: "Deal may have ended.".to_string(),
            work_dir: work.path().join("images"),
            assets_dir: work.path().join("assets"),
            http_timeout_secs: 5,
            max_download_bytes: 5_000_000,
            port: 0,
        };
        let pipeline = DealPipeline::new(config)
            .expect("pipeline")
            .with_table(Arc::new(MemoryTable::new(Vec::new())));
        Arc::new(AppState::new(pipeline, api_key))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn missing_key_is_unauthorized() {
        let work = TempDir::new().unwrap();
        let app = app(test_state(&work, "secret"));

        let health = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_json(health).await,
            serde_json::json!({"detail": "Unauthorized"})
        );

        let run = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/run")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(run.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_key_is_unauthorized() {
        let work = TempDir::new().unwrap();
        let app = app(test_state(&work, "secret"));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .header("x-api-key", "not-the-secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn empty_configured_key_locks_everything() {
        let work = TempDir::new().unwrap();
        let app = app(test_state(&work, ""));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .header("x-api-key", "anything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn docs_is_open_without_a_key() {
        let work = TempDir::new().unwrap();
        let app = app(test_state(&work, "secret"));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/docs")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let value = body_json(resp).await;
        let routes = value["routes"].as_array().unwrap();
        assert!(routes.iter().any(|r| r["path"] == "/run"));
    }

    #[tokio::test]
    async fn good_key_passes_health() {
        let work = TempDir::new().unwrap();
        let app = app(test_state(&work, "secret"));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .header("x-api-key", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await, serde_json::json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn run_trigger_returns_accepted_with_a_run_id() {
        let work = TempDir::new().unwrap();
        let app = app(test_state(&work, "secret"));
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/run")
                    .header("x-api-key", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let value = body_json(resp).await;
        assert_eq!(value["status"], "processing_started");
        let run_id = value["run_id"].as_str().unwrap();
        assert!(run_id.parse::<Uuid>().is_ok());
    }

    #[tokio::test]
    async fn concurrent_trigger_conflicts() {
        let work = TempDir::new().unwrap();
        let state = test_state(&work, "secret");
        assert!(state.try_begin_run());

        let app = app(state.clone());
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/run")
                    .header("x-api-key", "secret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(
            body_json(resp).await,
            serde_json::json!({"status": "already_running"})
        );

        state.finish_run();
        assert!(state.try_begin_run());
    }
}
