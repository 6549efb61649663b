use crate::config::ApiConfig;
use crate::stages::{AnalyzeSentimentStage, FeedbackRequest, FeedbackResponse};
use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use prism_pipeline::{CancellationToken, PipelineError, StatusRecord, StatusStore};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Header carrying the caller's correlation id
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub sentiment: Arc<AnalyzeSentimentStage>,
    pub status: Option<Arc<dyn StatusStore>>,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            code: code.to_string(),
        }),
    )
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/v1/feedback", post(submit_feedback))
        .route("/api/v1/status/:base_id", get(get_status))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "prism-analysis"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let Some(store) = &state.status else {
        return (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "disabled"
            })),
        );
    };

    match store.ping().await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Score feedback sentiment and return it to the caller
#[instrument(skip(state, headers, request))]
async fn submit_feedback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<FeedbackRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if request.comment.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "INVALID_REQUEST",
            "comment must not be empty",
        ));
    }

    let correlation_id = headers
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let response: FeedbackResponse = state
        .sentiment
        .analyze(&correlation_id, request)
        .await
        .map_err(|e| {
            error!(error = %e, correlation_id = %correlation_id, "Sentiment analysis failed");
            match e {
                PipelineError::Capability { .. } => api_error(
                    StatusCode::BAD_GATEWAY,
                    "CAPABILITY_ERROR",
                    "Sentiment analysis failed",
                ),
                _ => api_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "Failed to store sentiment result",
                ),
            }
        })?;

    let mut response_headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response_headers.insert(CORRELATION_ID_HEADER, value);
    }

    Ok((response_headers, Json(response)))
}

/// Current lifecycle status of a base identifier
#[instrument(skip(state))]
async fn get_status(
    State(state): State<AppState>,
    Path(base_id): Path<String>,
) -> Result<Json<StatusRecord>, ApiError> {
    let Some(store) = &state.status else {
        return Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "STATUS_DISABLED",
            "Status tracking is not configured",
        ));
    };

    let record = store.get(&base_id).await.map_err(|e| {
        error!(error = %e, "Failed to get status");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "QUERY_ERROR",
            "Failed to get status",
        )
    })?;

    match record {
        Some(record) => Ok(Json(record)),
        None => Err(api_error(
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "Identifier not found",
        )),
    }
}

/// Start the API server, shutting down gracefully when `cancel` fires
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting feedback API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
            warn!("API server shutting down");
        })
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{MockSentimentAnalyzer, SentimentResult, SentimentScore};
    use crate::stages::testing::{fixture, Fixture, BUCKET};
    use axum::body::Body;
    use axum::http::Request;
    use prism_pipeline::PipelineStatus;
    use tower::ServiceExt;

    fn neutral() -> SentimentResult {
        SentimentResult {
            sentiment: "NEUTRAL".to_string(),
            sentiment_score: SentimentScore {
                neutral: 0.8,
                ..Default::default()
            },
        }
    }

    fn app(fx: &Fixture, analyzer: MockSentimentAnalyzer) -> Router {
        let state = AppState {
            sentiment: Arc::new(AnalyzeSentimentStage::new(
                fx.ctx.clone(),
                Arc::new(analyzer),
                BUCKET,
                "en",
            )),
            status: fx.ctx.status.clone(),
        };
        create_router(state, &ApiConfig::default())
    }

    fn feedback(body: &str, correlation_id: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/v1/feedback")
            .header("content-type", "application/json");
        if let Some(id) = correlation_id {
            builder = builder.header(CORRELATION_ID_HEADER, id);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let fx = fixture(false);
        let response = app(&fx, MockSentimentAnalyzer::new())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "healthy");
    }

    #[tokio::test]
    async fn test_feedback_returns_sentiment_and_persists() {
        let fx = fixture(false);
        let mut analyzer = MockSentimentAnalyzer::new();
        analyzer
            .expect_detect_sentiment()
            .withf(|text, language| text == "It was fine" && language == "en")
            .returning(|_, _| Ok(neutral()));

        let response = app(&fx, analyzer)
            .oneshot(feedback(r#"{"comment": "It was fine"}"#, Some("corr-42")))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CORRELATION_ID_HEADER).unwrap(),
            "corr-42"
        );
        let body = json_body(response).await;
        assert_eq!(body["comment"], "It was fine");
        assert_eq!(body["sentiment"]["Sentiment"], "NEUTRAL");
        assert!(fx.store.contains(BUCKET, "comprehend-artifacts/corr-42.json"));
    }

    #[tokio::test]
    async fn test_feedback_generates_correlation_id() {
        let fx = fixture(false);
        let mut analyzer = MockSentimentAnalyzer::new();
        analyzer
            .expect_detect_sentiment()
            .returning(|_, _| Ok(neutral()));

        let response = app(&fx, analyzer)
            .oneshot(feedback(r#"{"lang": "en", "comment": "ok"}"#, None))
            .await
            .unwrap();

        let id = response
            .headers()
            .get(CORRELATION_ID_HEADER)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(Uuid::parse_str(&id).is_ok());
        assert!(fx
            .store
            .contains(BUCKET, &format!("comprehend-artifacts/{}.json", id)));
    }

    #[tokio::test]
    async fn test_feedback_rejects_empty_comment() {
        let fx = fixture(false);
        let mut analyzer = MockSentimentAnalyzer::new();
        analyzer.expect_detect_sentiment().never();

        let response = app(&fx, analyzer)
            .oneshot(feedback(r#"{"comment": "   "}"#, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn test_feedback_capability_error_is_bad_gateway() {
        let fx = fixture(false);
        let mut analyzer = MockSentimentAnalyzer::new();
        analyzer
            .expect_detect_sentiment()
            .returning(|_, _| Err(PipelineError::capability("comprehend", "throttled")));

        let response = app(&fx, analyzer)
            .oneshot(feedback(r#"{"comment": "hello"}"#, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(fx.store.keys(BUCKET).is_empty());
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let fx = fixture(true);
        fx.status
            .as_ref()
            .unwrap()
            .advance("req-1", PipelineStatus::Labeled)
            .await
            .unwrap();
        let router = app(&fx, MockSentimentAnalyzer::new());

        let response = router
            .clone()
            .oneshot(Request::get("/api/v1/status/req-1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "labeled");

        let response = router
            .oneshot(Request::get("/api/v1/status/req-9").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    struct UnreachableStore;

    #[async_trait::async_trait]
    impl StatusStore for UnreachableStore {
        async fn advance(
            &self,
            _base_id: &str,
            _status: PipelineStatus,
        ) -> prism_pipeline::Result<StatusRecord> {
            Err(PipelineError::Transport("connection refused".to_string()))
        }

        async fn get(&self, _base_id: &str) -> prism_pipeline::Result<Option<StatusRecord>> {
            Ok(None)
        }

        async fn ping(&self) -> prism_pipeline::Result<()> {
            Err(PipelineError::Transport("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_readiness_pings_status_store() {
        let fx = fixture(true);
        let response = app(&fx, MockSentimentAnalyzer::new())
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["database"], "connected");

        let state = AppState {
            sentiment: Arc::new(AnalyzeSentimentStage::new(
                fx.ctx.clone(),
                Arc::new(MockSentimentAnalyzer::new()),
                BUCKET,
                "en",
            )),
            status: Some(Arc::new(UnreachableStore)),
        };
        let response = create_router(state, &ApiConfig::default())
            .oneshot(Request::get("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json_body(response).await;
        assert_eq!(body["database"], "disconnected");
        assert!(body["error"].as_str().unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_status_endpoint_without_store() {
        let fx = fixture(false);
        let response = app(&fx, MockSentimentAnalyzer::new())
            .oneshot(Request::get("/api/v1/status/req-1").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
