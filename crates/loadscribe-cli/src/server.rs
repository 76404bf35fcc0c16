//! HTTP front end over the report builder and the analysis pipeline.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span, warn, Span};
use uuid::Uuid;

use loadscribe_core::config::parse_time_ms;
use loadscribe_core::ReportConfig;
use loadscribe_runtime::{
    analysis_pipeline, AnalysisPipeline, ProviderRegistry, ReportBuilder, RuntimeError,
};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    config: Arc<ReportConfig>,
    builder: Arc<ReportBuilder>,
    pipeline: Option<Arc<AnalysisPipeline>>,
}

impl AppState {
    pub fn new(
        config: ReportConfig,
        builder: ReportBuilder,
        pipeline: Option<Arc<AnalysisPipeline>>,
    ) -> Self {
        let builder = match &pipeline {
            Some(p) => builder.with_analysis(p.clone()),
            None => builder,
        };
        Self {
            config: Arc::new(config),
            builder: Arc::new(builder),
            pipeline,
        }
    }

    /// Reports still work when the analysis pipeline cannot be built.
    pub fn from_config(config: ReportConfig) -> Result<Self, RuntimeError> {
        let builder = ReportBuilder::from_config(&config)?;
        let pipeline = if config.analysis.enabled {
            match analysis_pipeline(&config) {
                Ok(pipeline) => Some(Arc::new(pipeline)),
                Err(e) => {
                    warn!(error = %e, "Analysis pipeline unavailable");
                    None
                }
            }
        } else {
            None
        };
        Ok(Self::new(config, builder, pipeline))
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => {
                error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(json!({"status": "error", "message": message}))).into_response()
    }
}

/// Epoch milliseconds or `YYYY-MM-DDTHH:MM`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TimeValue {
    Millis(i64),
    Text(String),
}

#[derive(Debug, Default, Deserialize)]
pub struct RangeRequest {
    #[serde(default)]
    pub start: Option<TimeValue>,
    #[serde(default)]
    pub end: Option<TimeValue>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReportRequest {
    #[serde(default)]
    pub service: Option<String>,
    #[serde(flatten)]
    pub range: RangeRequest,
}

impl RangeRequest {
    fn resolve(&self, config: &ReportConfig) -> Result<(i64, i64), ApiError> {
        let (Some(start), Some(end)) = (&self.start, &self.end) else {
            return Err(ApiError::BadRequest("Missing 'start' or 'end' parameter".to_string()));
        };
        let offset = config.analysis.offset();
        let to_ms = |value: &TimeValue| match value {
            TimeValue::Millis(ms) => Ok(*ms),
            TimeValue::Text(text) => {
                parse_time_ms(text, &offset).map_err(|e| ApiError::BadRequest(e.to_string()))
            }
        };

        let (start_ms, end_ms) = (to_ms(start)?, to_ms(end)?);
        if end_ms <= start_ms {
            return Err(ApiError::BadRequest("'end' must be after 'start'".to_string()));
        }
        Ok((start_ms, end_ms))
    }
}

fn pipeline(state: &AppState) -> Result<&AnalysisPipeline, ApiError> {
    state
        .pipeline
        .as_deref()
        .ok_or_else(|| ApiError::Unavailable("Analysis is not available".to_string()))
}

pub async fn health() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

pub async fn services(State(state): State<AppState>) -> Json<Value> {
    Json(json!({"services": state.config.service_names()}))
}

pub async fn config_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "analysis_available": state.pipeline.is_some(),
        "config": state.config.summary(),
        "llm": ProviderRegistry::with_defaults().check(&state.config.llm),
    }))
}

pub async fn create_report(
    State(state): State<AppState>,
    body: Option<Json<ReportRequest>>,
) -> Result<Json<Value>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let service = request
        .service
        .ok_or_else(|| ApiError::BadRequest("Missing 'service' parameter".to_string()))?;
    let (start_ms, end_ms) = request.range.resolve(&state.config)?;

    info!(service = %service, start_ms, end_ms, "Report requested");
    let outcome = state
        .builder
        .build(&service, start_ms, end_ms)
        .await
        .map_err(|e| match e {
            RuntimeError::UnknownService(name) => {
                ApiError::NotFound(format!("Unknown service: '{}'", name))
            }
            other => ApiError::Internal(other.to_string()),
        })?;

    Ok(Json(json!({"status": "success", "data": outcome})))
}

pub async fn analyze(
    State(state): State<AppState>,
    body: Option<Json<RangeRequest>>,
) -> Result<Json<Value>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let (start_ms, end_ms) = request.resolve(&state.config)?;
    let pipeline = pipeline(&state)?;

    let report = pipeline
        .run(start_ms, end_ms)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({"status": "success", "data": report.to_json()})))
}

pub async fn analyze_domain(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    body: Option<Json<RangeRequest>>,
) -> Result<Json<Value>, ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let (start_ms, end_ms) = request.resolve(&state.config)?;
    let pipeline = pipeline(&state)?;
    let config = pipeline
        .domain(&domain)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown domain: '{}'", domain)))?;

    let analysis = pipeline
        .analyze_domain(config, start_ms, end_ms)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(json!({
        "status": "success",
        "domain": analysis.name,
        "text": analysis.answer_text(),
        "parsed": analysis.structured(),
    })))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/services", get(services))
        .route("/config/check", get(config_check))
        .route("/reports", post(create_report))
        .route("/analyze", post(analyze))
        .route("/analyze/:domain", post(analyze_domain))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request| {
                    info_span!(
                        "http_request",
                        request_id = %Uuid::new_v4(),
                        method = %request.method(),
                        uri = %request.uri(),
                    )
                })
                .on_response(|response: &Response, latency: Duration, _span: &Span| {
                    let status = response.status();
                    let latency_ms = latency.as_millis();
                    if status.is_server_error() {
                        error!(status = %status, latency_ms, "request failed with server error");
                    } else if status.is_client_error() {
                        warn!(status = %status, latency_ms, "request failed with client error");
                    } else {
                        info!(status = %status, latency_ms, "request completed");
                    }
                })
                .on_failure(
                    |failure: ServerErrorsFailureClass, latency: Duration, _span: &Span| {
                        error!(failure = ?failure, latency_ms = latency.as_millis(), "request failed");
                    },
                ),
        )
}

pub async fn serve(config: ReportConfig, addr: &str) -> anyhow::Result<()> {
    let state = AppState::from_config(config)?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
wiki:
  url: http://wiki.local
  username: reporter
  password: secret
grafana:
  base_url: http://grafana.local
analysis:
  utc_offset_hours: 0
services:
  checkout:
    template_page_id: "100"
    parent_page_id: "10"
"#;

    fn state() -> AppState {
        let config = ReportConfig::from_yaml(CONFIG).unwrap();
        let builder = ReportBuilder::from_config(&config).unwrap();
        AppState::new(config, builder, None)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let Json(body) = health().await;
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_services_lists_config() {
        let Json(body) = services(State(state())).await;
        assert_eq!(body["services"], json!(["checkout"]));
    }

    #[tokio::test]
    async fn test_config_check_reports_llm_problem() {
        let Json(body) = config_check(State(state())).await;
        assert_eq!(body["analysis_available"], false);
        assert_eq!(body["config"]["services"], json!(["checkout"]));
        assert_eq!(body["llm"]["ok"], false);
        assert!(!body.to_string().contains("secret"));
    }

    #[tokio::test]
    async fn test_analyze_without_range_is_bad_request() {
        let response = analyze(State(state()), None).await.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().unwrap().contains("start"));
    }

    #[tokio::test]
    async fn test_analyze_without_pipeline_is_unavailable() {
        let request = RangeRequest {
            start: Some(TimeValue::Text("2025-02-21T08:00".to_string())),
            end: Some(TimeValue::Millis(1_740_128_400_000)),
        };
        let response = analyze(State(state()), Some(Json(request)))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_report_requires_service() {
        let request = ReportRequest {
            service: None,
            range: RangeRequest {
                start: Some(TimeValue::Millis(0)),
                end: Some(TimeValue::Millis(1000)),
            },
        };
        let response = create_report(State(state()), Some(Json(request)))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_range_resolution() {
        let config = ReportConfig::from_yaml(CONFIG).unwrap();

        let request: RangeRequest =
            serde_json::from_value(json!({"start": "2025-02-21T08:00", "end": 1_740_128_400_000_i64}))
                .unwrap();
        assert_eq!(
            request.resolve(&config).unwrap(),
            (1_740_124_800_000, 1_740_128_400_000)
        );

        let reversed: RangeRequest =
            serde_json::from_value(json!({"start": 2000, "end": 1000})).unwrap();
        assert!(matches!(reversed.resolve(&config), Err(ApiError::BadRequest(_))));
    }
}
