use std::sync::Arc;

use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use regex::Regex;
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

mod analyzer;
mod config;
mod models;
mod upload;

use analyzer::{AnalysisError, Analyzer, GeminiAnalyzer};
use config::Config;
use models::{AnalyzeResponse, ErrorResponse};
use upload::UploadError;

const SHAPE_ERROR_MESSAGE: &str = "Không thể nhận được phản hồi hợp lệ từ Gemini API.";

#[derive(Clone)]
struct AppState {
    analyzer: Arc<dyn Analyzer>,
    allowed_media_types: Option<Regex>,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Loaded first so RUST_LOG from .env reaches the filter.
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    if let Err(e) = dotenv {
        tracing::debug!("no .env file loaded: {}", e);
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let analyzer = match GeminiAnalyzer::new(&config) {
        Ok(analyzer) => analyzer,
        Err(e) => {
            tracing::error!("configuration error: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(endpoint = %analyzer.endpoint(), "forwarding uploads to provider");

    let state = AppState {
        analyzer: Arc::new(analyzer),
        allowed_media_types: config.allowed_media_types.clone(),
    };
    let app = app(state, config.max_upload_bytes);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await
}

fn app(state: AppState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/analyze-food", post(analyze_food))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn analyze_food(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let upload = match upload::read_upload(multipart, state.allowed_media_types.as_ref()).await {
        Ok(upload) => upload,
        Err(e) => {
            tracing::info!("rejected upload: {}", e);
            let status = match &e {
                UploadError::Missing | UploadError::Malformed(_) => StatusCode::BAD_REQUEST,
                UploadError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
                UploadError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            };
            return error_response(status, e.to_string());
        }
    };

    match state.analyzer.analyze(upload).await {
        Ok(text) => (
            StatusCode::OK,
            Json(AnalyzeResponse {
                success: true,
                response: text,
            }),
        )
            .into_response(),
        Err(AnalysisError::Shape(raw)) => {
            tracing::error!(response = %raw, "unexpected Gemini response structure");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, SHAPE_ERROR_MESSAGE.to_string())
        }
        Err(AnalysisError::Call(reason)) => {
            tracing::error!(error = %reason, "Gemini call failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Đã xảy ra lỗi khi phân tích hình ảnh: {}", reason),
            )
        }
    }
}

fn error_response(status: StatusCode, error: String) -> Response {
    (status, Json(ErrorResponse { error })).into_response()
}
