use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::config::{Config, ConfigError};
use crate::models::{Content, GenerateContentRequest, GenerateContentResponse, InlineData, RequestPart, Upload};

// ── Constants ────────────────────────────────────────────────────────────────

const USER_AGENT: &str = "food-analysis-relay/1.0";

pub const PROMPT: &str = "Ước tính số calo và ghi chú ngắn gọn về nội dung món ăn. \
Trả lời dưới dạng: 'Calo: [số calo]. Ghi chú: [ghi chú ngắn gọn].' Trả lời bằng tiếng Việt.";

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum AnalysisError {
    /// The provider answered, but without a first candidate carrying text.
    #[error("unexpected response structure from provider")]
    Shape(Value),
    #[error("{0}")]
    Call(String),
}

// ── Analyzer seam ────────────────────────────────────────────────────────────

#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, upload: Upload) -> Result<String, AnalysisError>;
}

// ── Gemini client ────────────────────────────────────────────────────────────

pub struct GeminiAnalyzer {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Secret<String>,
}

impl GeminiAnalyzer {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        let action = format!("{}:generateContent", config.model);
        let mut endpoint = config.api_base.clone();
        endpoint
            .path_segments_mut()
            .map_err(|_| ConfigError::UnsupportedBaseUrl(config.api_base.to_string()))?
            .pop_if_empty()
            .extend(["v1beta", "models", action.as_str()]);

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key.clone(),
        })
    }

    /// Endpoint without the key, safe to log.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl Analyzer for GeminiAnalyzer {
    async fn analyze(&self, upload: Upload) -> Result<String, AnalysisError> {
        let payload = build_request(upload);

        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("key", self.api_key.expose_secret());

        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(describe_request_error)?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(%status, "provider returned a non-success status");
        }

        let body = response.text().await.map_err(describe_request_error)?;
        parse_response(&body)
    }
}

// ── Payload building ─────────────────────────────────────────────────────────

pub fn build_request(upload: Upload) -> GenerateContentRequest {
    let data = general_purpose::STANDARD.encode(&upload.bytes);
    tracing::debug!(
        media_type = %upload.media_type,
        bytes = upload.bytes.len(),
        encoded = data.len(),
        "encoded upload"
    );

    GenerateContentRequest {
        contents: vec![Content {
            role: "user".to_string(),
            parts: vec![
                RequestPart::Text {
                    text: PROMPT.to_string(),
                },
                RequestPart::InlineData {
                    inline_data: InlineData {
                        mime_type: upload.media_type,
                        data,
                    },
                },
            ],
        }],
    }
}

// ── Response parsing ─────────────────────────────────────────────────────────

pub fn parse_response(body: &str) -> Result<String, AnalysisError> {
    let raw: Value = serde_json::from_str(body).map_err(|e| AnalysisError::Call(e.to_string()))?;

    let text = GenerateContentResponse::deserialize(&raw)
        .ok()
        .and_then(GenerateContentResponse::first_text);

    match text {
        Some(text) => Ok(text),
        None => Err(AnalysisError::Shape(raw)),
    }
}

/// Flattens the error chain. The URL is dropped because it carries the API key.
fn describe_request_error(err: reqwest::Error) -> AnalysisError {
    let err = err.without_url();
    let mut message = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = std::error::Error::source(cause);
    }
    AnalysisError::Call(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path, Query, State},
        http::{header, StatusCode},
        response::{IntoResponse, Response},
        routing::post,
        Json, Router,
    };
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    // ── Stand-in provider ────────────────────────────────────────────────────

    struct Seen {
        action: String,
        key: Option<String>,
        payload: Value,
    }

    #[derive(Clone)]
    struct Provider {
        status: StatusCode,
        body: String,
        seen: Arc<Mutex<Vec<Seen>>>,
    }

    async fn generate(
        State(provider): State<Provider>,
        Path(action): Path<String>,
        Query(query): Query<HashMap<String, String>>,
        Json(payload): Json<Value>,
    ) -> Response {
        provider.seen.lock().unwrap().push(Seen {
            action,
            key: query.get("key").cloned(),
            payload,
        });
        (
            provider.status,
            [(header::CONTENT_TYPE, "application/json")],
            provider.body.clone(),
        )
            .into_response()
    }

    async fn spawn_provider(status: StatusCode, body: &str) -> (String, Arc<Mutex<Vec<Seen>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let provider = Provider {
            status,
            body: body.to_string(),
            seen: seen.clone(),
        };
        let app = Router::new()
            .route("/v1beta/models/:action", post(generate))
            .with_state(provider);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), seen)
    }

    fn analyzer_for(base: &str) -> GeminiAnalyzer {
        let config = Config::from_lookup(|name| match name {
            "GEMINI_API_KEY" => Some("test-key".to_string()),
            "GEMINI_API_BASE" => Some(base.to_string()),
            _ => None,
        })
        .unwrap();
        GeminiAnalyzer::new(&config).unwrap()
    }

    fn jpeg_upload() -> Upload {
        Upload {
            media_type: "image/jpeg".to_string(),
            bytes: vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10],
        }
    }

    // ── Payload and parsing ──────────────────────────────────────────────────

    #[test]
    fn request_payload_matches_provider_shape() {
        let payload = serde_json::to_value(build_request(jpeg_upload())).unwrap();
        assert_eq!(
            payload,
            json!({
                "contents": [{
                    "role": "user",
                    "parts": [
                        { "text": PROMPT },
                        { "inlineData": { "mimeType": "image/jpeg", "data": "/9j/4AAQ" } }
                    ]
                }]
            })
        );
    }

    #[test]
    fn first_candidate_text_is_returned_verbatim() {
        let body = r#"{"candidates":[
            {"content":{"parts":[{"text":"Calo: 250. Ghi chú: salad rau."},{"text":"ignored"}]}},
            {"content":{"parts":[{"text":"second candidate"}]}}
        ]}"#;
        assert_eq!(parse_response(body).unwrap(), "Calo: 250. Ghi chú: salad rau.");
    }

    #[test]
    fn missing_structure_is_a_shape_error() {
        for body in [
            r#"{}"#,
            r#"{"candidates":[]}"#,
            r#"{"candidates":null}"#,
            r#"{"candidates":[{}]}"#,
            r#"{"candidates":[{"content":{}}]}"#,
            r#"{"candidates":[{"content":{"parts":[]}}]}"#,
            r#"{"candidates":[{"content":{"parts":[{"inlineData":{}}]}}]}"#,
            r#"{"candidates":"nope"}"#,
            r#"{"error":{"code":400,"message":"API key not valid"}}"#,
        ] {
            match parse_response(body) {
                Err(AnalysisError::Shape(raw)) => {
                    assert_eq!(raw, serde_json::from_str::<Value>(body).unwrap())
                }
                other => panic!("expected shape error for {body}, got {other:?}"),
            }
        }
    }

    #[test]
    fn undecodable_body_is_a_call_error() {
        assert!(matches!(
            parse_response("<html>bad gateway</html>"),
            Err(AnalysisError::Call(_))
        ));
    }

    #[test]
    fn endpoint_keeps_base_path_and_omits_key() {
        let analyzer = analyzer_for("http://127.0.0.1:9/proxy/");
        assert_eq!(
            analyzer.endpoint().as_str(),
            "http://127.0.0.1:9/proxy/v1beta/models/gemini-2.0-flash:generateContent"
        );
    }

    // ── Against a live stand-in ──────────────────────────────────────────────

    #[tokio::test]
    async fn sends_payload_and_key_to_provider() {
        let (base, seen) = spawn_provider(
            StatusCode::OK,
            r#"{"candidates":[{"content":{"parts":[{"text":"Calo: 250. Ghi chú: salad rau."}]}}]}"#,
        )
        .await;

        let text = analyzer_for(&base).analyze(jpeg_upload()).await.unwrap();
        assert_eq!(text, "Calo: 250. Ghi chú: salad rau.");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].action, "gemini-2.0-flash:generateContent");
        assert_eq!(seen[0].key.as_deref(), Some("test-key"));
        let inline = &seen[0].payload["contents"][0]["parts"][1]["inlineData"];
        assert_eq!(inline["mimeType"], "image/jpeg");
        assert_eq!(inline["data"], "/9j/4AAQ");
    }

    #[tokio::test]
    async fn provider_error_body_is_a_shape_error() {
        let (base, _) = spawn_provider(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"code":400,"message":"API key not valid"}}"#,
        )
        .await;

        let err = analyzer_for(&base).analyze(jpeg_upload()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Shape(_)));
    }

    #[tokio::test]
    async fn unreachable_provider_is_a_call_error_without_key() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = analyzer_for(&format!("http://{}", addr))
            .analyze(jpeg_upload())
            .await
            .unwrap_err();
        match err {
            AnalysisError::Call(message) => {
                assert!(!message.is_empty());
                assert!(!message.contains("test-key"));
            }
            other => panic!("expected call error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn every_call_reaches_the_provider() {
        let (base, seen) = spawn_provider(
            StatusCode::OK,
            r#"{"candidates":[{"content":{"parts":[{"text":"ok"}]}}]}"#,
        )
        .await;

        let analyzer = analyzer_for(&base);
        analyzer.analyze(jpeg_upload()).await.unwrap();
        analyzer.analyze(jpeg_upload()).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
