use regex::Regex;
use secrecy::Secret;
use url::Url;

// ── Defaults ─────────────────────────────────────────────────────────────────

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com";
/// Gemini inline-data ceiling.
const DEFAULT_MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("GEMINI_API_KEY is not configured")]
    MissingApiKey,
    #[error("{name} is not a valid number: {value}")]
    InvalidNumber { name: &'static str, value: String },
    #[error("ALLOWED_MEDIA_TYPES is not a valid pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
    #[error("GEMINI_API_BASE is not a valid URL: {0}")]
    InvalidBaseUrl(#[from] url::ParseError),
    #[error("GEMINI_API_BASE cannot carry a path: {0}")]
    UnsupportedBaseUrl(String),
    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

// ── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Config {
    pub api_key: Secret<String>,
    pub port: u16,
    pub model: String,
    pub api_base: Url,
    /// When set, uploads whose declared media type does not match are refused.
    pub allowed_media_types: Option<Regex>,
    pub max_upload_bytes: usize,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let api_key = get("GEMINI_API_KEY").ok_or(ConfigError::MissingApiKey)?;

        let port = match get("PORT") {
            Some(raw) => parse_number("PORT", &raw)?,
            None => DEFAULT_PORT,
        };

        let max_upload_bytes = match get("MAX_UPLOAD_BYTES") {
            Some(raw) => parse_number("MAX_UPLOAD_BYTES", &raw)?,
            None => DEFAULT_MAX_UPLOAD_BYTES,
        };

        let model = get("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let api_base = Url::parse(&get("GEMINI_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()))?;
        if api_base.cannot_be_a_base() {
            return Err(ConfigError::UnsupportedBaseUrl(api_base.to_string()));
        }

        let allowed_media_types = get("ALLOWED_MEDIA_TYPES")
            .map(|pattern| Regex::new(&pattern))
            .transpose()?;

        Ok(Self {
            api_key: Secret::new(api_key),
            port,
            model,
            api_base,
            allowed_media_types,
            max_upload_bytes,
        })
    }
}

fn parse_number<T: std::str::FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidNumber {
        name,
        value: raw.to_string(),
    })
}
