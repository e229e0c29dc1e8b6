//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;

/// Default interval between phone-candidate poll ticks.
pub const DEFAULT_PHONE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Where the backend lives and which paths it exposes.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Base URL of the REST backend, without trailing slash.
    pub base_url: String,
    /// Timeout applied to every HTTP request.
    pub request_timeout: Duration,
    /// Destination tree for a root perimeter. `{id}` is replaced.
    pub tree_path: String,
    /// Visit registration for the generic flow.
    pub visit_path: String,
    /// Visit registration for the kiosk flow.
    pub kiosk_visit_path: String,
    /// Phone verification. `/solicitar` and `/confirmar` are appended.
    pub verify_path: String,
    /// Document recognition.
    pub recognition_path: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            request_timeout: Duration::from_secs(15),
            tree_path: "/perimetros/{id}/arbol".to_string(),
            visit_path: "/visitas".to_string(),
            kiosk_visit_path: "/visitas/kiosco".to_string(),
            verify_path: "/telefonos/verificacion".to_string(),
            recognition_path: "/documentos/reconocer".to_string(),
        }
    }
}

impl BackendConfig {
    /// Build from environment variables. `BITACORA_API_URL` is required.
    pub fn from_env() -> Result<Self, ConfigError> {
        let base_url = std::env::var("BITACORA_API_URL")
            .map_err(|_| ConfigError::MissingEnvVar("BITACORA_API_URL".to_string()))?;
        let base_url = normalize_base_url(&base_url)?;

        let request_timeout = match std::env::var("BITACORA_HTTP_TIMEOUT_SECS") {
            Ok(raw) => Duration::from_secs(raw.trim().parse().map_err(|_| {
                ConfigError::InvalidValue {
                    key: "BITACORA_HTTP_TIMEOUT_SECS".to_string(),
                    message: format!("expected whole seconds, got {raw:?}"),
                }
            })?),
            Err(_) => Duration::from_secs(15),
        };

        Ok(Self {
            base_url,
            request_timeout,
            ..Default::default()
        })
    }

    /// Join a path onto the base URL.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }

    /// URL of the destination tree rooted at `root_id`.
    pub fn tree_url(&self, root_id: i64) -> String {
        self.url(&self.tree_path.replace("{id}", &root_id.to_string()))
    }

    /// Build a reqwest client with the configured timeout.
    pub fn http_client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(self.request_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Falling back to default HTTP client: {e}");
                reqwest::Client::new()
            })
    }
}

fn normalize_base_url(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ConfigError::InvalidValue {
            key: "BITACORA_API_URL".to_string(),
            message: format!("expected an http(s) URL, got {raw:?}"),
        });
    }
    Ok(trimmed.to_string())
}

/// Kiosk phone-candidate polling.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Time between ticks.
    pub interval: Duration,
    /// Candidate endpoints in priority order (absolute URLs).
    pub endpoints: Vec<String>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_PHONE_POLL_INTERVAL,
            endpoints: Vec::new(),
        }
    }
}

impl PollerConfig {
    /// Build from `BITACORA_PHONE_POLL_SECS` and `BITACORA_PHONE_ENDPOINTS`.
    pub fn from_env() -> Self {
        let interval = std::env::var("BITACORA_PHONE_POLL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PHONE_POLL_INTERVAL);

        let endpoints: Vec<String> = std::env::var("BITACORA_PHONE_ENDPOINTS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            interval,
            endpoints,
        }
    }
}
