//! Kiosk phone-candidate poller.
//!
//! While running, every tick queries the candidate endpoints in priority
//! order and keeps the list from the first one that answers. A tick where
//! every endpoint fails keeps the previous list; the error flag is only
//! raised when no endpoint has ever answered.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{BackendConfig, PollerConfig};
use crate::error::FetchError;
use crate::session::SessionContext;

/// One endpoint that lists pre-registered phone numbers.
#[async_trait]
pub trait PhoneSource: Send + Sync {
    /// Identifier used in logs and in `CandidateSnapshot::last_source`.
    fn name(&self) -> &str;

    async fn fetch(&self, session: &SessionContext) -> Result<Vec<String>, FetchError>;
}

/// Read-only view of the poller's state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandidateSnapshot {
    pub phones: Vec<String>,
    /// Set when every endpoint failed and none has ever answered.
    pub error: bool,
    /// Endpoint that produced `phones`.
    pub last_source: Option<String>,
    /// Whether any endpoint has answered since the poller was created.
    pub populated: bool,
}

/// Periodic poller with an explicit start/stop handle.
pub struct PhonePoller {
    sources: Arc<Vec<Arc<dyn PhoneSource>>>,
    session: Arc<SessionContext>,
    interval: Duration,
    snapshot: Arc<RwLock<CandidateSnapshot>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PhonePoller {
    pub fn new(
        sources: Vec<Arc<dyn PhoneSource>>,
        session: Arc<SessionContext>,
        interval: Duration,
    ) -> Self {
        Self {
            sources: Arc::new(sources),
            session,
            interval,
            snapshot: Arc::new(RwLock::new(CandidateSnapshot::default())),
            task: Mutex::new(None),
        }
    }

    /// Build a poller over HTTP endpoints listed in `config`.
    pub fn from_config(
        config: &PollerConfig,
        backend: &BackendConfig,
        session: Arc<SessionContext>,
    ) -> Self {
        let client = backend.http_client();
        let sources: Vec<Arc<dyn PhoneSource>> = config
            .endpoints
            .iter()
            .map(|url| {
                Arc::new(HttpPhoneSource::with_client(url.clone(), client.clone()))
                    as Arc<dyn PhoneSource>
            })
            .collect();
        Self::new(sources, session, config.interval)
    }

    /// Start the periodic task. Returns `false` if it was already running.
    pub fn start(&self) -> bool {
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            debug!("Phone poller already running");
            return false;
        }

        let sources = Arc::clone(&self.sources);
        let session = Arc::clone(&self.session);
        let snapshot = Arc::clone(&self.snapshot);
        let period = self.interval;

        info!(
            endpoints = sources.len(),
            interval_ms = period.as_millis() as u64,
            "Phone poller started"
        );

        *task = Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                poll_sources(&sources, &session, &snapshot).await;
            }
        }));
        true
    }

    /// Cancel the periodic task. Returns `false` if it was not running.
    pub fn stop(&self) -> bool {
        let handle = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match handle {
            Some(h) => {
                h.abort();
                info!("Phone poller stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Run a single tick in the caller's task.
    pub async fn poll_once(&self) -> CandidateSnapshot {
        poll_sources(&self.sources, &self.session, &self.snapshot).await;
        self.snapshot().await
    }

    pub async fn snapshot(&self) -> CandidateSnapshot {
        self.snapshot.read().await.clone()
    }
}

impl Drop for PhonePoller {
    fn drop(&mut self) {
        if let Some(h) = self.task.get_mut().unwrap_or_else(|e| e.into_inner()).take() {
            h.abort();
        }
    }
}

async fn poll_sources(
    sources: &[Arc<dyn PhoneSource>],
    session: &SessionContext,
    snapshot: &RwLock<CandidateSnapshot>,
) {
    for source in sources {
        match source.fetch(session).await {
            Ok(phones) => {
                debug!(source = source.name(), count = phones.len(), "Phone candidates refreshed");
                let mut snap = snapshot.write().await;
                snap.phones = phones;
                snap.error = false;
                snap.last_source = Some(source.name().to_string());
                snap.populated = true;
                return;
            }
            Err(e) => {
                warn!(source = source.name(), "Phone candidate endpoint failed: {e}");
            }
        }
    }

    let mut snap = snapshot.write().await;
    if !snap.populated {
        snap.error = true;
    }
}

/// `PhoneSource` reading one URL.
pub struct HttpPhoneSource {
    url: String,
    client: reqwest::Client,
}

impl HttpPhoneSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_client(url.into(), reqwest::Client::new())
    }

    pub fn with_client(url: String, client: reqwest::Client) -> Self {
        Self { url, client }
    }
}

#[async_trait]
impl PhoneSource for HttpPhoneSource {
    fn name(&self) -> &str {
        &self.url
    }

    async fn fetch(&self, session: &SessionContext) -> Result<Vec<String>, FetchError> {
        let resp = self
            .client
            .get(&self.url)
            .header(reqwest::header::AUTHORIZATION, session.bearer())
            .send()
            .await
            .map_err(|e| FetchError::Network {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Server {
                url: self.url.clone(),
                status: status.as_u16(),
            });
        }

        let body: serde_json::Value = resp.json().await.map_err(|e| FetchError::Parse {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;

        parse_phone_list(&body).map_err(|reason| FetchError::Parse {
            url: self.url.clone(),
            reason,
        })
    }
}

/// Accepts `["55..."]`, `{"telefonos": [...]}`, `{"phones": [...]}` or
/// `{"data": [...]}`. Items may be strings or objects with a `telefono`
/// or `phone` field.
pub(crate) fn parse_phone_list(body: &serde_json::Value) -> Result<Vec<String>, String> {
    let items = match body {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(map) => ["telefonos", "phones", "data"]
            .iter()
            .find_map(|k| map.get(*k).and_then(|v| v.as_array()))
            .ok_or_else(|| "no phone array in response".to_string())?,
        _ => return Err("unexpected response shape".to_string()),
    };

    let phones = items
        .iter()
        .filter_map(|item| match item {
            serde_json::Value::String(s) => Some(s.trim().to_string()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Object(obj) => obj
                .get("telefono")
                .or_else(|| obj.get("phone"))
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string()),
            _ => None,
        })
        .filter(|s| !s.is_empty())
        .collect();
    Ok(phones)
}
