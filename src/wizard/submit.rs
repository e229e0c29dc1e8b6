//! Registration submitter: turns a finished wizard into one create-visit
//! request.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::config::BackendConfig;
use crate::error::{SubmitError, ValidationError};
use crate::session::SessionContext;

use super::policy::WizardPolicy;
use super::state::WizardState;

/// Body of the create-visit request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisitPayload {
    #[serde(rename = "nombre")]
    pub first_name: String,
    #[serde(rename = "apellido_paterno")]
    pub paternal_surname: String,
    #[serde(rename = "apellido_materno")]
    pub maternal_surname: String,
    #[serde(rename = "telefono")]
    pub phone: String,
    #[serde(rename = "perimetro_id", skip_serializing_if = "Option::is_none")]
    pub destination_id: Option<i64>,
    #[serde(rename = "destino", skip_serializing_if = "Option::is_none")]
    pub destination_label: Option<String>,
    #[serde(rename = "documento", skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    #[serde(rename = "fotos")]
    pub photos: Vec<String>,
    #[serde(rename = "fecha")]
    pub registered_at: DateTime<Utc>,
    #[serde(rename = "usuario_id")]
    pub registered_by: i64,
    #[serde(rename = "origen", skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// Endpoint plus payload, built while the wizard state is locked.
#[derive(Debug, Clone)]
pub struct PreparedVisit {
    pub endpoint: String,
    pub payload: VisitPayload,
}

/// The visit-registration backend.
#[async_trait]
pub trait VisitService: Send + Sync {
    async fn register_visit(
        &self,
        session: &SessionContext,
        endpoint: &str,
        payload: &VisitPayload,
    ) -> Result<(), SubmitError>;
}

/// `VisitService` backed by the REST API.
pub struct HttpVisitService {
    client: reqwest::Client,
}

impl HttpVisitService {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            client: config.http_client(),
        }
    }
}

#[async_trait]
impl VisitService for HttpVisitService {
    async fn register_visit(
        &self,
        session: &SessionContext,
        endpoint: &str,
        payload: &VisitPayload,
    ) -> Result<(), SubmitError> {
        let resp = self
            .client
            .post(endpoint)
            .header(reqwest::header::AUTHORIZATION, session.bearer())
            .json(payload)
            .send()
            .await
            .map_err(|e| SubmitError::Network(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        Err(SubmitError::Server {
            status: status.as_u16(),
            body,
        })
    }
}

/// Validates, builds and sends visits. Never retries on its own.
pub struct RegistrationSubmitter {
    service: Arc<dyn VisitService>,
    config: BackendConfig,
}

impl RegistrationSubmitter {
    pub fn new(service: Arc<dyn VisitService>, config: BackendConfig) -> Self {
        Self { service, config }
    }

    /// HTTP-backed submitter for `config`.
    pub fn http(config: BackendConfig) -> Self {
        let service = Arc::new(HttpVisitService::new(&config));
        Self::new(service, config)
    }

    /// Local checks and payload assembly. No I/O.
    pub fn prepare(
        &self,
        policy: &dyn WizardPolicy,
        state: &WizardState,
        session: &SessionContext,
    ) -> Result<PreparedVisit, ValidationError> {
        let payload = policy.build_payload(state, session, Utc::now())?;
        Ok(PreparedVisit {
            endpoint: policy.endpoint(&self.config),
            payload,
        })
    }

    /// Send a prepared visit once.
    pub async fn send(
        &self,
        session: &SessionContext,
        visit: &PreparedVisit,
    ) -> Result<(), SubmitError> {
        let result = self
            .service
            .register_visit(session, &visit.endpoint, &visit.payload)
            .await;
        match &result {
            Ok(()) => info!(endpoint = %visit.endpoint, "Visit registered"),
            Err(e) => error!(endpoint = %visit.endpoint, "Visit registration failed: {e}"),
        }
        result
    }

    /// `prepare` then `send`.
    pub async fn submit(
        &self,
        policy: &dyn WizardPolicy,
        state: &WizardState,
        session: &SessionContext,
    ) -> Result<(), SubmitError> {
        let visit = self.prepare(policy, state, session)?;
        self.send(session, &visit).await
    }
}
