//! SMS code verification of the visitor's phone.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::BackendConfig;
use crate::error::VerificationError;
use crate::session::SessionContext;

/// Sends and checks one-time codes for a phone number.
#[async_trait]
pub trait PhoneVerifier: Send + Sync {
    /// Ask the backend to send a code to `phone`.
    async fn request_code(
        &self,
        session: &SessionContext,
        phone: &str,
    ) -> Result<(), VerificationError>;

    /// Check `code` for `phone`. `Ok(false)` means the code was wrong.
    async fn confirm_code(
        &self,
        session: &SessionContext,
        phone: &str,
        code: &str,
    ) -> Result<bool, VerificationError>;
}

/// `PhoneVerifier` backed by the REST API.
pub struct HttpPhoneVerifier {
    config: BackendConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ConfirmResponse {
    #[serde(alias = "verificado", alias = "valid")]
    verified: bool,
}

impl HttpPhoneVerifier {
    pub fn new(config: BackendConfig) -> Self {
        let client = config.http_client();
        Self { config, client }
    }

    async fn post(
        &self,
        session: &SessionContext,
        suffix: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, VerificationError> {
        let url = self.config.url(&format!("{}{suffix}", self.config.verify_path));
        let resp = self
            .client
            .post(&url)
            .header(reqwest::header::AUTHORIZATION, session.bearer())
            .json(&body)
            .send()
            .await
            .map_err(|e| VerificationError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            warn!(url = %url, status, "Phone verification request rejected");
            return Err(VerificationError::Server { status });
        }
        Ok(resp)
    }
}

#[async_trait]
impl PhoneVerifier for HttpPhoneVerifier {
    async fn request_code(
        &self,
        session: &SessionContext,
        phone: &str,
    ) -> Result<(), VerificationError> {
        self.post(session, "/solicitar", serde_json::json!({ "telefono": phone }))
            .await?;
        info!("Verification code requested");
        Ok(())
    }

    async fn confirm_code(
        &self,
        session: &SessionContext,
        phone: &str,
        code: &str,
    ) -> Result<bool, VerificationError> {
        let resp = self
            .post(
                session,
                "/confirmar",
                serde_json::json!({ "telefono": phone, "codigo": code }),
            )
            .await?;
        let parsed: ConfirmResponse = resp
            .json()
            .await
            .map_err(|e| VerificationError::Network(e.to_string()))?;
        Ok(parsed.verified)
    }
}
