//! Identity-document recognition collaborator.

use async_trait::async_trait;
use tracing::debug;

use crate::config::BackendConfig;
use crate::error::RecognitionError;
use crate::session::SessionContext;
use crate::wizard::{IdentityFields, ImageRef};

/// Extracts identity fields from a photographed document.
#[async_trait]
pub trait DocumentRecognizer: Send + Sync {
    async fn recognize(
        &self,
        session: &SessionContext,
        image: &ImageRef,
    ) -> Result<IdentityFields, RecognitionError>;
}

/// `DocumentRecognizer` backed by the REST API.
pub struct HttpDocumentRecognizer {
    url: String,
    client: reqwest::Client,
}

impl HttpDocumentRecognizer {
    pub fn new(config: &BackendConfig) -> Self {
        Self {
            url: config.url(&config.recognition_path),
            client: config.http_client(),
        }
    }
}

#[async_trait]
impl DocumentRecognizer for HttpDocumentRecognizer {
    async fn recognize(
        &self,
        session: &SessionContext,
        image: &ImageRef,
    ) -> Result<IdentityFields, RecognitionError> {
        debug!(url = %self.url, "Requesting document recognition");
        let resp = self
            .client
            .post(&self.url)
            .header(reqwest::header::AUTHORIZATION, session.bearer())
            .json(&serde_json::json!({ "imagen": image.as_str() }))
            .send()
            .await
            .map_err(|e| RecognitionError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RecognitionError::Server {
                status: status.as_u16(),
            });
        }

        let fields: IdentityFields = resp
            .json()
            .await
            .map_err(|e| RecognitionError::Unreadable(e.to_string()))?;

        if fields.is_blank() {
            return Err(RecognitionError::Unreadable(
                "no identity fields recognized".to_string(),
            ));
        }
        Ok(fields)
    }
}
