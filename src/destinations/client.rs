//! Fetching the destination tree from the backend.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::BackendConfig;
use crate::error::FetchError;
use crate::session::SessionContext;

use super::model::{DestinationNode, DestinationTree};

/// Source of destination trees.
#[async_trait]
pub trait TreeFetcher: Send + Sync {
    /// Fetch the full tree below `root_id`.
    async fn fetch_tree(
        &self,
        session: &SessionContext,
        root_id: i64,
    ) -> Result<DestinationTree, FetchError>;
}

/// `TreeFetcher` backed by the REST API.
pub struct HttpTreeFetcher {
    config: BackendConfig,
    client: reqwest::Client,
}

impl HttpTreeFetcher {
    pub fn new(config: BackendConfig) -> Self {
        let client = config.http_client();
        Self { config, client }
    }
}

#[async_trait]
impl TreeFetcher for HttpTreeFetcher {
    async fn fetch_tree(
        &self,
        session: &SessionContext,
        root_id: i64,
    ) -> Result<DestinationTree, FetchError> {
        let url = self.config.tree_url(root_id);
        debug!(url = %url, "Fetching destination tree");

        let resp = self
            .client
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, session.bearer())
            .send()
            .await
            .map_err(|e| FetchError::Network {
                url: url.clone(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Server {
                url,
                status: status.as_u16(),
            });
        }

        let body: serde_json::Value = resp.json().await.map_err(|e| FetchError::Parse {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        let tree = parse_tree(body).map_err(|reason| FetchError::Parse {
            url: url.clone(),
            reason,
        })?;

        info!(
            root_id,
            root = %tree.root().name,
            children = tree.root().children.len(),
            "Destination tree loaded"
        );
        Ok(tree)
    }
}

/// Accept either a bare root object or a one-element array holding it.
pub(crate) fn parse_tree(body: serde_json::Value) -> Result<DestinationTree, String> {
    let root_value = match body {
        serde_json::Value::Array(mut items) => {
            if items.len() != 1 {
                return Err(format!("expected a single root, got {}", items.len()));
            }
            items.remove(0)
        }
        other => other,
    };

    let root: DestinationNode = serde_json::from_value(root_value).map_err(|e| e.to_string())?;
    DestinationTree::from_root(root).map_err(|dup| format!("duplicate perimeter id {dup}"))
}
