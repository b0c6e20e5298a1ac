//! HTTP session source
//!
//! Default [`SessionSource`] implementation: a single authenticated GET
//! against the configured upstream endpoint.

use crate::config::Token;
use crate::error::OrchestratorError;
use crate::gate::{GatewayLimits, LimitsBody, SessionSource, UpstreamErrorBody};
use tracing::warn;

/// Queries the upstream session-limit endpoint over HTTPS.
#[derive(Debug, Clone)]
pub struct HttpSessionSource {
    client: reqwest::Client,
    url: String,
}

impl HttpSessionSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

impl SessionSource for HttpSessionSource {
    async fn fetch(&self, token: &Token) -> Result<GatewayLimits, OrchestratorError> {
        let response = self
            .client
            .get(&self.url)
            .bearer_auth(token.expose())
            .send()
            .await
            .map_err(|e| OrchestratorError::UpstreamUnavailable(Box::new(e)))?;

        let status = response.status();
        if status.is_success() {
            let body: LimitsBody = response
                .json()
                .await
                .map_err(|e| OrchestratorError::UpstreamUnavailable(Box::new(e)))?;
            return Ok(body.into());
        }

        // Client errors carry a structured body; anything else (including
        // 5xx) counts as unavailable.
        if status.is_client_error() {
            match response.json::<UpstreamErrorBody>().await {
                Ok(body) => {
                    return Err(OrchestratorError::UpstreamRejected {
                        message: body.message,
                        code: body.code,
                    })
                }
                Err(e) => {
                    warn!(status = %status, error = %e, "Unparseable upstream error body");
                }
            }
        }

        Err(OrchestratorError::UpstreamUnavailable(
            format!("upstream answered {status}").into(),
        ))
    }
}
