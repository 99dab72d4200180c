//! Blocking HTTP implementation of [`ApiClient`].

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ApiArg, ApiClient, ApiError, ApiRes};
use crate::config::ChainConfig;

const USER_AGENT: &str = concat!("sigchain-core/", env!("CARGO_PKG_VERSION"));

/// Production API client over blocking `reqwest`.
pub struct HttpApiClient {
    base_url: String,
    session_token: Option<String>,
    client: reqwest::blocking::Client,
}

impl HttpApiClient {
    /// Builds a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Transport`] when the underlying client cannot
    /// be constructed.
    pub fn new(config: &ChainConfig) -> Result<Self, ApiError> {
        Self::with_session(config, None)
    }

    /// Builds a client carrying a session token for endpoints that need
    /// one.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Transport`] when the underlying client cannot
    /// be constructed.
    pub fn with_session(
        config: &ChainConfig,
        session_token: Option<String>,
    ) -> Result<Self, ApiError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ApiError::Transport {
                reason: e.to_string(),
            })?;

        Ok(Self {
            base_url: config.api_base_url.clone(),
            session_token,
            client,
        })
    }

    fn build_url(&self, endpoint: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }
}

impl ApiClient for HttpApiClient {
    fn get(&self, cancel: &CancellationToken, arg: &ApiArg) -> Result<ApiRes, ApiError> {
        if cancel.is_cancelled() {
            return Err(ApiError::Cancelled);
        }
        if arg.need_session && self.session_token.is_none() {
            return Err(ApiError::LoginRequired);
        }

        let url = self.build_url(&arg.endpoint);
        debug!(endpoint = %arg.endpoint, "api get");

        let mut builder = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .header("User-Agent", USER_AGENT)
            .query(&arg.args);
        if let Some(token) = &self.session_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().map_err(|e| ApiError::Transport {
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .unwrap_or_else(|_| "unable to read response body".to_string());
            return Err(ApiError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: serde_json::Value = response.json().map_err(|e| ApiError::Decode {
            reason: e.to_string(),
        })?;
        Ok(ApiRes::new(body))
    }
}
