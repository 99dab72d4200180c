//! Remote API client seam.
//!
//! The core talks to the remote through a single GET-shaped operation
//! returning a JSON tree. [`ApiClient`] is the seam; [`HttpApiClient`]
//! is the production implementation, and tests substitute canned
//! responses.

mod http;

use std::collections::BTreeMap;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use http::HttpApiClient;

/// Errors raised by the remote API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request could not be sent or the response not read.
    #[error("transport error: {reason}")]
    Transport {
        /// Description of the transport failure.
        reason: String,
    },

    /// The remote answered with a non-success status.
    #[error("api error: status {status}: {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body, as far as it could be read.
        message: String,
    },

    /// The response body was not the expected JSON shape.
    #[error("response decode error: {reason}")]
    Decode {
        /// Parse failure description.
        reason: String,
    },

    /// The endpoint requires a session and none is configured.
    #[error("login required")]
    LoginRequired,

    /// The request was cancelled before completing.
    #[error("api request cancelled")]
    Cancelled,
}

/// One GET request: endpoint, query arguments, session requirement.
#[derive(Debug, Clone)]
pub struct ApiArg {
    /// Endpoint path relative to the API base, e.g. `sig/get`.
    pub endpoint: String,

    /// Query arguments in deterministic order.
    pub args: BTreeMap<String, String>,

    /// Whether the endpoint needs an authenticated session.
    pub need_session: bool,
}

impl ApiArg {
    /// Builds an unauthenticated request.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            args: BTreeMap::new(),
            need_session: false,
        }
    }

    /// Adds a query argument.
    #[must_use]
    pub fn arg(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }
}

/// A JSON response tree addressable by key and index.
#[derive(Debug, Clone)]
pub struct ApiRes {
    body: serde_json::Value,
}

impl ApiRes {
    /// Wraps a parsed body.
    #[must_use]
    pub const fn new(body: serde_json::Value) -> Self {
        Self { body }
    }

    /// The whole body.
    #[must_use]
    pub const fn body(&self) -> &serde_json::Value {
        &self.body
    }

    /// Child value under an object key.
    #[must_use]
    pub fn at_key(&self, key: &str) -> Option<&serde_json::Value> {
        self.body.get(key)
    }

    /// Child value at an array index.
    #[must_use]
    pub fn at_index(&self, index: usize) -> Option<&serde_json::Value> {
        self.body.get(index)
    }
}

/// Blocking remote API client.
pub trait ApiClient: Send + Sync {
    /// Performs one GET request.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Cancelled`] when `cancel` has fired, and the
    /// transport/status/decode variants otherwise.
    fn get(&self, cancel: &CancellationToken, arg: &ApiArg) -> Result<ApiRes, ApiError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn api_arg_collects_query_pairs() {
        let arg = ApiArg::new("sig/get").arg("uid", "00ff").arg("low", "3");
        assert_eq!(arg.endpoint, "sig/get");
        assert_eq!(arg.args.get("uid").map(String::as_str), Some("00ff"));
        assert_eq!(arg.args.get("low").map(String::as_str), Some("3"));
        assert!(!arg.need_session);
    }

    #[test]
    fn api_res_addresses_keys_and_indexes() {
        let res = ApiRes::new(json!({"sigs": [1, 2, 3]}));
        let sigs = res.at_key("sigs").expect("sigs");
        assert_eq!(sigs.as_array().map(Vec::len), Some(3));
        assert!(res.at_key("absent").is_none());

        let arr = ApiRes::new(json!([10, 20]));
        assert_eq!(arr.at_index(1).and_then(serde_json::Value::as_u64), Some(20));
        assert!(arr.at_index(2).is_none());
    }
}
