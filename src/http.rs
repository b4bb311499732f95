//! HTTP facade
//!
//! Exchange, merchant and bank endpoints are reached through this trait
//! only; nothing else in the crate performs network I/O. Transport failures
//! and timeouts map to retryable errors, HTTP error statuses are returned
//! to the caller for classification.

use async_trait::async_trait;
use serde_json::Value;

use crate::config::NetworkConfig;
use crate::error::WalletError;

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

impl HttpResponse {
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turn a non-2xx response into the matching error.
    pub fn into_server_error(self) -> WalletError {
        let detail = self
            .body
            .get("hint")
            .and_then(Value::as_str)
            .unwrap_or("request rejected")
            .to_string();
        WalletError::Server {
            status: self.status,
            detail,
        }
    }
}

#[async_trait]
pub trait HttpFacade: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, WalletError>;
    async fn post_json(&self, url: &str, body: &Value) -> Result<HttpResponse, WalletError>;
}

/// Production implementation over `reqwest` with a per-request timeout.
pub struct ReqwestHttp {
    client: reqwest::Client,
}

impl ReqwestHttp {
    pub fn new(config: &NetworkConfig) -> Result<Self, WalletError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| WalletError::Internal(format!("http client init: {e}")))?;
        Ok(ReqwestHttp { client })
    }

    async fn read(url: &str, resp: reqwest::Response) -> Result<HttpResponse, WalletError> {
        let status = resp.status().as_u16();
        let body = resp
            .json::<Value>()
            .await
            .unwrap_or(Value::Null);
        tracing::debug!(url, status, "http response");
        Ok(HttpResponse { status, body })
    }

    fn map_err(url: &str, e: reqwest::Error) -> WalletError {
        if e.is_timeout() {
            WalletError::Timeout(url.to_string())
        } else {
            WalletError::Network(format!("{url}: {e}"))
        }
    }
}

#[async_trait]
impl HttpFacade for ReqwestHttp {
    async fn get(&self, url: &str) -> Result<HttpResponse, WalletError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Self::map_err(url, e))?;
        Self::read(url, resp).await
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<HttpResponse, WalletError> {
        let resp = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| Self::map_err(url, e))?;
        Self::read(url, resp).await
    }
}
