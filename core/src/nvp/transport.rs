//! The seam between the dispatcher and the network.
//!
//! The dispatcher never touches an HTTP client directly; it hands a fully
//! encoded body to an [`NvpTransport`]. Production uses [`HttpTransport`]
//! (`reqwest`), tests plug in a recorder.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;

use crate::config::FORM_CONTENT_TYPE;

use super::error::{NvpError, NvpResult};

/// Raw upstream answer: HTTP status and body text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawReply {
    pub status: u16,
    pub body: String,
}

impl RawReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait NvpTransport: Send + Sync {
    /// POST a form-encoded `body` to `endpoint`, giving up after `timeout`.
    async fn post_form(&self, endpoint: &str, body: String, timeout: Duration)
        -> NvpResult<RawReply>;
}

/// `reqwest`-backed transport. One pooled client for the whole process.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> NvpResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("nvp-proxy/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NvpError::Setup(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NvpTransport for HttpTransport {
    async fn post_form(
        &self,
        endpoint: &str,
        body: String,
        timeout: Duration,
    ) -> NvpResult<RawReply> {
        let response = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .timeout(timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| classify(e, timeout))?;
        Ok(RawReply { status, body })
    }
}

fn classify(err: reqwest::Error, timeout: Duration) -> NvpError {
    if err.is_timeout() {
        NvpError::Timeout(timeout)
    } else {
        NvpError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_success_range() {
        let ok = RawReply { status: 200, body: String::new() };
        let redirect = RawReply { status: 302, body: String::new() };
        let down = RawReply { status: 503, body: String::new() };
        assert!(ok.is_success());
        assert!(!redirect.is_success());
        assert!(!down.is_success());
    }

    #[test]
    fn http_transport_builds() {
        assert!(HttpTransport::new().is_ok());
    }
}
