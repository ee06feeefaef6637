//! HTTP transport for talking to a khata-server instance

use khata_core::sync::{
    PullRequest, PullResponse, PushRequest, PushResponse, SyncTransport, TransportError,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Bearer-authenticated JSON transport over reqwest
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: reqwest::Client::new(),
            base_url,
            token: token.into(),
        }
    }

    /// Build a transport from `KHATA_SERVER_URL` and `KHATA_TOKEN`
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("KHATA_SERVER_URL").ok()?;
        let token = std::env::var("KHATA_TOKEN").ok()?;
        if base_url.trim().is_empty() || token.trim().is_empty() {
            return None;
        }
        Some(Self::new(base_url, token))
    }

    async fn post_json<Req, Resp>(&self, path: &str, request: &Req) -> Result<Resp, TransportError>
    where
        Req: serde::Serialize,
        Resp: serde::de::DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await
            .map_err(|error| TransportError(format!("request to {url} failed: {error}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response
                .json::<ErrorBody>()
                .await
                .map_or_else(|_| String::new(), |body| format!(": {}", body.error));
            return Err(TransportError(format!(
                "server returned HTTP {}{detail}",
                status.as_u16()
            )));
        }

        response
            .json::<Resp>()
            .await
            .map_err(|error| TransportError(format!("invalid response from {url}: {error}")))
    }
}

impl SyncTransport for HttpTransport {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse, TransportError> {
        self.post_json("/v1/sync/push", request).await
    }

    async fn pull(&self, request: &PullRequest) -> Result<PullResponse, TransportError> {
        self.post_json("/v1/sync/pull", request).await
    }
}
