//! Upstream client shared by every per-alias listener

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use reqwest::{Client, Response, Url};
use tokio::time::Duration;

use crate::config::TimeoutsConfig;

#[derive(Clone)]
pub struct UpstreamClient {
    http_client: Client,
}

impl UpstreamClient {
    pub fn new(timeouts: &TimeoutsConfig) -> Result<Self, reqwest::Error> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(timeouts.connect_timeout_secs))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent(concat!("llm-alias-proxy/", env!("CARGO_PKG_VERSION")));

        if let Some(secs) = timeouts.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        Ok(Self {
            http_client: builder.build()?,
        })
    }

    /// Send one request upstream. No retries: a failure is reported to the caller as-is.
    pub async fn send(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<Response, reqwest::Error> {
        let mut request = self.http_client.request(method, url).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }
        request.send().await
    }
}
