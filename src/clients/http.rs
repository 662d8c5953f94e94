//! Shared HTTP client used by probes and adapters.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;

use super::ClientError;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/102.0.5005.63 Safari/537.36";

/// Maximum number of response characters quoted in errors.
const SNIPPET_LEN: usize = 300;

/// Thin wrapper over one pooled `reqwest::Client`.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(proxy_url: Option<&str>, timeout: Duration) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout);
        if let Some(proxy_url) = proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| ClientError::Network(e.to_string()))?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(|e| ClientError::Network(e.to_string()))?;
        Ok(Self { client })
    }

    /// Client for long-lived streaming responses: only connecting is bounded,
    /// callers set per-request timeouts on short calls themselves.
    pub fn streaming(proxy_url: Option<&str>, connect_timeout: Duration) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(connect_timeout);
        if let Some(proxy_url) = proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url).map_err(|e| ClientError::Network(e.to_string()))?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(|e| ClientError::Network(e.to_string()))?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// GET a URL and return the body as text. Non-2xx statuses are errors.
    pub async fn fetch_text(&self, url: &str) -> Result<String, ClientError> {
        self.send(self.client.get(url), url).await
    }

    /// GET a URL and parse the body as JSON.
    pub async fn fetch_json(&self, url: &str) -> Result<Value, ClientError> {
        let body = self.fetch_text(url).await?;
        parse_json(&body)
    }

    /// GET a URL with an explicit `Accept` header and parse the body as JSON.
    pub async fn fetch_json_accept(&self, url: &str, accept: &str) -> Result<Value, ClientError> {
        let body = self
            .send(self.client.get(url).header(reqwest::header::ACCEPT, accept), url)
            .await?;
        parse_json(&body)
    }

    /// PUT a JSON body and parse the JSON response.
    pub async fn put_json(&self, url: &str, body: &Value) -> Result<Value, ClientError> {
        let body = self.send(self.client.put(url).json(body), url).await?;
        parse_json(&body)
    }

    /// POST to an RPC endpoint answering with newline-delimited JSON.
    pub async fn post_ndjson(&self, url: &str) -> Result<Vec<Value>, ClientError> {
        let body = self.send(self.client.post(url), url).await?;
        parse_ndjson(&body)
    }

    /// GET JSON, retrying immediately on failure.
    ///
    /// Attempts are counted from 1 and the final error is returned once the
    /// attempt count exceeds `retries`, so at most `retries + 1` requests are
    /// made. The attempt count is returned alongside the result either way.
    pub async fn fetch_json_retry(&self, url: &str, retries: u32) -> (Result<Value, ClientError>, u32) {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.fetch_json(url).await {
                Ok(json) => return (Ok(json), attempts),
                Err(e) if attempts > retries => return (Err(e), attempts),
                Err(e) => {
                    tracing::debug!("{} retries left fetching '{}': {}", retries + 1 - attempts, url, e);
                }
            }
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder, url: &str) -> Result<String, ClientError> {
        let response = request.send().await.map_err(map_reqwest)?;
        let status = response.status();
        let body = response.text().await.map_err(map_reqwest)?;
        if !status.is_success() {
            return Err(ClientError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body: snippet(&body),
            });
        }
        Ok(body)
    }
}

pub(crate) fn map_reqwest(e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        ClientError::Timeout
    } else {
        ClientError::Network(e.to_string())
    }
}

pub(crate) fn parse_json(body: &str) -> Result<Value, ClientError> {
    serde_json::from_str(body).map_err(|_| ClientError::Malformed(snippet(body)))
}

pub(crate) fn parse_ndjson(body: &str) -> Result<Vec<Value>, ClientError> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_json)
        .collect()
}

/// Short single-line excerpt of a response body with markup removed.
pub(crate) fn snippet(body: &str) -> String {
    static TAGS: OnceLock<Regex> = OnceLock::new();
    static SPACE: OnceLock<Regex> = OnceLock::new();
    let tags = TAGS.get_or_init(|| Regex::new(r"<[^>]*>").unwrap());
    let space = SPACE.get_or_init(|| Regex::new(r"\s*\n\s*").unwrap());

    let text = tags.replace_all(body, " ");
    let text = space.replace_all(text.trim(), " ");
    text.chars().take(SNIPPET_LEN).collect()
}
