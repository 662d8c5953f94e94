//! Pub/sub relay client.

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use reqwest::multipart::{Form, Part};
use serde_json::Value;
use std::time::Duration;

use super::{map_reqwest, parse_json, snippet, ClientError, HttpFetcher};

/// Timeout for short pub/sub RPC calls (publish, peers).
const CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// A message received on a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct PubsubMessage {
    pub from: String,
    pub data: Vec<u8>,
}

/// A live subscription to one topic.
#[async_trait]
pub trait Subscription: Send {
    /// Next message on the topic, or `None` once the relay closed the stream.
    async fn next_message(&mut self) -> Result<Option<PubsubMessage>, ClientError>;

    /// Tear the subscription down. Consumes it, so it runs at most once.
    async fn unsubscribe(self: Box<Self>) -> Result<(), ClientError>;
}

/// Connection to one pub/sub relay.
#[async_trait]
pub trait PubsubClient: Send + Sync {
    fn url(&self) -> &str;

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, ClientError>;

    async fn publish(&self, topic: &str, data: &[u8]) -> Result<(), ClientError>;

    /// Peers the relay is connected to on `topic`.
    async fn peers(&self, topic: &str) -> Result<Vec<String>, ClientError>;
}

/// Pub/sub over the Kubo RPC API.
pub struct KuboPubsubClient {
    api_url: String,
    http: HttpFetcher,
}

impl KuboPubsubClient {
    /// `http` should come from [`HttpFetcher::streaming`] since subscriptions
    /// stay open indefinitely.
    pub fn new(api_url: &str, http: HttpFetcher) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    async fn call(&self, request: reqwest::RequestBuilder, url: &str) -> Result<String, ClientError> {
        let response = request.timeout(CALL_TIMEOUT).send().await.map_err(map_reqwest)?;
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

#[async_trait]
impl PubsubClient for KuboPubsubClient {
    fn url(&self) -> &str {
        &self.api_url
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, ClientError> {
        let url = format!("{}/pubsub/sub?arg={}", self.api_url, encode_topic(topic));
        let response = self.http.client().post(&url).send().await.map_err(map_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                url,
                status: status.as_u16(),
                body: snippet(&body),
            });
        }
        Ok(Box::new(KuboSubscription {
            response,
            buffer: Vec::new(),
        }))
    }

    async fn publish(&self, topic: &str, data: &[u8]) -> Result<(), ClientError> {
        let url = format!("{}/pubsub/pub?arg={}", self.api_url, encode_topic(topic));
        let form = Form::new().part("file", Part::bytes(data.to_vec()).file_name("data"));
        self.call(self.http.client().post(&url).multipart(form), &url).await?;
        Ok(())
    }

    async fn peers(&self, topic: &str) -> Result<Vec<String>, ClientError> {
        let url = format!("{}/pubsub/peers?arg={}", self.api_url, encode_topic(topic));
        let body = self.call(self.http.client().post(&url), &url).await?;
        let json = parse_json(&body)?;
        match json.get("Strings") {
            None | Some(Value::Null) => Ok(vec![]),
            Some(Value::Array(peers)) => Ok(peers
                .iter()
                .filter_map(|p| p.as_str().map(str::to_string))
                .collect()),
            Some(other) => Err(ClientError::Unexpected(format!("peers response: {}", other))),
        }
    }
}

struct KuboSubscription {
    response: reqwest::Response,
    buffer: Vec<u8>,
}

#[async_trait]
impl Subscription for KuboSubscription {
    async fn next_message(&mut self) -> Result<Option<PubsubMessage>, ClientError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match decode_message(line) {
                    Ok(message) => return Ok(Some(message)),
                    Err(e) => {
                        tracing::debug!("Skipping undecodable pubsub line: {}", e);
                        continue;
                    }
                }
            }

            match self.response.chunk().await.map_err(map_reqwest)? {
                Some(chunk) => self.buffer.extend_from_slice(&chunk),
                None => return Ok(None),
            }
        }
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), ClientError> {
        // the relay drops the subscription when the stream is closed
        drop(self.response);
        Ok(())
    }
}

/// Topics travel as multibase base64url.
pub fn encode_topic(topic: &str) -> String {
    format!("u{}", URL_SAFE_NO_PAD.encode(topic.as_bytes()))
}

fn decode_multibase(value: &str) -> Result<Vec<u8>, ClientError> {
    let decoded = match value.strip_prefix('u') {
        Some(rest) => URL_SAFE_NO_PAD.decode(rest),
        None => match value.strip_prefix('m') {
            Some(rest) => STANDARD.decode(rest),
            None => STANDARD.decode(value),
        },
    };
    decoded.map_err(|e| ClientError::Unexpected(format!("bad multibase '{}': {}", value, e)))
}

/// Decode one NDJSON line of a Kubo subscription stream.
pub fn decode_message(line: &str) -> Result<PubsubMessage, ClientError> {
    let json = parse_json(line)?;
    let data = json
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| ClientError::Unexpected(format!("message without data: {}", snippet(line))))?;
    Ok(PubsubMessage {
        from: json
            .get("from")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        data: decode_multibase(data)?,
    })
}
