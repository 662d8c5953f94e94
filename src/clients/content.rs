//! Write-capable content store.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};

use super::{map_reqwest, parse_json, snippet, ClientError, HttpFetcher};

/// Stores and unpins synthetic content.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store `data` and return its content identifier.
    async fn add(&self, data: Vec<u8>) -> Result<String, ClientError>;

    /// Unpin previously added content.
    async fn remove(&self, cid: &str) -> Result<(), ClientError>;
}

/// Content store backed by a Kubo RPC endpoint (`.../api/v0`).
pub struct KuboContentStore {
    api_url: String,
    http: HttpFetcher,
}

impl KuboContentStore {
    pub fn new(api_url: &str, http: HttpFetcher) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            http,
        }
    }

    async fn post(&self, request: reqwest::RequestBuilder, url: &str) -> Result<serde_json::Value, ClientError> {
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
        parse_json(&body)
    }
}

#[async_trait]
impl ContentStore for KuboContentStore {
    async fn add(&self, data: Vec<u8>) -> Result<String, ClientError> {
        let url = format!("{}/add?pin=true", self.api_url);
        let form = Form::new().part("file", Part::bytes(data).file_name("data"));
        let json = self
            .post(self.http.client().post(&url).multipart(form), &url)
            .await?;
        json.get("Hash")
            .and_then(|h| h.as_str())
            .map(str::to_string)
            .ok_or_else(|| ClientError::Unexpected(format!("add response missing Hash: {}", json)))
    }

    async fn remove(&self, cid: &str) -> Result<(), ClientError> {
        let url = format!("{}/pin/rm?arg={}", self.api_url, cid);
        self.post(self.http.client().post(&url), &url).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::serve;
    use axum::{extract::Query, routing::post, Json, Router};
    use serde_json::json;
    use std::collections::HashMap;
    use std::time::Duration;

    #[tokio::test]
    async fn test_kubo_add_and_remove() {
        let app = Router::new()
            .route(
                "/api/v0/add",
                post(|| async { Json(json!({"Name": "data", "Hash": "QmSynthetic", "Size": "12"})) }),
            )
            .route(
                "/api/v0/pin/rm",
                post(|Query(q): Query<HashMap<String, String>>| async move {
                    Json(json!({"Pins": [q.get("arg").cloned().unwrap_or_default()]}))
                }),
            );
        let base = serve(app).await;
        let http = HttpFetcher::new(None, Duration::from_secs(5)).unwrap();
        let store = KuboContentStore::new(&format!("{}/api/v0/", base), http);

        let cid = store.add(b"{\"id\":\"abc\"}".to_vec()).await.unwrap();
        assert_eq!(cid, "QmSynthetic");
        store.remove(&cid).await.unwrap();
    }

    #[tokio::test]
    async fn test_kubo_add_missing_hash() {
        let app = Router::new().route("/api/v0/add", post(|| async { Json(json!({"Message": "nope"})) }));
        let base = serve(app).await;
        let http = HttpFetcher::new(None, Duration::from_secs(5)).unwrap();
        let store = KuboContentStore::new(&format!("{}/api/v0", base), http);

        assert!(matches!(store.add(vec![1]).await, Err(ClientError::Unexpected(_))));
    }
}
