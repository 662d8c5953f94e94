//! Provider record lookups against content routing services.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use super::{snippet, ClientError, HttpFetcher};

/// A peer advertising that it provides a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Addrs", default)]
    pub addrs: Vec<String>,
}

/// A routing backend that answers "who provides this key".
#[async_trait]
pub trait ProviderSource: Send + Sync {
    fn url(&self) -> &str;

    /// Providers of `key`. An absent provider list is an empty result.
    async fn find_providers(&self, key: &str) -> Result<Vec<Provider>, ClientError>;
}

/// Delegated routing v1 API, or the Kubo RPC API when the URL contains `api/v0`.
pub struct HttpProviderSource {
    url: String,
    http: HttpFetcher,
}

impl HttpProviderSource {
    pub fn new(url: &str, http: HttpFetcher) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            http,
        }
    }

    fn is_kubo_rpc(&self) -> bool {
        self.url.contains("api/v0")
    }

    /// Announce a provider record (`PUT /routing/v1/providers`).
    pub async fn provide(&self, body: &Value) -> Result<Value, ClientError> {
        let url = format!("{}/routing/v1/providers", self.url);
        self.http.put_json(&url, body).await
    }
}

#[async_trait]
impl ProviderSource for HttpProviderSource {
    fn url(&self) -> &str {
        &self.url
    }

    async fn find_providers(&self, key: &str) -> Result<Vec<Provider>, ClientError> {
        if self.is_kubo_rpc() {
            let url = format!("{}/routing/findprovs?arg={}", self.url, key);
            let lines = self.http.post_ndjson(&url).await?;
            Ok(providers_from_findprovs(&lines))
        } else {
            let url = format!("{}/routing/v1/providers/{}", self.url, key);
            let json = self.http.fetch_json(&url).await?;
            providers_from_v1(&json)
        }
    }
}

/// Collect providers from Kubo `routing/findprovs` events, first seen wins.
pub fn providers_from_findprovs(lines: &[Value]) -> Vec<Provider> {
    let mut seen = HashSet::new();
    let mut providers = Vec::new();
    for line in lines {
        let Some(responses) = line.get("Responses").and_then(Value::as_array) else {
            continue;
        };
        for response in responses {
            if let Ok(provider) = serde_json::from_value::<Provider>(response.clone()) {
                if seen.insert(provider.id.clone()) {
                    providers.push(provider);
                }
            }
        }
    }
    providers
}

/// Parse a delegated routing v1 providers response.
pub fn providers_from_v1(json: &Value) -> Result<Vec<Provider>, ClientError> {
    match json.get("Providers") {
        Some(Value::Null) => Ok(vec![]),
        Some(Value::Array(items)) => Ok(items
            .iter()
            .filter_map(|item| serde_json::from_value::<Provider>(item.clone()).ok())
            .collect()),
        _ => Err(ClientError::Malformed(snippet(&json.to_string()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::serve;
    use axum::{extract::Path, routing::{get, post}, Json, Router};
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_v1_null_providers_is_empty() {
        assert!(providers_from_v1(&json!({"Providers": null})).unwrap().is_empty());
        assert!(providers_from_v1(&json!({"error": "nope"})).is_err());
        let providers = providers_from_v1(&json!({
            "Providers": [{"Schema": "peer", "ID": "12D3KooA", "Addrs": ["/ip4/1.2.3.4/tcp/4001"]}]
        }))
        .unwrap();
        assert_eq!(providers[0].id, "12D3KooA");
        assert_eq!(providers[0].addrs.len(), 1);
    }

    #[test]
    fn test_findprovs_dedupes() {
        let lines = vec![
            json!({"Type": 4, "Responses": [{"ID": "a", "Addrs": []}]}),
            json!({"Type": 4, "Responses": null}),
            json!({"Type": 4, "Responses": [{"ID": "a", "Addrs": ["x"]}, {"ID": "b"}]}),
        ];
        let ids: Vec<_> = providers_from_findprovs(&lines).into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_backend_selection() {
        let app = Router::new()
            .route(
                "/routing/v1/providers/{key}",
                get(|Path(key): Path<String>| async move { Json(json!({"Providers": [{"ID": key}]})) }),
            )
            .route(
                "/api/v0/routing/findprovs",
                post(|| async { "{\"Responses\":[{\"ID\":\"kubo\"}]}\n" }),
            );
        let base = serve(app).await;
        let http = HttpFetcher::new(None, Duration::from_secs(5)).unwrap();

        let v1 = HttpProviderSource::new(&base, http.clone());
        assert_eq!(v1.find_providers("bafkey").await.unwrap()[0].id, "bafkey");

        let kubo = HttpProviderSource::new(&format!("{}/api/v0", base), http);
        assert_eq!(kubo.find_providers("bafkey").await.unwrap()[0].id, "kubo");
    }
}
