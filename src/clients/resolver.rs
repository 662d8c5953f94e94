//! Name resolution through DNS-over-HTTPS.

use async_trait::async_trait;
use serde_json::Value;

use super::{ClientError, HttpFetcher};

const TXT_RECORD_TYPE: u64 = 16;

/// Resolves a human-readable name to a record value.
#[async_trait]
pub trait NameResolver: Send + Sync {
    /// Returns `None` when the name has no such record.
    async fn resolve(&self, name: &str, record: &str) -> Result<Option<String>, ClientError>;
}

/// Resolver speaking the `application/dns-json` API.
pub struct DohResolver {
    url: String,
    http: HttpFetcher,
}

impl DohResolver {
    pub fn new(url: &str, http: HttpFetcher) -> Self {
        Self {
            url: url.to_string(),
            http,
        }
    }
}

#[async_trait]
impl NameResolver for DohResolver {
    async fn resolve(&self, name: &str, record: &str) -> Result<Option<String>, ClientError> {
        let host = if record.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", record, name)
        };
        let separator = if self.url.contains('?') { '&' } else { '?' };
        let url = format!("{}{}name={}&type=TXT", self.url, separator, host);
        let json = self.http.fetch_json_accept(&url, "application/dns-json").await?;
        Ok(txt_value(&json))
    }
}

/// First TXT answer of a dns-json response, unquoted, with any dnslink
/// path prefix removed.
pub fn txt_value(response: &Value) -> Option<String> {
    let answers = response.get("Answer")?.as_array()?;
    answers
        .iter()
        .filter(|a| a.get("type").and_then(Value::as_u64) == Some(TXT_RECORD_TYPE))
        .filter_map(|a| a.get("data").and_then(Value::as_str))
        .map(|data| {
            let data = data.trim().trim_matches('"');
            data.strip_prefix("dnslink=")
                .map(|link| link.trim_start_matches("/ipns/").trim_start_matches("/ipfs/"))
                .unwrap_or(data)
                .to_string()
        })
        .find(|value| !value.is_empty())
}
