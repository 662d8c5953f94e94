//! Configuration module for Contrail.
//!
//! Server settings come from environment variables with sensible defaults.
//! The set of monitored endpoints comes from a JSON document whose path is
//! itself configurable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::state::Category;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("missing descriptor_sources: at least one target descriptor url or file is required")]
    MissingDescriptorSources,
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 3000)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "contrail.db")
    pub db_path: String,
    /// Path to the monitor configuration document (default: "contrail.json")
    pub config_path: String,
    /// Optional proxy for all outbound probe traffic
    pub proxy_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 3000,
            db_path: "contrail.db".to_string(),
            config_path: "contrail.json".to_string(),
            proxy_url: None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `CONTRAIL_HTTP_PORT`: HTTP port (default: 3000)
    /// - `CONTRAIL_DB_PATH`: Database file path (default: "contrail.db")
    /// - `CONTRAIL_CONFIG`: Monitor config path (default: "contrail.json")
    /// - `CONTRAIL_PROXY_URL`: Outbound proxy (default: none)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(port_str) = env::var("CONTRAIL_HTTP_PORT") {
            if let Ok(port) = port_str.parse() {
                cfg.http_port = port;
            }
        }

        if let Ok(db_path) = env::var("CONTRAIL_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Ok(config_path) = env::var("CONTRAIL_CONFIG") {
            cfg.config_path = config_path;
        }

        if let Ok(proxy_url) = env::var("CONTRAIL_PROXY_URL") {
            if !proxy_url.is_empty() {
                cfg.proxy_url = Some(proxy_url);
            }
        }

        cfg
    }
}

/// A name service endpoint and the well-known name it must resolve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NameServiceConfig {
    pub url: String,
    pub name: String,
    #[serde(default = "default_name_record")]
    pub record: String,
}

fn default_name_record() -> String {
    "_dnslink".to_string()
}

/// A static page and the pattern its body must contain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticPageConfig {
    pub url: String,
    pub pattern: String,
}

/// Per-job interval overrides, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Intervals {
    pub registry_refresh: u64,
    pub node_updates: u64,
    pub gateways: u64,
    pub routers: u64,
    pub relays: u64,
    pub name_services: u64,
    pub static_pages: u64,
    pub listeners: u64,
    pub warmup: u64,
}

impl Default for Intervals {
    fn default() -> Self {
        Self {
            registry_refresh: 60 * 60,
            node_updates: 60 * 10,
            gateways: 60 * 10,
            routers: 60 * 10,
            relays: 60 * 10,
            name_services: 60 * 10,
            static_pages: 60 * 10,
            listeners: 60,
            warmup: 60,
        }
    }
}

impl Intervals {
    pub fn secs(value: u64) -> Duration {
        Duration::from_secs(value.max(1))
    }
}

/// Endpoints to monitor, loaded from the JSON config document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// URLs or local files listing application nodes
    pub descriptor_sources: Vec<String>,
    /// Gateways under test
    pub gateways: Vec<String>,
    /// Gateway trusted to fetch application node records
    pub reference_gateway: String,
    /// Write-capable content API used for synthetic content
    pub content_api_url: String,
    /// Relay used as the known-good side of pub/sub round trips
    pub reference_relay_url: String,
    /// Relays under test
    pub relays: Vec<String>,
    /// Routing backends tried in order for DHT provider lookups
    pub delegated_routing_urls: Vec<String>,
    /// Content routers under test, also queried together for provider lookups
    pub routers: Vec<String>,
    pub name_services: Vec<NameServiceConfig>,
    pub static_pages: Vec<StaticPageConfig>,
    /// Address announced in synthetic provider records
    pub announce_ip: Option<String>,
    pub intervals: Intervals,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            descriptor_sources: vec![],
            gateways: vec![
                "https://ipfs.io".to_string(),
                "https://dweb.link".to_string(),
            ],
            reference_gateway: "https://ipfs.io".to_string(),
            content_api_url: "http://127.0.0.1:5001/api/v0".to_string(),
            reference_relay_url: "http://127.0.0.1:5001/api/v0".to_string(),
            relays: vec![],
            delegated_routing_urls: vec!["https://delegated-ipfs.dev".to_string()],
            routers: vec![],
            name_services: vec![],
            static_pages: vec![],
            announce_ip: None,
            intervals: Intervals::default(),
        }
    }
}

impl MonitorConfig {
    /// Load the monitor config, falling back to defaults when the file is absent.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        Self::from_json(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Check required settings and report categories with nothing to probe.
    ///
    /// A missing descriptor source list is fatal; empty endpoint lists only
    /// disable their own category.
    pub fn validate(&self) -> Result<BTreeSet<Category>, ConfigError> {
        if self.descriptor_sources.is_empty() {
            return Err(ConfigError::MissingDescriptorSources);
        }

        let mut disabled = BTreeSet::new();
        if self.gateways.is_empty() {
            disabled.insert(Category::Gateway);
        }
        if self.routers.is_empty() {
            disabled.insert(Category::ContentRouter);
        }
        if self.relays.is_empty() || self.reference_relay_url.is_empty() {
            disabled.insert(Category::Relay);
        }
        if self.name_services.is_empty() {
            disabled.insert(Category::NameService);
        }
        if self.static_pages.is_empty() {
            disabled.insert(Category::StaticPage);
        }
        if self.reference_gateway.is_empty() {
            disabled.insert(Category::ApplicationNode);
        }
        Ok(disabled)
    }
}
