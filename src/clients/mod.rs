//! Network clients for the external systems under test.
//!
//! Each collaborator is a trait so probes can be exercised against in-memory
//! fakes; the HTTP implementations speak the Kubo RPC, delegated routing and
//! DNS-over-HTTPS JSON APIs.

mod content;
mod http;
mod pubsub;
mod resolver;
mod routing;

pub use content::*;
pub use http::*;
pub use pubsub::*;
pub use resolver::*;
pub use routing::*;

use thiserror::Error;

/// Client error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("'{url}' returned status {status}: '{body}'")]
    Status { url: String, status: u16, body: String },
    #[error("failed fetching got response '{0}'")]
    Malformed(String),
    #[error("unexpected response: {0}")]
    Unexpected(String),
}
