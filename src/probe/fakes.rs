//! In-memory collaborators for probe tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::clients::{
    ClientError, ContentStore, NameResolver, Provider, ProviderSource, PubsubClient, PubsubMessage, Subscription,
};

/// Content store keeping blobs in a shared map.
#[derive(Default)]
pub struct FakeContentStore {
    pub blobs: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    pub removed: Mutex<Vec<String>>,
    pub fail_add: bool,
}

#[async_trait]
impl ContentStore for FakeContentStore {
    async fn add(&self, data: Vec<u8>) -> Result<String, ClientError> {
        if self.fail_add {
            return Err(ClientError::Network("connection refused".to_string()));
        }
        let mut blobs = self.blobs.lock().unwrap();
        let cid = format!("bafyfake{}", blobs.len());
        blobs.insert(cid.clone(), data);
        Ok(cid)
    }

    async fn remove(&self, cid: &str) -> Result<(), ClientError> {
        self.removed.lock().unwrap().push(cid.to_string());
        Ok(())
    }
}

/// Topic fan-out shared by several fake relays.
#[derive(Default)]
pub struct FakeBroker {
    topics: Mutex<HashMap<String, broadcast::Sender<PubsubMessage>>>,
}

impl FakeBroker {
    fn sender(&self, topic: &str) -> broadcast::Sender<PubsubMessage> {
        self.topics
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }
}

/// Relay connection on a [`FakeBroker`].
pub struct FakePubsub {
    pub name: String,
    pub broker: Arc<FakeBroker>,
    /// When false, publishes from this relay are silently dropped
    pub deliver: bool,
    pub fail_subscribe: bool,
    /// How long each subscribe takes
    pub subscribe_delay: Duration,
    pub peers: Vec<String>,
    pub subscribes: Arc<AtomicUsize>,
    pub unsubscribes: Arc<AtomicUsize>,
    pub published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl FakePubsub {
    pub fn new(name: &str, broker: Arc<FakeBroker>) -> Self {
        Self {
            name: name.to_string(),
            broker,
            deliver: true,
            fail_subscribe: false,
            subscribe_delay: Duration::ZERO,
            peers: vec![],
            subscribes: Arc::new(AtomicUsize::new(0)),
            unsubscribes: Arc::new(AtomicUsize::new(0)),
            published: Mutex::new(vec![]),
        }
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }
}

struct FakeSubscription {
    rx: broadcast::Receiver<PubsubMessage>,
    unsubscribes: Arc<AtomicUsize>,
}

#[async_trait]
impl Subscription for FakeSubscription {
    async fn next_message(&mut self) -> Result<Option<PubsubMessage>, ClientError> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Ok(Some(message)),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), ClientError> {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl PubsubClient for FakePubsub {
    fn url(&self) -> &str {
        &self.name
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, ClientError> {
        if self.fail_subscribe {
            return Err(ClientError::Network("subscribe refused".to_string()));
        }
        tokio::time::sleep(self.subscribe_delay).await;
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSubscription {
            rx: self.broker.sender(topic).subscribe(),
            unsubscribes: self.unsubscribes.clone(),
        }))
    }

    async fn publish(&self, topic: &str, data: &[u8]) -> Result<(), ClientError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), data.to_vec()));
        if self.deliver {
            let _ = self.broker.sender(topic).send(PubsubMessage {
                from: self.name.clone(),
                data: data.to_vec(),
            });
        }
        Ok(())
    }

    async fn peers(&self, _topic: &str) -> Result<Vec<String>, ClientError> {
        Ok(self.peers.clone())
    }
}

/// Routing source with a canned answer.
pub struct FakeProviderSource {
    pub url: String,
    pub result: Result<Vec<Provider>, ClientError>,
    pub calls: AtomicUsize,
}

impl FakeProviderSource {
    pub fn ok(url: &str, ids: &[&str]) -> Self {
        Self {
            url: url.to_string(),
            result: Ok(ids
                .iter()
                .map(|id| Provider {
                    id: id.to_string(),
                    addrs: vec![],
                })
                .collect()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn err(url: &str, reason: &str) -> Self {
        Self {
            url: url.to_string(),
            result: Err(ClientError::Network(reason.to_string())),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ProviderSource for FakeProviderSource {
    fn url(&self) -> &str {
        &self.url
    }

    async fn find_providers(&self, _key: &str) -> Result<Vec<Provider>, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

/// Resolver answering from a fixed table.
#[derive(Default)]
pub struct FakeResolver {
    pub records: HashMap<String, String>,
}

#[async_trait]
impl NameResolver for FakeResolver {
    async fn resolve(&self, name: &str, _record: &str) -> Result<Option<String>, ClientError> {
        Ok(self.records.get(name).cloned())
    }
}
