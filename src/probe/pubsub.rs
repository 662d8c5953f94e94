//! Publish/subscribe round trip between a relay and a reference relay.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Probe, ProbeError, ProbeKind, ProbeOutcome, Target};
use crate::clients::{PubsubClient, Subscription};
use crate::keys;

/// How long each side waits for the other side's message.
pub const PUBSUB_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Wait until `expected` arrives on `subscription`. Other messages are
/// ignored.
pub async fn wait_for_message(
    subscription: &mut Box<dyn Subscription>,
    expected: &[u8],
    timeout: Duration,
) -> Result<(), ProbeError> {
    tokio::time::timeout(timeout, next_matching(subscription, expected))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
}

async fn next_matching(subscription: &mut Box<dyn Subscription>, expected: &[u8]) -> Result<(), ProbeError> {
    loop {
        match subscription.next_message().await? {
            Some(message) if message.data == expected => return Ok(()),
            Some(_) => continue,
            None => return Err(ProbeError::Missing("subscription closed before message arrived".to_string())),
        }
    }
}

/// Subscribes on both the relay under test and the reference relay, then
/// checks that a message published on either side reaches the other.
pub struct PubSubRoundTripProbe {
    reference: Arc<dyn PubsubClient>,
    relays: HashMap<String, Arc<dyn PubsubClient>>,
    timeout: Duration,
}

impl PubSubRoundTripProbe {
    pub fn new(reference: Arc<dyn PubsubClient>, relays: Vec<Arc<dyn PubsubClient>>) -> Self {
        Self {
            reference,
            relays: relays.into_iter().map(|r| (r.url().to_string(), r)).collect(),
            timeout: PUBSUB_WAIT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Publish on one side while the other waits for it.
    async fn deliver(
        &self,
        from: &dyn PubsubClient,
        to: &mut Box<dyn Subscription>,
        topic: &str,
        message: &str,
    ) -> Result<(), ProbeError> {
        let publish = async {
            if let Err(e) = from.publish(topic, message.as_bytes()).await {
                tracing::debug!("Failed publishing on {}: {}", from.url(), e);
            }
        };
        let (received, _) = tokio::join!(wait_for_message(to, message.as_bytes(), self.timeout), publish);
        received
    }

    async fn exchange(
        &self,
        relay: &dyn PubsubClient,
        relay_sub: &mut Box<dyn Subscription>,
        reference_sub: &mut Box<dyn Subscription>,
        topic: &str,
    ) -> Result<(), ProbeError> {
        let from_relay = format!("hello from relay {}", keys::random_identity());
        self.deliver(relay, reference_sub, topic, &from_relay)
            .await
            .map_err(|e| ProbeError::Lookup(format!("reference did not receive relay message: {}", e)))?;

        let from_reference = format!("hello from reference {}", keys::random_identity());
        self.deliver(self.reference.as_ref(), relay_sub, topic, &from_reference)
            .await
            .map_err(|e| ProbeError::Lookup(format!("relay did not receive reference message: {}", e)))
    }
}

async fn unsubscribe(subscription: Box<dyn Subscription>, url: &str) {
    if let Err(e) = subscription.unsubscribe().await {
        tracing::debug!("Failed unsubscribing from {}: {}", url, e);
    }
}

#[async_trait]
impl Probe for PubSubRoundTripProbe {
    fn kind(&self) -> ProbeKind {
        ProbeKind::RelayRoundTrip
    }

    async fn run(&self, target: &Target) -> ProbeOutcome {
        let Some(relay) = self.relays.get(target.id.trim_end_matches('/')) else {
            let e = ProbeError::Missing(format!("no client for relay '{}'", target.id));
            return ProbeOutcome::failure(self.kind(), target, 0, e);
        };
        let topic = keys::random_identity();

        let mut reference_sub = match self.reference.subscribe(&topic).await {
            Ok(sub) => sub,
            Err(e) => {
                let e = format!("reference relay subscribe failed: {}", e);
                return ProbeOutcome::failure(self.kind(), target, 1, e);
            }
        };
        let subscribe_start = Instant::now();
        let mut relay_sub = match relay.subscribe(&topic).await {
            Ok(sub) => sub,
            Err(e) => {
                unsubscribe(reference_sub, self.reference.url()).await;
                return ProbeOutcome::failure(self.kind(), target, 1, e).with("lastSubscribeSuccess", false);
            }
        };
        let subscribe_time = subscribe_start.elapsed();

        let result = self
            .exchange(relay.as_ref(), &mut relay_sub, &mut reference_sub, &topic)
            .await;

        unsubscribe(relay_sub, relay.url()).await;
        unsubscribe(reference_sub, self.reference.url()).await;

        // round trip latency includes the relay subscribe
        let outcome = match result {
            Ok(()) => ProbeOutcome::success(self.kind(), target, subscribe_start.elapsed(), 1),
            Err(e) => ProbeOutcome::failure(self.kind(), target, 1, e),
        };
        outcome
            .with("lastSubscribeSuccess", true)
            .with("lastSubscribeTime", subscribe_time.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::fakes::{FakeBroker, FakePubsub};
    use crate::state::Category;

    fn setup(relay_delivers: bool) -> (Arc<FakePubsub>, Arc<FakePubsub>, PubSubRoundTripProbe) {
        let broker = Arc::new(FakeBroker::default());
        let reference = Arc::new(FakePubsub::new("https://reference.example", broker.clone()));
        let mut relay = FakePubsub::new("https://relay.example", broker);
        relay.deliver = relay_delivers;
        let relay = Arc::new(relay);
        let probe = PubSubRoundTripProbe::new(reference.clone(), vec![relay.clone()])
            .with_timeout(Duration::from_millis(200));
        (reference, relay, probe)
    }

    #[tokio::test]
    async fn test_round_trip_success() {
        let (reference, relay, probe) = setup(true);
        let outcome = probe.run(&Target::new(Category::Relay, "https://relay.example")).await;

        assert!(outcome.success, "{:?}", outcome.reason);
        assert_eq!(outcome.payload["lastSubscribeSuccess"], true);
        assert_eq!(reference.unsubscribe_count(), 1);
        assert_eq!(relay.unsubscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_round_trip_latency_counts_relay_subscribe() {
        let broker = Arc::new(FakeBroker::default());
        let reference = Arc::new(FakePubsub::new("https://reference.example", broker.clone()));
        let mut relay = FakePubsub::new("https://relay.example", broker);
        relay.subscribe_delay = Duration::from_millis(50);
        let probe = PubSubRoundTripProbe::new(reference, vec![Arc::new(relay)]);

        let outcome = probe.run(&Target::new(Category::Relay, "https://relay.example")).await;
        assert!(outcome.success, "{:?}", outcome.reason);
        let subscribe_time = outcome.payload["lastSubscribeTime"].as_f64().unwrap();
        assert!(subscribe_time >= 0.05);
        assert!(outcome.latency.unwrap() >= subscribe_time);
    }

    #[tokio::test]
    async fn test_timeout_unsubscribes_both_once() {
        let (reference, relay, probe) = setup(false);
        let outcome = probe.run(&Target::new(Category::Relay, "https://relay.example")).await;

        assert!(!outcome.success);
        assert!(outcome.reason.unwrap().contains("reference did not receive"));
        assert_eq!(reference.unsubscribe_count(), 1);
        assert_eq!(relay.unsubscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_relay_subscribe_failure_releases_reference() {
        let broker = Arc::new(FakeBroker::default());
        let reference = Arc::new(FakePubsub::new("https://reference.example", broker.clone()));
        let mut relay = FakePubsub::new("https://relay.example", broker);
        relay.fail_subscribe = true;
        let probe = PubSubRoundTripProbe::new(reference.clone(), vec![Arc::new(relay)]);

        let outcome = probe.run(&Target::new(Category::Relay, "https://relay.example")).await;
        assert!(!outcome.success);
        assert_eq!(outcome.payload["lastSubscribeSuccess"], false);
        assert_eq!(reference.unsubscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_wait_ignores_other_messages() {
        let broker = Arc::new(FakeBroker::default());
        let relay = FakePubsub::new("https://relay.example", broker);
        let mut sub = relay.subscribe("t").await.unwrap();
        relay.publish("t", b"noise").await.unwrap();
        relay.publish("t", b"wanted").await.unwrap();

        wait_for_message(&mut sub, b"wanted", Duration::from_secs(1)).await.unwrap();
        let missing = wait_for_message(&mut sub, b"wanted", Duration::from_millis(50)).await;
        assert!(matches!(missing, Err(ProbeError::Timeout(_))));
    }
}
