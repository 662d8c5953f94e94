//! Scheduler module for running probe jobs and recording their outcomes.

mod retention;

pub use retention::*;

use crate::db::{OutcomeRecord, Store};
use crate::metrics::MetricsSink;
use crate::probe::{NodeInfo, Probe, ProbeError, ProbeOutcome, Target};
use crate::registry::TargetRegistry;
use crate::state::{Category, StateStore};

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};

/// Applies probe outcomes to the state store, metrics and outcome log.
pub struct Reporter {
    state: Arc<StateStore>,
    metrics: Arc<dyn MetricsSink>,
    log_tx: mpsc::Sender<OutcomeRecord>,
}

impl Reporter {
    pub fn new(state: Arc<StateStore>, metrics: Arc<dyn MetricsSink>, log_tx: mpsc::Sender<OutcomeRecord>) -> Self {
        Self { state, metrics, log_tx }
    }

    pub fn state(&self) -> &Arc<StateStore> {
        &self.state
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    pub fn report(&self, outcome: &ProbeOutcome) {
        let spec = outcome.kind.spec();
        self.state.increment(&outcome.target, spec.count, 1);
        self.state.merge(&outcome.target, outcome.fields());
        self.metrics.observe(outcome);

        if spec.logged {
            if let Err(e) = self.log_tx.try_send(OutcomeRecord::from(outcome)) {
                tracing::debug!("Dropping outcome log entry for {}: {}", outcome.target, e);
            }
        }

        match &outcome.reason {
            None => tracing::debug!(
                "{} {} ok in {:.3}s",
                spec.name,
                outcome.target,
                outcome.latency.unwrap_or_default()
            ),
            Some(reason) => tracing::warn!("{} {} failed: {}", spec.name, outcome.target, reason),
        }
    }
}

impl From<&ProbeOutcome> for OutcomeRecord {
    fn from(outcome: &ProbeOutcome) -> Self {
        OutcomeRecord {
            time: outcome.timestamp,
            kind: outcome.kind.as_str().to_string(),
            target: outcome.target.to_string(),
            success: outcome.success,
            latency: outcome.latency,
            attempts: outcome.attempts,
        }
    }
}

/// How one tick walks its targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// All targets at once
    FanOut,
    /// One at a time, pausing `delay` between targets
    Sequential { delay: Duration },
}

/// Which targets a job probes on each tick.
#[derive(Debug, Clone)]
pub enum Selector {
    /// Configured endpoints
    Fixed(Vec<Target>),
    /// Every application node in the registry
    Nodes,
    /// Application nodes whose prerequisite data is known
    NodesWithInfo,
    /// Each configured endpoint paired with each node whose data is known
    PerNode(Vec<Target>),
}

impl Selector {
    /// Current targets. Nodes still missing prerequisite data are skipped
    /// and tried again on the next tick.
    pub fn resolve(&self, registry: &TargetRegistry, state: &StateStore) -> Vec<Target> {
        match self {
            Selector::Fixed(targets) => targets.clone(),
            Selector::Nodes => registry
                .nodes()
                .iter()
                .map(|address| Target::new(Category::ApplicationNode, address.clone()))
                .collect(),
            Selector::NodesWithInfo => known_nodes(registry, state)
                .into_iter()
                .map(|node| Target::new(Category::ApplicationNode, node.address.clone()).with_node(node))
                .collect(),
            Selector::PerNode(endpoints) => {
                let nodes = known_nodes(registry, state);
                endpoints
                    .iter()
                    .flat_map(|endpoint| nodes.iter().map(move |node| endpoint.clone().with_node(node.clone())))
                    .collect()
            }
        }
    }
}

fn known_nodes(registry: &TargetRegistry, state: &StateStore) -> Vec<NodeInfo> {
    registry
        .nodes()
        .iter()
        .filter_map(|address| {
            let node = NodeInfo::lookup(state, address);
            if node.is_none() {
                tracing::debug!("Skipping {}: prerequisite data not known yet", address);
            }
            node
        })
        .collect()
}

/// A repeating probe job for one category.
pub struct Job {
    pub name: String,
    pub interval: Duration,
    /// Delay before the first tick
    pub warmup: Duration,
    pub discipline: Discipline,
    /// Per-target budget; the probe is abandoned and reported failed after it
    pub timeout: Duration,
    pub selector: Selector,
    pub probe: Arc<dyn Probe>,
}

/// The main scheduler that runs one independent loop per job.
pub struct Scheduler {
    reporter: Arc<Reporter>,
    registry: Arc<TargetRegistry>,
    stop_chans: Arc<RwLock<HashMap<String, broadcast::Sender<()>>>>,
}

impl Scheduler {
    pub fn new(reporter: Arc<Reporter>, registry: Arc<TargetRegistry>) -> Self {
        Self {
            reporter,
            registry,
            stop_chans: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start running a job. A job with the same name already running is left
    /// alone.
    pub async fn add_job(&self, job: Job) {
        let mut stop_chans = self.stop_chans.write().await;

        if stop_chans.contains_key(&job.name) {
            return;
        }

        let (stop_tx, _) = broadcast::channel(1);
        stop_chans.insert(job.name.clone(), stop_tx.clone());
        drop(stop_chans);

        tracing::info!(
            "Scheduler: Adding job {} every {:?} (warmup {:?})",
            job.name,
            job.interval,
            job.warmup
        );

        let reporter = self.reporter.clone();
        let registry = self.registry.clone();
        let stop_chans = self.stop_chans.clone();
        let name = job.name.clone();

        tokio::spawn(async move {
            run_job_loop(Arc::new(job), reporter, registry, stop_tx.subscribe()).await;

            let mut chans = stop_chans.write().await;
            chans.remove(&name);
        });
    }

    /// Stop every running job.
    pub async fn stop(&self) {
        let stop_chans = self.stop_chans.read().await;
        for (name, stop_tx) in stop_chans.iter() {
            let _ = stop_tx.send(());
            tracing::info!("Scheduler: Stopped job {}", name);
        }
    }
}

async fn run_job_loop(
    job: Arc<Job>,
    reporter: Arc<Reporter>,
    registry: Arc<TargetRegistry>,
    mut stop_rx: broadcast::Receiver<()>,
) {
    if !job.warmup.is_zero() {
        tokio::select! {
            _ = stop_rx.recv() => return,
            _ = tokio::time::sleep(job.warmup) => {}
        }
    }

    // One tick at a time; a slow tick makes the next ones skip
    let semaphore = Arc::new(tokio::sync::Semaphore::new(1));

    let mut interval = tokio::time::interval(job.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => {
                break;
            }
            _ = interval.tick() => {
                let permit = match semaphore.clone().try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        tracing::warn!("Skipping tick of {}: previous tick still running", job.name);
                        continue;
                    }
                };

                let job = job.clone();
                let reporter = reporter.clone();
                let registry = registry.clone();

                tokio::spawn(async move {
                    let _permit = permit;
                    run_tick(&job, &reporter, &registry).await;
                });
            }
        }
    }
}

/// Probe every current target of `job` once.
pub async fn run_tick(job: &Job, reporter: &Reporter, registry: &TargetRegistry) {
    let targets = job.selector.resolve(registry, reporter.state());
    tracing::debug!("{}: probing {} targets", job.name, targets.len());

    match job.discipline {
        Discipline::FanOut => {
            join_all(targets.into_iter().map(|target| async move {
                let outcome = run_guarded(job.probe.clone(), target, job.timeout).await;
                reporter.report(&outcome);
            }))
            .await;
        }
        Discipline::Sequential { delay } => {
            for (i, target) in targets.into_iter().enumerate() {
                if i > 0 && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let outcome = run_guarded(job.probe.clone(), target, job.timeout).await;
                reporter.report(&outcome);
            }
        }
    }
}

/// Run a probe in its own task so neither a panic nor a hang escapes: both
/// become failure outcomes. A timed out probe keeps running in the
/// background until its own I/O finishes.
pub async fn run_guarded(probe: Arc<dyn Probe>, target: Target, timeout: Duration) -> ProbeOutcome {
    let kind = probe.kind();
    let handle = {
        let target = target.clone();
        tokio::spawn(async move { probe.run(&target).await })
    };

    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => ProbeOutcome::failure(kind, &target, 0, format!("probe crashed: {}", e)),
        Err(_) => ProbeOutcome::failure(kind, &target, 0, ProbeError::Timeout(timeout)),
    }
}

/// Start the outcome log writer and return its input channel.
pub fn spawn_outcome_writer(store: Arc<Store>) -> mpsc::Sender<OutcomeRecord> {
    let (tx, rx) = mpsc::channel(1000);
    tokio::spawn(run_batch_writer(rx, store));
    tx
}

/// Run the batch writer that accumulates and flushes outcome records.
async fn run_batch_writer(mut rx: mpsc::Receiver<OutcomeRecord>, store: Arc<Store>) {
    let mut buffer: Vec<OutcomeRecord> = Vec::with_capacity(100);
    let mut interval = tokio::time::interval(Duration::from_secs(2));

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Some(r) => {
                        buffer.push(r);
                        if buffer.len() >= 500 {
                            flush_buffer(&store, &mut buffer);
                        }
                    }
                    None => {
                        // Channel closed, flush remaining and exit
                        flush_buffer(&store, &mut buffer);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(&store, &mut buffer);
            }
        }
    }
}

fn flush_buffer(store: &Store, buffer: &mut Vec<OutcomeRecord>) {
    if buffer.is_empty() {
        return;
    }

    if let Err(e) = store.add_outcomes(buffer) {
        tracing::error!("Failed to flush outcome log: {}", e);
    }

    buffer.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::HttpFetcher;
    use crate::metrics::MetricsRegistry;
    use crate::probe::fakes::FakeContentStore;
    use crate::probe::{ContentRoundTripProbe, ProbeKind};
    use crate::state::StateKey;
    use crate::testutil::serve;
    use async_trait::async_trait;
    use axum::{extract::Path, extract::State, http::StatusCode, routing::get, Router};
    use chrono::Utc;
    use serde_json::{json, Map};
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    fn reporter() -> (Arc<Reporter>, mpsc::Receiver<OutcomeRecord>) {
        let (log_tx, log_rx) = mpsc::channel(16);
        let reporter = Reporter::new(Arc::new(StateStore::new()), Arc::new(MetricsRegistry::new()), log_tx);
        (Arc::new(reporter), log_rx)
    }

    fn registry(nodes: &[&str]) -> TargetRegistry {
        let registry = TargetRegistry::new(vec![], HttpFetcher::new(None, Duration::from_secs(1)).unwrap());
        registry.publish(nodes.iter().map(|n| n.to_string()).collect());
        registry
    }

    fn job(probe: Arc<dyn Probe>, selector: Selector, discipline: Discipline) -> Job {
        Job {
            name: "test".to_string(),
            interval: Duration::from_secs(60),
            warmup: Duration::ZERO,
            discipline,
            timeout: Duration::from_millis(500),
            selector,
            probe,
        }
    }

    /// Probe that records the order targets ran in.
    struct RecordingProbe {
        seen: Mutex<Vec<String>>,
        sleep: Duration,
    }

    #[async_trait]
    impl Probe for RecordingProbe {
        fn kind(&self) -> ProbeKind {
            ProbeKind::PageFetch
        }

        async fn run(&self, target: &Target) -> ProbeOutcome {
            self.seen.lock().unwrap().push(format!("start {}", target.id));
            tokio::time::sleep(self.sleep).await;
            self.seen.lock().unwrap().push(format!("end {}", target.id));
            ProbeOutcome::success(self.kind(), target, self.sleep, 1)
        }
    }

    struct PanickingProbe;

    #[async_trait]
    impl Probe for PanickingProbe {
        fn kind(&self) -> ProbeKind {
            ProbeKind::PageFetch
        }

        async fn run(&self, _target: &Target) -> ProbeOutcome {
            panic!("probe bug")
        }
    }

    fn pages(ids: &[&str]) -> Selector {
        Selector::Fixed(ids.iter().map(|id| Target::new(Category::StaticPage, *id)).collect())
    }

    type Blobs = Arc<Mutex<StdHashMap<String, Vec<u8>>>>;

    #[tokio::test]
    async fn test_gateway_round_trip_end_to_end() {
        let store = Arc::new(FakeContentStore::default());
        let app = Router::new()
            .route(
                "/ipfs/{cid}",
                get(|State(blobs): State<Blobs>, Path(cid): Path<String>| async move {
                    match blobs.lock().unwrap().get(&cid) {
                        Some(data) => (StatusCode::OK, String::from_utf8_lossy(data).to_string()),
                        None => (StatusCode::NOT_FOUND, String::new()),
                    }
                }),
            )
            .with_state(store.blobs.clone());
        let gateway = serve(app).await;

        let http = HttpFetcher::new(None, Duration::from_secs(5)).unwrap();
        let probe = ContentRoundTripProbe::new(store, http).with_propagation_delay(Duration::ZERO);
        let job = job(
            Arc::new(probe),
            Selector::Fixed(vec![Target::new(Category::Gateway, gateway.clone())]),
            Discipline::FanOut,
        );
        let (reporter, mut log_rx) = reporter();

        run_tick(&job, &reporter, &registry(&[])).await;

        let record = reporter.state().get(&StateKey::new(Category::Gateway, gateway)).unwrap();
        assert_eq!(record["lastFetchSuccess"], true);
        assert_eq!(record["fetchCount"], 1);
        assert!(record["lastFetchTime"].as_f64().unwrap() > 0.0);
        let logged = log_rx.try_recv().unwrap();
        assert_eq!(logged.kind, "contentFetch");
        assert!(logged.success);
    }

    #[tokio::test]
    async fn test_sequential_runs_in_order() {
        let probe = Arc::new(RecordingProbe {
            seen: Mutex::new(vec![]),
            sleep: Duration::from_millis(20),
        });
        let job = job(
            probe.clone(),
            pages(&["a", "b"]),
            Discipline::Sequential {
                delay: Duration::from_millis(5),
            },
        );
        let (reporter, _log_rx) = reporter();

        run_tick(&job, &reporter, &registry(&[])).await;
        assert_eq!(*probe.seen.lock().unwrap(), vec!["start a", "end a", "start b", "end b"]);
    }

    #[tokio::test]
    async fn test_fan_out_runs_concurrently() {
        let probe = Arc::new(RecordingProbe {
            seen: Mutex::new(vec![]),
            sleep: Duration::from_millis(50),
        });
        let job = job(probe.clone(), pages(&["a", "b"]), Discipline::FanOut);
        let (reporter, _log_rx) = reporter();

        run_tick(&job, &reporter, &registry(&[])).await;
        let seen = probe.seen.lock().unwrap();
        assert!(seen[0].starts_with("start") && seen[1].starts_with("start"), "{:?}", seen);
    }

    #[tokio::test]
    async fn test_timeout_and_panic_become_failures() {
        let slow = Arc::new(RecordingProbe {
            seen: Mutex::new(vec![]),
            sleep: Duration::from_secs(5),
        });
        let outcome = run_guarded(slow, Target::new(Category::StaticPage, "a"), Duration::from_millis(20)).await;
        assert!(!outcome.success);
        assert!(outcome.reason.unwrap().contains("timed out"));

        let outcome = run_guarded(Arc::new(PanickingProbe), Target::new(Category::StaticPage, "b"), Duration::from_secs(1)).await;
        assert!(!outcome.success);
        assert!(outcome.reason.unwrap().contains("crashed"));
    }

    #[tokio::test]
    async fn test_nodes_without_info_are_skipped() {
        let (reporter, _log_rx) = reporter();
        let registry = registry(&["ready.example", "pending.example"]);
        let mut fields = Map::new();
        fields.insert("publicKey".to_string(), json!("umVN3GWZtpq4ZJokGwplTbyOt5HGJ03wDHTbQ4m3rxg"));
        fields.insert("pubsubTopic".to_string(), json!("topic"));
        reporter
            .state()
            .merge(&StateKey::new(Category::ApplicationNode, "ready.example"), fields);

        let targets = Selector::NodesWithInfo.resolve(&registry, reporter.state());
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].id, "ready.example");

        assert_eq!(Selector::Nodes.resolve(&registry, reporter.state()).len(), 2);

        let per_node = Selector::PerNode(vec![
            Target::new(Category::Gateway, "https://a.example"),
            Target::new(Category::Gateway, "https://b.example"),
        ])
        .resolve(&registry, reporter.state());
        assert_eq!(per_node.len(), 2);
        assert!(per_node.iter().all(|t| t.node.as_ref().unwrap().address == "ready.example"));
    }

    #[tokio::test]
    async fn test_failure_zero_fills_state() {
        let (reporter, _log_rx) = reporter();
        let target = Target::new(Category::ApplicationNode, "node.example");
        reporter.report(&ProbeOutcome::failure(ProbeKind::RouterProviders, &target, 1, "down"));

        let record = reporter
            .state()
            .get(&StateKey::new(Category::ApplicationNode, "node.example"))
            .unwrap();
        assert_eq!(record["lastRouterPeersFetchSuccess"], false);
        assert_eq!(record["pubsubRouterPeerCount"], 0);
        assert_eq!(record["routerPeersFetchCount"], 1);
    }

    #[tokio::test]
    async fn test_batch_writer_flushes_on_close() {
        let file = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(file.path()).unwrap());
        let (tx, rx) = mpsc::channel(10);
        let writer = tokio::spawn(run_batch_writer(rx, store.clone()));

        let target = Target::new(Category::Gateway, "https://gw.example");
        let outcome = ProbeOutcome::success(ProbeKind::ContentFetch, &target, Duration::from_secs(1), 1);
        tx.send(OutcomeRecord::from(&outcome)).await.unwrap();
        drop(tx);
        writer.await.unwrap();

        let since = Utc::now() - chrono::Duration::hours(1);
        let rows = store
            .get_outcomes("contentFetch", "gateways:https://gw.example", since)
            .unwrap();
        assert_eq!(rows.len(), 1);
    }
}
