//! Contrail - uptime monitor for a decentralized content network.
//!
//! Periodically runs synthetic round trips against gateways, content
//! routers, pub/sub relays, name services and the application nodes listed
//! in one or more descriptor documents, and serves the resulting health
//! state, history and reliability statistics over HTTP.

mod clients;
mod config;
mod db;
mod history;
mod keys;
mod metrics;
mod probe;
mod registry;
mod reliability;
mod scheduler;
mod state;
mod web;

use clients::{
    ContentStore, DohResolver, HttpFetcher, HttpProviderSource, KuboContentStore, KuboPubsubClient, NameResolver,
    ProviderSource, PubsubClient,
};
use config::{Intervals, MonitorConfig, ServerConfig};
use db::Store;
use history::HistorySnapshotter;
use metrics::{MetricsRegistry, MetricsSink};
use probe::{
    ContentRoundTripProbe, ContentRoutingProbe, DomainSnapshotProbe, ListenTimings, ListenerSupervisor,
    NameProvidersProbe, NameResolutionProbe, NodeUpdateProbe, PubSubRoundTripProbe, RouterRoundTripProbe,
    StaticContentProbe, Target, TargetMeta,
};
use registry::{TargetRegistry, INITIAL_RETRY};
use reliability::ReliabilityAggregator;
use scheduler::{Discipline, Job, Reporter, RetentionManager, Scheduler, Selector};
use state::{Category, StateStore};
use web::{AppState, Server};

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const PERSIST_EVERY: Duration = Duration::from_secs(60);
const SNAPSHOT_EVERY: Duration = Duration::from_secs(60);
const HISTORY_CACHE_EVERY: Duration = Duration::from_secs(5 * 60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("contrail=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    let monitor = MonitorConfig::load(&cfg.config_path)?;
    let disabled = monitor.validate()?;
    for category in &disabled {
        tracing::warn!("Nothing configured for {}, not probing it", category);
    }
    tracing::info!("Starting Contrail on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database and state
    let store = Arc::new(Store::new(&cfg.db_path)?);
    let state = Arc::new(StateStore::load(&store));
    tracing::info!("Database initialized successfully");

    let http = HttpFetcher::new(cfg.proxy_url.as_deref(), HTTP_TIMEOUT)?;
    let streaming = HttpFetcher::streaming(cfg.proxy_url.as_deref(), CONNECT_TIMEOUT)?;

    let metrics = Arc::new(MetricsRegistry::new());
    let sink: Arc<dyn MetricsSink> = metrics.clone();
    let log_tx = scheduler::spawn_outcome_writer(store.clone());
    let reporter = Arc::new(Reporter::new(state.clone(), sink, log_tx));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut shutdown_rx = shutdown_tx.subscribe();
    let ctrl_c_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down...");
            let _ = ctrl_c_tx.send(());
        }
    });

    // Node list must be known before node probes can be scheduled
    let registry = Arc::new(TargetRegistry::new(monitor.descriptor_sources.clone(), http.clone()));
    if !registry.wait_until_loaded(INITIAL_RETRY, &mut shutdown_rx).await {
        return Ok(());
    }
    registry
        .clone()
        .spawn_refresh_loop(Intervals::secs(monitor.intervals.registry_refresh), shutdown_tx.subscribe());

    // Start probe jobs
    let scheduler = Scheduler::new(reporter.clone(), registry.clone());
    for job in build_jobs(&monitor, &disabled, &http, &streaming) {
        scheduler.add_job(job).await;
    }

    let listeners = if monitor.reference_relay_url.is_empty() {
        None
    } else {
        let client: Arc<dyn PubsubClient> = Arc::new(KuboPubsubClient::new(&monitor.reference_relay_url, streaming.clone()));
        let supervisor = Arc::new(ListenerSupervisor::new(
            client,
            reporter.clone(),
            registry.clone(),
            ListenTimings::default(),
        ));
        supervisor.clone().spawn_loop(Intervals::secs(monitor.intervals.listeners));
        Some(supervisor)
    };

    // Housekeeping
    state::spawn_persist_loop(state.clone(), store.clone(), PERSIST_EVERY, shutdown_tx.subscribe());

    let history = Arc::new(HistorySnapshotter::new(store.clone(), state.clone()));
    if let Err(e) = history.refresh_cache() {
        tracing::error!("Failed to load history cache: {}", e);
    }
    history
        .clone()
        .spawn_loops(SNAPSHOT_EVERY, HISTORY_CACHE_EVERY, shutdown_tx.subscribe());

    let retention = RetentionManager::new(store.clone());
    retention.start();

    // Start web server
    let server = Server::new(
        cfg,
        AppState {
            state: state.clone(),
            history,
            reliability: Arc::new(ReliabilityAggregator::new(store.clone())),
            metrics,
        },
    );
    tokio::select! {
        result = server.start() => result?,
        _ = shutdown_rx.recv() => {}
    }

    scheduler.stop().await;
    retention.stop().await;
    if let Some(listeners) = listeners {
        listeners.stop();
    }
    if let Err(e) = store.save_state(&state.document()) {
        tracing::error!("Failed to persist health state on shutdown: {}", e);
    }

    Ok(())
}

/// One job per enabled probe kind.
fn build_jobs(
    monitor: &MonitorConfig,
    disabled: &BTreeSet<Category>,
    http: &HttpFetcher,
    streaming: &HttpFetcher,
) -> Vec<Job> {
    let intervals = &monitor.intervals;
    let warmup = Intervals::secs(intervals.warmup);
    let mut jobs = Vec::new();

    let gateways: Vec<Target> = monitor
        .gateways
        .iter()
        .map(|url| Target::new(Category::Gateway, url.trim_end_matches('/')))
        .collect();
    let routers: Vec<Target> = monitor
        .routers
        .iter()
        .map(|url| Target::new(Category::ContentRouter, url.trim_end_matches('/')))
        .collect();
    let router_sources: Vec<Arc<dyn ProviderSource>> = monitor
        .routers
        .iter()
        .map(|url| Arc::new(HttpProviderSource::new(url, http.clone())) as Arc<dyn ProviderSource>)
        .collect();

    if !disabled.contains(&Category::ApplicationNode) {
        let resolver = monitor
            .name_services
            .first()
            .map(|ns| Arc::new(DohResolver::new(&ns.url, http.clone())) as Arc<dyn NameResolver>);
        jobs.push(Job {
            name: "node-updates".to_string(),
            interval: Intervals::secs(intervals.node_updates),
            warmup: Duration::ZERO,
            discipline: Discipline::Sequential {
                delay: Duration::from_secs(1),
            },
            timeout: Duration::from_secs(5 * 60),
            selector: Selector::Nodes,
            probe: Arc::new(NodeUpdateProbe::new(http.clone(), &monitor.reference_gateway, resolver)),
        });

        let dht_sources: Vec<Arc<dyn ProviderSource>> = monitor
            .delegated_routing_urls
            .iter()
            .map(|url| Arc::new(HttpProviderSource::new(url, http.clone())) as Arc<dyn ProviderSource>)
            .collect();
        if !dht_sources.is_empty() {
            jobs.push(Job {
                name: "dht-providers".to_string(),
                interval: Intervals::secs(intervals.routers),
                warmup,
                discipline: Discipline::FanOut,
                timeout: Duration::from_secs(2 * 60),
                selector: Selector::NodesWithInfo,
                probe: Arc::new(ContentRoutingProbe::dht(dht_sources)),
            });
        }
    }

    if !disabled.contains(&Category::Gateway) {
        let content: Arc<dyn ContentStore> = Arc::new(KuboContentStore::new(&monitor.content_api_url, http.clone()));
        jobs.push(Job {
            name: "gateway-content".to_string(),
            interval: Intervals::secs(intervals.gateways),
            warmup: Duration::ZERO,
            discipline: Discipline::FanOut,
            timeout: Duration::from_secs(6 * 60),
            selector: Selector::Fixed(gateways.clone()),
            probe: Arc::new(ContentRoundTripProbe::new(content, http.clone())),
        });
        jobs.push(Job {
            name: "gateway-snapshots".to_string(),
            interval: Intervals::secs(intervals.gateways),
            warmup,
            discipline: Discipline::FanOut,
            timeout: Duration::from_secs(5 * 60),
            selector: Selector::PerNode(gateways),
            probe: Arc::new(DomainSnapshotProbe::new(http.clone())),
        });
    }

    if !disabled.contains(&Category::ContentRouter) {
        jobs.push(Job {
            name: "router-providers".to_string(),
            interval: Intervals::secs(intervals.routers),
            warmup,
            discipline: Discipline::FanOut,
            timeout: Duration::from_secs(2 * 60),
            selector: Selector::NodesWithInfo,
            probe: Arc::new(ContentRoutingProbe::routers(router_sources.clone())),
        });
        jobs.push(Job {
            name: "router-name-providers".to_string(),
            interval: Intervals::secs(intervals.routers),
            warmup,
            discipline: Discipline::FanOut,
            timeout: Duration::from_secs(2 * 60),
            selector: Selector::PerNode(routers.clone()),
            probe: Arc::new(NameProvidersProbe::new(router_sources)),
        });
        jobs.push(Job {
            name: "router-provide".to_string(),
            interval: Intervals::secs(intervals.routers),
            warmup: Duration::ZERO,
            discipline: Discipline::FanOut,
            timeout: Duration::from_secs(3 * 60),
            selector: Selector::Fixed(routers),
            probe: Arc::new(RouterRoundTripProbe::new(http.clone(), monitor.announce_ip.clone())),
        });
    }

    if !disabled.contains(&Category::Relay) {
        let reference: Arc<dyn PubsubClient> =
            Arc::new(KuboPubsubClient::new(&monitor.reference_relay_url, streaming.clone()));
        let relays: Vec<Arc<dyn PubsubClient>> = monitor
            .relays
            .iter()
            .map(|url| Arc::new(KuboPubsubClient::new(url, streaming.clone())) as Arc<dyn PubsubClient>)
            .collect();
        jobs.push(Job {
            name: "relays".to_string(),
            interval: Intervals::secs(intervals.relays),
            warmup: Duration::ZERO,
            discipline: Discipline::FanOut,
            // both directions may wait out the full pub/sub timeout
            timeout: Duration::from_secs(11 * 60),
            selector: Selector::Fixed(
                monitor
                    .relays
                    .iter()
                    .map(|url| Target::new(Category::Relay, url.trim_end_matches('/')))
                    .collect(),
            ),
            probe: Arc::new(PubSubRoundTripProbe::new(reference, relays)),
        });
    }

    if !disabled.contains(&Category::NameService) {
        let resolvers: HashMap<String, Arc<dyn NameResolver>> = monitor
            .name_services
            .iter()
            .map(|ns| {
                let resolver: Arc<dyn NameResolver> = Arc::new(DohResolver::new(&ns.url, http.clone()));
                (ns.url.clone(), resolver)
            })
            .collect();
        jobs.push(Job {
            name: "name-services".to_string(),
            interval: Intervals::secs(intervals.name_services),
            warmup: Duration::ZERO,
            discipline: Discipline::FanOut,
            timeout: Duration::from_secs(2 * 60),
            selector: Selector::Fixed(
                monitor
                    .name_services
                    .iter()
                    .map(|ns| {
                        Target::new(Category::NameService, ns.url.clone()).with_meta(TargetMeta::NameService {
                            name: ns.name.clone(),
                            record: ns.record.clone(),
                        })
                    })
                    .collect(),
            ),
            probe: Arc::new(NameResolutionProbe::new(resolvers)),
        });
    }

    if !disabled.contains(&Category::StaticPage) {
        jobs.push(Job {
            name: "static-pages".to_string(),
            interval: Intervals::secs(intervals.static_pages),
            warmup: Duration::ZERO,
            discipline: Discipline::FanOut,
            timeout: Duration::from_secs(2 * 60),
            selector: Selector::Fixed(
                monitor
                    .static_pages
                    .iter()
                    .map(|page| {
                        Target::new(Category::StaticPage, page.url.clone()).with_meta(TargetMeta::StaticPage {
                            pattern: page.pattern.clone(),
                        })
                    })
                    .collect(),
            ),
            probe: Arc::new(StaticContentProbe::new(http.clone())),
        });
    }

    jobs
}
