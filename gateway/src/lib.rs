//! Portal Gateway — reverse HTTP tunnel gateway library.
//!
//! Grounded on the teacher's `relay/src/main.rs`, which wires the same
//! pieces (config, registry, axum router, background ticks) into one
//! `main`; generalized here into a library `run()` so `gateway/tests/`
//! can drive the whole stack in-process, the way `jizhuozhi-hermes`
//! splits `hermes_gateway` from its thin bin.

pub mod access;
pub mod config;
pub mod constants;
pub mod control;
pub mod events;
pub mod forwarder;
pub mod headers;
pub mod ids;
pub mod ingress;
pub mod inspector;
pub mod management;
pub mod registry;
pub mod replay;
pub mod rolling;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use access::AccessHooks;
use config::Config;
use events::EventBus;
use inspector::Inspector;
use registry::Registry;
use replay::ReplayEngine;

/// Shared application state handed to every axum handler.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub events: Arc<EventBus>,
    pub inspector: Arc<Inspector>,
    pub access: Arc<AccessHooks>,
    pub replay: Arc<ReplayEngine>,
    pub started_at: Instant,
}

/// Build the router, bind the configured port, and serve until the process
/// is killed. Spawns the inspector's metrics and cleanup ticks alongside.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let events = Arc::new(EventBus::new());
    let registry = Arc::new(Registry::new(events.clone()));
    let inspector = Arc::new(Inspector::new(events.clone(), config.max_stored, config.retention));
    let access = Arc::new(AccessHooks::new(&config.allow_cidrs, &config.deny_cidrs));
    let replay = Arc::new(ReplayEngine::new(registry.clone(), inspector.clone(), config.request_timeout));
    let config = Arc::new(config);

    let state = GatewayState {
        config: config.clone(),
        registry,
        events,
        inspector: inspector.clone(),
        access,
        replay,
        started_at: Instant::now(),
    };

    spawn_background_ticks(inspector, state.events.clone());

    // route_layer, not layer: the gate only wraps these named routes, never
    // the fallback, which is already Host-aware on its own.
    let app = Router::new()
        .route("/tunnel", get(control::ws_handler))
        .route("/health", get(management::health))
        .route("/tunnels", get(management::list_tunnels))
        .route("/traffic", get(management::list_traffic).delete(management::purge_traffic))
        .route("/traffic/:request_id", get(management::get_traffic))
        .route("/replay/:request_id", post(management::replay))
        .route("/replay/:request_id/diff", post(management::replay_with_diff))
        .route("/metrics", get(management::metrics))
        .route("/metrics/prometheus", get(management::metrics_prometheus))
        .route_layer(middleware::from_fn_with_state(state.clone(), ingress::require_apex_host))
        .fallback(ingress::handle)
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, domain = %config.domain, "gateway listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

fn spawn_background_ticks(inspector: Arc<Inspector>, events: Arc<EventBus>) {
    tokio::spawn({
        let inspector = inspector.clone();
        async move {
            let mut tick = tokio::time::interval(constants::METRICS_TICK);
            loop {
                tick.tick().await;
                let snapshot = inspector.snapshot().await;
                events.publish(events::Topic::MetricsUpdate, serde_json::json!(snapshot));
            }
        }
    });

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(constants::CLEANUP_INTERVAL);
        loop {
            tick.tick().await;
            inspector.cleanup_tick().await;
        }
    });
}
