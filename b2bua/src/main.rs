use sip_auth::{DigestAuthenticator, UserStore};
use sip_core::transport::tcp::Tcp;
use sip_core::transport::udp::Udp;
use sip_core::Endpoint;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_b2bua::api::{self, ApiState};
use tandem_b2bua::call::CallRegistry;
use tandem_b2bua::config::Config;
use tandem_b2bua::metrics::Metrics;
use tandem_b2bua::relay::MediaRelayClient;
use tandem_b2bua::routing::{RoutingEngine, RuleStore};
use tandem_b2bua::session::SessionManager;
use tandem_b2bua::store::{KvStore, MemoryStore};
use tandem_b2bua::sweep::{self, HealthState};
use tandem_b2bua::B2buaLayer;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // the config file is optional, the outer deployment shell usually
    // renders one; everything has usable defaults
    let config = match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| format!("cannot read config {path}: {e}"))?;
            serde_json::from_str::<Config>(&raw)
                .map_err(|e| format!("cannot parse config {path}: {e}"))?
        }
        None => Config::default(),
    };

    let shutdown = CancellationToken::new();
    let metrics = Arc::new(Metrics::new());
    let health = Arc::new(HealthState::new());

    // shared stores
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());

    // routing
    let engine = Arc::new(RoutingEngine::new());
    let rules = Arc::new(RuleStore::new(store.clone(), engine.clone()));

    rules
        .reload()
        .await
        .map_err(|e| format!("failed to seed routing rules: {e}"))?;

    tokio::spawn(rules.clone().run_watcher(shutdown.clone()));

    // media relay
    let relay = Arc::new(
        MediaRelayClient::new(&config.relay)
            .await
            .map_err(|e| format!("failed to set up relay client: {e}"))?,
    );

    // sessions
    let registry = Arc::new(CallRegistry::new());
    let sessions = Arc::new(SessionManager::new(
        config.sessions.clone(),
        store.clone(),
        relay.clone(),
        registry,
        metrics.clone(),
    ));

    sessions
        .rebuild_counters()
        .await
        .map_err(|e| format!("failed to rebuild session counters: {e}"))?;

    // digest authentication
    let authenticator = config.auth.enabled.then(|| {
        let users = UserStore::new();

        for (username, password) in &config.auth.users {
            users.add_user(username.clone(), password.clone());
        }

        let mut authenticator = DigestAuthenticator::new(config.auth.realm.clone(), users);
        authenticator.replay_protection = config.auth.replay_protection;

        Arc::new(authenticator)
    });

    // the SIP endpoint with all enabled transports
    let endpoint = build_endpoint(
        &config,
        sessions.clone(),
        engine.clone(),
        authenticator.clone(),
        metrics.clone(),
    )
    .await
    .map_err(|e| format!("failed to start SIP endpoint: {e}"))?;

    // supervisory loops
    tokio::spawn(sweep::dialog_sweeper(
        sessions.clone(),
        config.sip.dialog_timeout,
        shutdown.clone(),
    ));

    if let Some(authenticator) = &authenticator {
        tokio::spawn(sweep::nonce_sweeper(
            authenticator.clone(),
            shutdown.clone(),
        ));
    }

    tokio::spawn(sweep::health_probes(
        store.clone(),
        relay.clone(),
        health.clone(),
        shutdown.clone(),
    ));

    // management API
    if config.api.enabled {
        let state = ApiState {
            sessions: sessions.clone(),
            rules: rules.clone(),
            engine: engine.clone(),
            metrics: metrics.clone(),
            health: health.clone(),
            endpoint: endpoint.clone(),
            local_identity: sip_types::uri::SipUri::parse(&config.sip.local_identity)
                .map(sip_types::uri::NameAddr::uri)
                .map_err(|e| format!("invalid local identity: {e}"))?,
            started_at: Instant::now(),
        };

        let bind = config.api.bind;
        let api_shutdown = shutdown.clone();

        tokio::spawn(async move {
            if let Err(e) = api::serve(state, bind, api_shutdown).await {
                log::error!("management API failed: {e}");
            }
        });
    }

    log::info!("tandem B2BUA up");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("failed to listen for shutdown signal: {e}"))?;

    log::info!("shutting down, draining active calls");
    shutdown.cancel();

    // graceful drain window before forcing exit
    let deadline = Instant::now() + DRAIN_TIMEOUT;

    while sessions.registry().len() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let leftover = sessions.registry().len();
    if leftover > 0 {
        log::warn!("forcing exit with {leftover} calls still active");
    }

    Ok(())
}

async fn build_endpoint(
    config: &Config,
    sessions: Arc<SessionManager>,
    engine: Arc<RoutingEngine>,
    authenticator: Option<Arc<DigestAuthenticator>>,
    metrics: Arc<Metrics>,
) -> sip_core::Result<Endpoint> {
    let mut builder = Endpoint::builder();

    for addr in &config.sip.udp {
        Udp::spawn(&mut builder, *addr).await?;
    }

    for addr in &config.sip.tcp {
        Tcp::spawn(&mut builder, *addr).await?;
    }

    #[cfg(feature = "websocket")]
    for addr in &config.sip.ws {
        sip_core::transport::websocket::Ws::spawn(&mut builder, *addr).await?;
    }

    #[cfg(not(feature = "websocket"))]
    if !config.sip.ws.is_empty() {
        log::warn!("websocket listeners configured but the feature is not compiled in");
    }

    builder.add_layer(B2buaLayer::new(
        config.sip.clone(),
        sessions,
        engine,
        authenticator,
        metrics,
    ));

    Ok(builder.build())
}
