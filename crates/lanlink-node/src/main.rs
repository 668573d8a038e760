//! Lanlink node entry point.
//!
//! Wires together the runtime substrate and the networking services, then
//! blocks until shutdown.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ load_config()          -- TOML settings with defaults
//!  └─ bind_control_listener  -- port scan for the HTTP surface
//!  └─ Broker                 -- connection tables + handshake
//!  └─ Discovery              -- UDP heartbeat + listener
//!  └─ axum control server    -- /connect and /status
//! ```

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lanlink_node::application::presence;
use lanlink_node::infrastructure::http::{bind_control_listener, control_router, ControlState};
use lanlink_node::infrastructure::network::{Broker, BrokerConfig, Discovery, DiscoveryConfig, HandlerRegistry};
use lanlink_node::infrastructure::storage::load_config;
use lanlink_node::runtime::Scheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;

    // Initialise structured logging.  `RUST_LOG` overrides the config level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.node.log_level.clone())),
        )
        .init();

    info!("Lanlink node starting");

    let hostname = whoami::fallible::hostname().unwrap_or_else(|_| "localhost".to_owned());
    let bind_address: IpAddr = config
        .network
        .bind_address
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid bind_address in config: {err}"))?;

    let scheduler = Scheduler::new();
    let handlers = Arc::new(HandlerRegistry::new());
    presence::register(&handlers);

    // ── Control surface ───────────────────────────────────────────────────────
    let (listener, control_port) = bind_control_listener(
        bind_address,
        config.network.control_port_base,
        config.network.ports_to_try,
    )
    .await?;

    // ── Connection broker ─────────────────────────────────────────────────────
    let broker = Broker::new(
        BrokerConfig {
            advertised_host: hostname.clone(),
            control_port,
            handshake_timeout: config.network.handshake_timeout(),
        },
        scheduler.clone(),
        Arc::clone(&handlers),
    );

    // ── Discovery ─────────────────────────────────────────────────────────────
    let discovery = Discovery::bind(
        DiscoveryConfig {
            discovery_port: config.network.discovery_port,
            control_port,
            heartbeat_interval: config.network.heartbeat_interval(),
        },
        scheduler.clone(),
        broker.clone(),
    )?;
    discovery.start();

    // ── HTTP server ───────────────────────────────────────────────────────────
    let router = control_router(ControlState {
        broker,
        hostname: hostname.clone(),
        port: control_port,
    });
    scheduler.spawn("control-server", async move {
        lanlink_node::infrastructure::http::control::serve(listener, router).await?;
        Ok(())
    });

    info!(host = %hostname, control_port, "Lanlink node ready.  Press Ctrl-C to exit.");

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "shutdown signal listener failed");
    }
    info!("Lanlink node stopped");
    Ok(())
}
