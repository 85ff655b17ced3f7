use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rover_edge::camera::{default_driver, CameraService, DeviceRegistry};
use rover_edge::mavlink::{publish_events, serve_commands, NodeConfig, TelemetryBridge};
use rover_edge::relay::{Overlay, Relay, TailscaleOverlay};
use rover_edge::web::{self, AppState, NodeInfo};
use rover_edge::Config;

/// Observer channel capacity between the bridge and the bus publisher
const TELEMETRY_QUEUE: usize = 256;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    let default_level = if config.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    if let Err(e) = run(config).await {
        error!("Fatal: {:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    info!("Edge runtime starting: {}", config.hostname);

    let overlay: Arc<dyn Overlay> = Arc::new(TailscaleOverlay::new(config.tun.clone()));
    let relay = Relay::start(&config.relay(), overlay)
        .await
        .context("Relay startup failed")?;
    info!("  Bus: {}", relay.public_addr());
    if let Some(ws) = relay.public_ws_addr() {
        info!("  Bus WebSocket: {}", ws);
    }

    let cancel = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Telemetry bridge, wired to the bus
    let bridge = match &config.mavlink {
        Some(endpoint) => {
            let (events_tx, events_rx) = mpsc::channel(TELEMETRY_QUEUE);
            let bridge = TelemetryBridge::configure(endpoint, events_tx)
                .context("Invalid MAVLink endpoint")?
                .with_node_config(NodeConfig {
                    stream_requests: config.stream_request,
                    ..Default::default()
                });
            let bridge = Arc::new(bridge);

            tasks.push(tokio::spawn(publish_events(relay.bus(), events_rx, cancel.clone())));

            let bus = relay.bus();
            let commands = bridge.commands();
            let command_cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = serve_commands(bus, commands, command_cancel).await {
                    warn!("Command listener stopped: {:#}", e);
                }
            }));

            let running = bridge.clone();
            tasks.push(tokio::spawn(async move {
                // Failing the first open only disables telemetry; later link
                // drops are redialled inside start()
                if let Err(e) = running.start().await {
                    error!("MAVLink bridge failed: {:#}", e);
                }
            }));

            info!("  MAVLink: {}", bridge.endpoint());
            Some(bridge)
        }
        None => {
            info!("  MAVLink: disabled");
            None
        }
    };

    // Camera service and its HTTP surface
    let camera = if config.no_camera {
        info!("  Camera: disabled");
        None
    } else {
        let camera = CameraService::new(
            default_driver(),
            DeviceRegistry::new(&config.sysfs_root, "/dev"),
            config.capture(),
        );
        let listener = relay
            .listen(config.web_port)
            .await
            .context("Failed to open camera HTTP listener")?;

        let node = NodeInfo {
            hostname: config.hostname.clone(),
            bus_port: relay.public_addr().port(),
            ws_port: relay.public_ws_addr().map_or(config.ws_port, |addr| addr.port()),
            web_port: listener.local_addr()?.port(),
            addresses: relay.session().map(|s| s.addresses.clone()).unwrap_or_default(),
        };
        let state = AppState::new(camera.clone(), relay.bus(), node);

        let server = {
            let shutdown = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = web::serve(listener, state, shutdown).await {
                    error!("{:#}", e);
                }
            })
        };
        Some((camera, server))
    };

    wait_for_signal().await;
    info!("Shutting down...");

    cancel.cancel();
    if let Some(bridge) = &bridge {
        bridge.close();
    }
    if let Some((camera, server)) = camera {
        camera.shutdown().await;
        let _ = server.await;
    }
    for task in tasks {
        let _ = task.await;
    }

    relay.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("SIGTERM handler unavailable: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
