//! HTTP surface
//!
//! - `GET /stream`: live `multipart/x-mixed-replace` MJPEG stream
//! - `GET /api/cameras`: discovered capture devices
//! - `GET /api/init`: ports and addresses a dashboard needs to connect
//! - `GET /api/status`: broker counters, uptime and overlay addresses

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::bus::BusHandle;
use crate::camera::{self, CameraService, SessionState, StreamViewer};

/// Path browser clients use for the bus WebSocket
pub const WS_PATH: &str = "/nats-ws";

/// Static facts about this node, reported by `/api/init` and `/api/status`
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub hostname: String,
    pub bus_port: u16,
    pub ws_port: u16,
    pub web_port: u16,
    /// Overlay addresses; empty in local-only mode
    pub addresses: Vec<IpAddr>,
}

/// Shared state behind every handler
#[derive(Clone)]
pub struct AppState {
    camera: CameraService,
    bus: BusHandle,
    node: Arc<NodeInfo>,
    started: Instant,
}

impl AppState {
    pub fn new(camera: CameraService, bus: BusHandle, node: NodeInfo) -> Self {
        Self {
            camera,
            bus,
            node: Arc::new(node),
            started: Instant::now(),
        }
    }
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/stream", get(stream))
        .route("/api/cameras", get(api_cameras))
        .route("/api/init", get(api_init))
        .route("/api/status", get(api_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on `listener` until `shutdown` fires and open streams have ended
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("Camera stream at http://{}/stream", addr);

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await
    .context("Web server error")?;

    info!("Web server on {} stopped", addr);
    Ok(())
}

/// GET /stream
async fn stream(State(state): State<AppState>, peer: Option<ConnectInfo<SocketAddr>>) -> Response {
    let camera = state.camera;

    // Only an idle service is started here; a start or stop in progress is
    // left alone rather than waited on
    if camera.state() == SessionState::Idle {
        if let Err(e) = camera.start_capture(None).await {
            warn!("Camera auto-start failed: {}", e);
        }
    }

    let viewer = StreamViewer::new(camera, peer.map(|ConnectInfo(addr)| addr));

    Response::builder()
        .header(header::CONTENT_TYPE, camera::CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(viewer.into_stream()))
        .unwrap_or_else(|e| {
            warn!("Failed to build stream response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })
}

/// GET /api/cameras
async fn api_cameras(State(state): State<AppState>) -> Response {
    let discovered = {
        let camera = state.camera.clone();
        tokio::task::spawn_blocking(move || camera.discover()).await
    };

    match discovered {
        Ok(Ok(devices)) => {
            let active = state.camera.active_device().map(|d| d.path);
            let body: Vec<serde_json::Value> = devices
                .into_iter()
                .map(|d| {
                    json!({
                        "active": active.as_ref() == Some(&d.path),
                        "path": d.path,
                        "name": d.name,
                    })
                })
                .collect();
            Json(body).into_response()
        }
        Ok(Err(e)) => {
            warn!("Camera discovery failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// GET /api/init
async fn api_init(State(state): State<AppState>) -> Json<serde_json::Value> {
    let node = &state.node;
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "hostname": node.hostname,
        "nats_port": node.bus_port,
        "ws_port": node.ws_port,
        "ws_path": WS_PATH,
        "web_port": node.web_port,
        "ips": node.addresses,
    }))
}

/// GET /api/status
async fn api_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let node = &state.node;
    let uptime = state.started.elapsed();
    let bus = state.bus.stats().await;

    Json(json!({
        "hostname": node.hostname,
        "uptime": format_uptime(uptime.as_secs()),
        "uptime_secs": uptime.as_secs_f64(),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "tailscale_ips": format_addresses(&node.addresses),
        "ws_port": node.ws_port,
        "ws_path": WS_PATH,
        "camera": format!("{:?}", state.camera.state()),
        "nats": {
            "url": format!("nats://{}:{}", node.hostname, node.bus_port),
            "connections": bus.connections,
            "subscriptions": bus.subscriptions,
            "messages_in": bus.messages_in,
            "messages_out": bus.messages_out,
            "bytes_in": bus.bytes_in,
            "bytes_out": bus.bytes_out,
        },
    }))
}

fn format_uptime(secs: u64) -> String {
    let (days, hours, minutes, seconds) = (secs / 86_400, secs / 3600 % 24, secs / 60 % 60, secs % 60);
    if days > 0 {
        format!("{}d {}h {}m {}s", days, hours, minutes, seconds)
    } else if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

fn format_addresses(addresses: &[IpAddr]) -> String {
    if addresses.is_empty() {
        return "none".to_string();
    }
    addresses.iter().map(IpAddr::to_string).collect::<Vec<_>>().join(", ")
}
