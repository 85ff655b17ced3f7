//! WebSocket transport for bus clients
//!
//! Browser dashboards speak the same text protocol, carried in WebSocket
//! frames. Every outbound protocol frame becomes one binary message; inbound
//! binary and text messages are fed to the decoder as a byte stream.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::Router;
use futures::{SinkExt, StreamExt};
use rover_shared::codec::ServerInfo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use super::client::ClientSession;
use super::registry::Registry;

#[derive(Clone)]
pub(super) struct WsState {
    pub registry: Arc<Registry>,
    pub info: ServerInfo,
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
}

/// Upgrade on any path; clients differ in where they expect the endpoint
pub(super) fn router(state: WsState) -> Router {
    Router::new().fallback(upgrade).with_state(state)
}

async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<WsState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    let tracker = state.tracker.clone();
    ws.on_upgrade(move |socket| tracker.track_future(serve_ws_client(socket, peer, state)))
}

async fn serve_ws_client(socket: WebSocket, peer: SocketAddr, state: WsState) {
    let (mut sink, mut stream) = socket.split();
    let (mut session, mut rx) = ClientSession::attach(state.registry.clone(), state.info.clone(), peer).await;

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(Message::Binary(frame.to_vec())).await {
                debug!("Bus WebSocket write error: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        let message = tokio::select! {
            _ = state.cancel.cancelled() => break,
            message = stream.next() => message,
        };

        let keep_open = match message {
            Some(Ok(Message::Binary(data))) => session.receive(&data).await,
            Some(Ok(Message::Text(text))) => session.receive(text.as_bytes()).await,
            Some(Ok(Message::Close(_))) | None => false,
            // Pings are answered by the WebSocket layer
            Some(Ok(_)) => true,
            Some(Err(e)) => {
                debug!("Bus WebSocket read error from {}: {}", peer, e);
                false
            }
        };
        if !keep_open {
            break;
        }
    }

    let id = session.id();
    session.detach().await;
    let _ = writer_task.await;
    info!("Bus WebSocket client {} ({}) disconnected", id, peer);
}
