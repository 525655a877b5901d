use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::Router;
use futures_util::future::BoxFuture;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};

use crate::error::DeliveryError;

use super::registry::{ConnectionRegistry, PayloadSink, SubscriberHandle};

/// Write half of an upgraded WebSocket.
struct WebSocketSink {
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl PayloadSink for WebSocketSink {
    fn send(&self, text: Arc<str>) -> BoxFuture<'_, Result<(), DeliveryError>> {
        Box::pin(async move {
            self.sink
                .lock()
                .await
                .send(Message::Text(text.to_string()))
                .await
                .map_err(|e| DeliveryError::Send(e.to_string()))
        })
    }
}

impl WebSocketSink {
    /// Answer the client's close frame so the close handshake completes.
    async fn reply_close(&self, frame: Option<CloseFrame<'static>>) {
        if let Err(e) = self.sink.lock().await.send(Message::Close(frame)).await {
            tracing::debug!(error = %e, "Close reply not sent");
        }
    }
}

/// Every path accepts the WebSocket upgrade.
pub fn router(registry: Arc<ConnectionRegistry>) -> Router {
    Router::new().fallback(subscribe).with_state(registry)
}

async fn subscribe(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(registry): State<Arc<ConnectionRegistry>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_subscriber(socket, remote, registry))
}

/// Register the connection, then hold it open until the client goes away.
/// Inbound messages are read only to notice the close.
async fn handle_subscriber(socket: WebSocket, remote: SocketAddr, registry: Arc<ConnectionRegistry>) {
    let (sink, mut inbound) = socket.split();
    let sink = Arc::new(WebSocketSink {
        sink: Mutex::new(sink),
    });
    let handle = SubscriberHandle::new(remote, sink.clone());
    let id = handle.id;

    registry.register(handle);
    tracing::info!(subscriber = %id, client = %remote.ip(), clients = registry.len(), "Client connected");

    while let Some(message) = inbound.next().await {
        match message {
            Ok(Message::Close(frame)) => {
                sink.reply_close(frame).await;
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(subscriber = %id, error = %e, "Client socket error");
                break;
            }
        }
    }

    registry.unregister(id);
    tracing::info!(subscriber = %id, client = %remote.ip(), clients = registry.len(), "Client disconnected");
}

/// Accept subscribers until `shutdown` turns true.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = router(registry);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}
