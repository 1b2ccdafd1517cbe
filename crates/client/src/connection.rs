use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use protocol::{ClientMessage, ServerMessage};

use crate::registry::ExecutionRegistry;

pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Ended {
    Disconnected,
    Shutdown,
}

/// Keeps a websocket to `url` open until `cancel` fires or every request
/// sender is gone, reconnecting after [`RECONNECT_DELAY`].
///
/// Requests queued while disconnected are sent once a connection is up.
/// Executions already sent on a connection that drops are completed as
/// disconnected; the server does not resume them.
pub async fn run(
    url: String,
    registry: Arc<ExecutionRegistry>,
    outbound: mpsc::Receiver<ClientMessage>,
    cancel: CancellationToken,
) {
    run_with_delay(url, registry, outbound, cancel, RECONNECT_DELAY).await
}

pub async fn run_with_delay(
    url: String,
    registry: Arc<ExecutionRegistry>,
    mut outbound: mpsc::Receiver<ClientMessage>,
    cancel: CancellationToken,
    reconnect_delay: Duration,
) {
    loop {
        debug!(event = "connection.connecting", url = %url);
        let connected = tokio::select! {
            result = tokio_tungstenite::connect_async(url.as_str()) => result,
            _ = cancel.cancelled() => return,
        };
        match connected {
            Ok((socket, _)) => {
                info!(event = "connection.connected", url = %url);
                match serve(socket, &registry, &mut outbound, &cancel).await {
                    Ended::Shutdown => return,
                    Ended::Disconnected => {
                        info!(event = "connection.disconnected", url = %url);
                    }
                }
            }
            Err(err) => {
                warn!(event = "connection.failed", url = %url, error = %err);
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = cancel.cancelled() => return,
        }
    }
}

async fn serve(
    socket: Socket,
    registry: &ExecutionRegistry,
    outbound: &mut mpsc::Receiver<ClientMessage>,
    cancel: &CancellationToken,
) -> Ended {
    let (mut sink, mut source) = socket.split();
    let mut sent = HashSet::new();
    let ended = loop {
        tokio::select! {
            request = outbound.recv() => {
                let Some(request) = request else {
                    break Ended::Shutdown;
                };
                let ClientMessage::Execute { id, .. } = &request;
                let id = id.clone();
                let payload = match serde_json::to_string(&request) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(error = %err, "failed to serialize request");
                        continue;
                    }
                };
                if let Err(err) = sink.send(Message::Text(payload)).await {
                    warn!(event = "connection.send_failed", error = %err);
                    sent.insert(id);
                    break Ended::Disconnected;
                }
                sent.insert(id);
            }
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_frame(registry, &text),
                Some(Ok(Message::Close(_))) | None => break Ended::Disconnected,
                Some(Ok(Message::Binary(_)))
                | Some(Ok(Message::Ping(_)))
                | Some(Ok(Message::Pong(_)))
                | Some(Ok(Message::Frame(_))) => {}
                Some(Err(err)) => {
                    warn!(event = "connection.read_failed", error = %err);
                    break Ended::Disconnected;
                }
            },
            _ = cancel.cancelled() => break Ended::Shutdown,
        }
    };
    registry.abandon(&sent);
    let _ = sink.close().await;
    ended
}

fn handle_frame(registry: &ExecutionRegistry, text: &str) {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(message) => registry.dispatch(message),
        Err(err) => warn!(event = "connection.bad_frame", error = %err, "ignoring server frame"),
    }
}
