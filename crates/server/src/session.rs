use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use protocol::{ClientMessage, ServerMessage};

use crate::app::AppState;
use crate::identity::client_ip;
use crate::probe::{ProbeExecutor, ProbeHandle};
use crate::rate_limit::RateLimiter;

const OUTBOUND_QUEUE: usize = 256;

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let client = client_ip(&headers, peer, state.trust_proxy_headers);
    ws.on_upgrade(move |socket| handle_session(socket, client, state))
}

async fn handle_session(socket: WebSocket, client: IpAddr, state: AppState) {
    let session_id = Uuid::new_v4();
    info!(event = "session.opened", session = %session_id, client = %client);

    let (mut sink, mut stream) = socket.split();
    let (outbound, mut outbound_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE);
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let payload = match serde_json::to_string(&message) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "failed to serialize server message");
                    continue;
                }
            };
            if sink.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let session = Session::new(client, &state, outbound);
    loop {
        let msg = tokio::select! {
            msg = stream.next() => msg,
            _ = session.cancel.cancelled() => break,
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                if let Err(err) = session.handle_text(&text).await {
                    warn!(
                        event = "session.bad_message",
                        session = %session_id,
                        error = %err,
                    );
                    break;
                }
            }
            Some(Ok(Message::Binary(_))) => {
                warn!(event = "session.bad_message", session = %session_id, "binary frame");
                break;
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(err)) => {
                debug!(event = "session.read_error", session = %session_id, error = %err);
                break;
            }
        }
    }

    // In-flight probes belong to this connection and die with it.
    session.cancel.cancel();
    drop(session);
    let _ = writer.await;
    info!(event = "session.closed", session = %session_id, client = %client);
}

/// Per-connection request dispatch. Each admitted request runs as its own
/// task so several probes can stream at once on one connection.
struct Session {
    client: IpAddr,
    executor: ProbeExecutor,
    limiter: RateLimiter,
    probe_timeout: Duration,
    notify_rate_limited: bool,
    outbound: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
}

impl Session {
    fn new(client: IpAddr, state: &AppState, outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            client,
            executor: state.executor.clone(),
            limiter: state.limiter.clone(),
            probe_timeout: state.limits.probe_timeout,
            notify_rate_limited: state.notify_rate_limited,
            outbound,
            cancel: state.shutdown.child_token(),
        }
    }

    /// Fails only when the frame is not a valid client message, which ends
    /// the session.
    async fn handle_text(&self, text: &str) -> anyhow::Result<()> {
        let message: ClientMessage =
            serde_json::from_str(text).context("failed to decode client message")?;
        match message {
            ClientMessage::Execute { command, args, id } => self.dispatch(id, command, args).await,
        }
        Ok(())
    }

    async fn dispatch(&self, id: String, command: String, args: Vec<String>) {
        let Some(target) = args.into_iter().next() else {
            debug!(event = "session.empty_args", id = %id, command = %command);
            return;
        };
        if !self.limiter.admit(self.client) {
            info!(
                event = "rate.rejected",
                client = %self.client,
                id = %id,
                count = self.limiter.get(self.client),
            );
            if self.notify_rate_limited {
                let _ = self.outbound.send(ServerMessage::rate_limited(id)).await;
            }
            return;
        }
        tokio::spawn(run_execution(
            self.executor.clone(),
            id,
            command,
            target,
            self.probe_timeout,
            self.outbound.clone(),
            self.cancel.clone(),
        ));
    }
}

async fn run_execution(
    executor: ProbeExecutor,
    id: String,
    command: String,
    target: String,
    timeout: Duration,
    outbound: mpsc::Sender<ServerMessage>,
    cancel: CancellationToken,
) {
    let handle = match executor.execute(&command, &target) {
        Ok(handle) => handle,
        Err(err) => {
            info!(event = err.event(), id = %id, error = %err);
            let _ = outbound.send(ServerMessage::error(id)).await;
            return;
        }
    };
    stream_probe(&id, handle, timeout, &outbound, &cancel).await;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeEnd {
    Completed,
    TimedOut,
    Disconnected,
}

/// Forwards probe output as LINE messages until the process finishes, the
/// deadline passes or the connection goes away. EOF follows the first two.
async fn stream_probe(
    id: &str,
    mut handle: ProbeHandle,
    timeout: Duration,
    outbound: &mpsc::Sender<ServerMessage>,
    cancel: &CancellationToken,
) -> ProbeEnd {
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut lines = 0usize;

    let end = loop {
        tokio::select! {
            line = handle.next_line() => match line {
                Some(text) => {
                    lines += 1;
                    if outbound.send(ServerMessage::line(id, text)).await.is_err() {
                        break ProbeEnd::Disconnected;
                    }
                }
                None => break ProbeEnd::Completed,
            },
            _ = &mut deadline => break ProbeEnd::TimedOut,
            _ = cancel.cancelled() => break ProbeEnd::Disconnected,
        }
    };

    let status = match end {
        ProbeEnd::Completed => handle.finish().await,
        ProbeEnd::TimedOut | ProbeEnd::Disconnected => handle.kill().await,
    };
    if end != ProbeEnd::Disconnected {
        let _ = outbound.send(ServerMessage::eof(id)).await;
    }
    info!(
        event = "probe.finished",
        id = %id,
        outcome = ?end,
        lines,
        exit_code = ?status.and_then(|status| status.code()),
    );
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{Invocation, DEFAULT_LINE_BUFFER};
    use std::collections::HashSet;

    fn executor() -> ProbeExecutor {
        ProbeExecutor::new(DEFAULT_LINE_BUFFER)
    }

    fn shell(script: &str) -> Invocation {
        let mut invocation = executor().plan("ping", "8.8.8.8").expect("plan");
        invocation.program = "sh".to_string();
        invocation.args = vec!["-c".to_string(), script.to_string()];
        invocation
    }

    fn session(threshold: u32, notify: bool) -> (Session, mpsc::Receiver<ServerMessage>) {
        let (outbound, rx) = mpsc::channel(64);
        let session = Session {
            client: "203.0.113.7".parse().expect("ip"),
            executor: executor(),
            limiter: RateLimiter::new(Duration::from_secs(60), threshold),
            probe_timeout: Duration::from_secs(5),
            notify_rate_limited: notify,
            outbound,
            cancel: CancellationToken::new(),
        };
        (session, rx)
    }

    async fn recv(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("message in time")
            .expect("channel open")
    }

    #[cfg(unix)]
    #[test]
    fn streams_lines_then_eof() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let (tx, mut rx) = mpsc::channel(16);
            let handle = executor().launch(&shell("echo one; echo two")).expect("spawn");
            let end = stream_probe("r1", handle, Duration::from_secs(5), &tx, &CancellationToken::new()).await;
            assert_eq!(end, ProbeEnd::Completed);
            drop(tx);
            let mut messages = Vec::new();
            while let Some(message) = rx.recv().await {
                messages.push(message);
            }
            assert_eq!(
                messages,
                [
                    ServerMessage::line("r1", "one"),
                    ServerMessage::line("r1", "two"),
                    ServerMessage::eof("r1"),
                ]
            );
        });
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_probe_and_sends_eof() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let (tx, mut rx) = mpsc::channel(16);
            let handle = executor().launch(&shell("echo start; sleep 30")).expect("spawn");
            let end = stream_probe(
                "r2",
                handle,
                Duration::from_millis(300),
                &tx,
                &CancellationToken::new(),
            )
            .await;
            assert_eq!(end, ProbeEnd::TimedOut);
            assert_eq!(recv(&mut rx).await, ServerMessage::line("r2", "start"));
            assert_eq!(recv(&mut rx).await, ServerMessage::eof("r2"));
        });
    }

    #[cfg(unix)]
    #[test]
    fn cancellation_stops_without_eof() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let (tx, mut rx) = mpsc::channel(16);
            let cancel = CancellationToken::new();
            cancel.cancel();
            let handle = executor().launch(&shell("sleep 30")).expect("spawn");
            let end = stream_probe("r3", handle, Duration::from_secs(5), &tx, &cancel).await;
            assert_eq!(end, ProbeEnd::Disconnected);
            drop(tx);
            assert!(rx.recv().await.is_none());
        });
    }

    #[cfg(unix)]
    #[test]
    fn stderr_kill_ends_with_eof() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let (tx, mut rx) = mpsc::channel(16);
            let script = "echo partial; echo 'unknown host' >&2; sleep 30";
            let handle = executor().launch(&shell(script)).expect("spawn");
            let end = stream_probe("r4", handle, Duration::from_secs(10), &tx, &CancellationToken::new()).await;
            assert_eq!(end, ProbeEnd::Completed);
            drop(tx);
            let mut messages = Vec::new();
            while let Some(message) = rx.recv().await {
                messages.push(message);
            }
            assert_eq!(
                messages,
                [ServerMessage::line("r4", "partial"), ServerMessage::eof("r4")]
            );
        });
    }

    #[cfg(unix)]
    #[test]
    fn failing_exit_status_ends_with_eof() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let (tx, mut rx) = mpsc::channel(16);
            let handle = executor().launch(&shell("echo partial; exit 2")).expect("spawn");
            let end = stream_probe("r5", handle, Duration::from_secs(5), &tx, &CancellationToken::new()).await;
            assert_eq!(end, ProbeEnd::Completed);
            assert_eq!(recv(&mut rx).await, ServerMessage::line("r5", "partial"));
            assert_eq!(recv(&mut rx).await, ServerMessage::eof("r5"));
        });
    }

    #[test]
    fn rejected_target_reports_error() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let (session, mut rx) = session(5, false);
            session
                .handle_text(r#"{"type":"EXECUTE","command":"ping","args":["192.168.1.1"],"id":"bad"}"#)
                .await
                .expect("valid frame");
            assert_eq!(recv(&mut rx).await, ServerMessage::error("bad"));
        });
    }

    #[test]
    fn unknown_command_reports_error() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let (session, mut rx) = session(5, false);
            session
                .handle_text(r#"{"type":"EXECUTE","command":"nmap","args":["8.8.8.8"],"id":"x"}"#)
                .await
                .expect("valid frame");
            assert_eq!(recv(&mut rx).await, ServerMessage::error("x"));
        });
    }

    #[test]
    fn empty_args_are_ignored_without_admission() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let (session, mut rx) = session(5, true);
            session
                .handle_text(r#"{"type":"EXECUTE","command":"ping","args":[],"id":"e"}"#)
                .await
                .expect("valid frame");
            session
                .handle_text(r#"{"type":"EXECUTE","command":"ping","id":"e2"}"#)
                .await
                .expect("valid frame");
            assert_eq!(session.limiter.get(session.client), 0);
            assert!(rx.try_recv().is_err());
        });
    }

    #[test]
    fn over_limit_requests_are_silently_dropped() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let (session, mut rx) = session(1, false);
            for id in ["a", "b"] {
                let frame = format!(
                    r#"{{"type":"EXECUTE","command":"ping","args":["10.0.0.1"],"id":"{id}"}}"#
                );
                session.handle_text(&frame).await.expect("valid frame");
            }
            assert_eq!(recv(&mut rx).await, ServerMessage::error("a"));
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(rx.try_recv().is_err());
        });
    }

    #[test]
    fn over_limit_requests_are_reported_when_enabled() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let (session, mut rx) = session(1, true);
            for id in ["a", "b"] {
                let frame = format!(
                    r#"{{"type":"EXECUTE","command":"ping","args":["10.0.0.1"],"id":"{id}"}}"#
                );
                session.handle_text(&frame).await.expect("valid frame");
            }
            let received: HashSet<ServerMessage> =
                [recv(&mut rx).await, recv(&mut rx).await].into_iter().collect();
            let expected: HashSet<ServerMessage> =
                [ServerMessage::error("a"), ServerMessage::rate_limited("b")]
                    .into_iter()
                    .collect();
            assert_eq!(received, expected);
        });
    }

    #[test]
    fn malformed_frames_end_the_session() {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(async {
            let (session, _rx) = session(5, false);
            assert!(session.handle_text("not json").await.is_err());
            assert!(session
                .handle_text(r#"{"type":"SUBSCRIBE","id":"x"}"#)
                .await
                .is_err());
        });
    }

    #[cfg(unix)]
    mod websocket {
        use super::*;
        use crate::app::build_router;
        use crate::config::Config;
        use std::collections::HashMap;
        use std::os::unix::fs::PermissionsExt;
        use std::path::{Path, PathBuf};
        use std::time::{Instant, SystemTime, UNIX_EPOCH};
        use tokio::net::TcpListener;
        use tokio_tungstenite::tungstenite::Message as Frame;

        const FAKE_PING: &str = r#"#!/bin/sh
target="$3"
if [ "$target" = "9.9.9.9" ]; then
  echo $$ > "$(dirname "$0")/pid"
  echo waiting
  exec sleep 30
fi
echo "reply 1 from $target"
sleep 0.2
echo "reply 2 from $target"
"#;

        type Client = tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >;

        fn scratch_dir() -> PathBuf {
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos();
            let dir = std::env::temp_dir()
                .join(format!("looking-glass-session-{}-{nanos}", std::process::id()));
            std::fs::create_dir_all(&dir).expect("scratch dir");
            dir
        }

        fn install_fake_ping(dir: &Path) -> PathBuf {
            let path = dir.join("ping");
            std::fs::write(&path, FAKE_PING).expect("write script");
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                .expect("chmod");
            path
        }

        async fn send_execute(client: &mut Client, id: &str, target: &str) {
            let request = ClientMessage::Execute {
                command: "ping".to_string(),
                args: vec![target.to_string()],
                id: id.to_string(),
            };
            let payload = serde_json::to_string(&request).expect("json");
            client.send(Frame::Text(payload)).await.expect("send");
        }

        async fn next_message(client: &mut Client) -> ServerMessage {
            loop {
                let frame = tokio::time::timeout(Duration::from_secs(10), client.next())
                    .await
                    .expect("frame in time")
                    .expect("socket open")
                    .expect("frame");
                if let Frame::Text(text) = frame {
                    return serde_json::from_str(&text).expect("server message");
                }
            }
        }

        fn is_running(pid: &str) -> bool {
            std::process::Command::new("sh")
                .args(["-c", &format!("kill -0 {pid} 2>/dev/null")])
                .status()
                .map(|status| status.success())
                .unwrap_or(false)
        }

        #[test]
        fn concurrent_executions_stream_and_close_reaps_children() {
            let rt = tokio::runtime::Runtime::new().expect("runtime");
            rt.block_on(async {
                let dir = scratch_dir();
                let script = install_fake_ping(&dir);
                let raw = format!(
                    "[probes.programs]\nping = {:?}\n",
                    script.display().to_string()
                );
                let config = Config::parse(&raw).expect("config");
                let shutdown = CancellationToken::new();
                let state = AppState::from_config(&config, shutdown.clone()).expect("state");

                let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
                let addr = listener.local_addr().expect("addr");
                let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
                let stop = shutdown.clone();
                let server = tokio::spawn(async move {
                    axum::serve(listener, app)
                        .with_graceful_shutdown(async move { stop.cancelled().await })
                        .await
                });

                let (mut client, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
                    .await
                    .expect("connect");
                send_execute(&mut client, "a", "8.8.8.8").await;
                send_execute(&mut client, "b", "1.1.1.1").await;

                let mut by_id: HashMap<String, Vec<ServerMessage>> = HashMap::new();
                let mut finished = 0;
                while finished < 2 {
                    let message = next_message(&mut client).await;
                    if message.is_terminal() {
                        finished += 1;
                    }
                    by_id.entry(message.id().to_string()).or_default().push(message);
                }
                for (id, target) in [("a", "8.8.8.8"), ("b", "1.1.1.1")] {
                    assert_eq!(
                        by_id[id],
                        [
                            ServerMessage::line(id, format!("reply 1 from {target}")),
                            ServerMessage::line(id, format!("reply 2 from {target}")),
                            ServerMessage::eof(id),
                        ]
                    );
                }

                send_execute(&mut client, "c", "9.9.9.9").await;
                assert_eq!(next_message(&mut client).await, ServerMessage::line("c", "waiting"));
                let pid = std::fs::read_to_string(dir.join("pid")).expect("pid file");
                let pid = pid.trim().to_string();
                assert!(is_running(&pid));

                client.close(None).await.expect("close");
                let deadline = Instant::now() + Duration::from_secs(5);
                while is_running(&pid) && Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                assert!(!is_running(&pid), "child {pid} outlived its session");

                drop(client);
                shutdown.cancel();
                server.await.expect("server task").expect("serve");
                std::fs::remove_dir_all(&dir).ok();
            });
        }
    }
}
