//! Frontend WebSocket server.
//!
//! Terminates inbound OneBot v11 connections from chat frontends. Each
//! session gets a reader (one frame in flight at a time — classification
//! happens before the next frame is read) and a writer task draining a
//! bounded channel; a backlogged writer closes the session rather than
//! buffering without bound.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Writer channel depth per session. Overflow closes the session.
const WRITE_QUEUE: usize = 256;
/// Network writes must complete within this deadline.
const WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Cloneable handle to a connected frontend session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: Arc<str>,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Queue a frame for this session. A full queue means the peer stopped
    /// reading; the session is closed instead of buffering further.
    pub fn send(&self, frame: String) -> Result<(), ()> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(target: "ws", session = %self.id, "internal error: write backlog, closing session");
                self.cancel.cancel();
                Err(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(()),
        }
    }

    /// Ask the session to close.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Receiver side of the frontend plane: the dispatcher implements this.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// A session finished its upgrade and can receive frames.
    async fn on_session_opened(&self, session: &SessionHandle);
    /// One inbound frame from a session. Called serially per session.
    async fn on_frame(&self, session: &SessionHandle, text: String);
    /// The session closed; outstanding correlation entries should be
    /// marked caller-gone.
    async fn on_session_closed(&self, session_id: &str);
}

#[derive(Clone)]
struct ServerState {
    sink: Arc<dyn FrameSink>,
}

/// Handle to the running frontend server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    server_task: JoinHandle<Result<(), std::io::Error>>,
}

impl ServerHandle {
    /// The port the server actually bound to (useful when binding to 0).
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Await the server task after shutdown has been signalled.
    pub async fn join(self) {
        match tokio::time::timeout(Duration::from_secs(5), self.server_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(target: "ws", "server task returned error: {e}"),
            Ok(Err(e)) => warn!(target: "ws", "server task panicked: {e}"),
            Err(_) => warn!(target: "ws", "server task did not finish within 5s"),
        }
    }
}

/// Bind the frontend listener and start serving sessions.
///
/// Binding to port 0 picks an ephemeral port; tests rely on that.
pub async fn run_server(
    bind: SocketAddr,
    sink: Arc<dyn FrameSink>,
    shutdown: watch::Receiver<bool>,
) -> Result<ServerHandle, std::io::Error> {
    let state = ServerState { sink };
    let app = Router::new()
        .route("/", get(ws_handler))
        .route("/onebot", get(ws_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    let local_addr = listener.local_addr()?;
    info!(target: "ws", "frontend server listening on ws://{local_addr}");

    let mut shutdown_watch = shutdown.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                loop {
                    if *shutdown_watch.borrow() {
                        break;
                    }
                    if shutdown_watch.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
    });

    Ok(ServerHandle {
        local_addr,
        server_task,
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ServerState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(WRITE_QUEUE);
    let cancel = CancellationToken::new();

    let session = SessionHandle {
        id: Uuid::new_v4().to_string().into(),
        tx,
        cancel: cancel.clone(),
    };
    info!(target: "ws", session = %session.id, "frontend connected");
    state.sink.on_session_opened(&session).await;

    let writer_cancel = cancel.clone();
    let send_task = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = writer_cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };
            let write =
                tokio::time::timeout(WRITE_DEADLINE, sender.send(Message::Text(frame.into())));
            match write.await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => break,
                Err(_) => {
                    warn!(target: "ws", "frontend write deadline exceeded");
                    writer_cancel.cancel();
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = receiver.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        debug!(target: "ws", session = %session.id, "read error: {e}");
                        break;
                    }
                    None => break,
                };
                match msg {
                    Message::Text(text) => {
                        // One frame in flight per reader: the next read only
                        // happens after the sink is done with this one.
                        state.sink.on_frame(&session, text.as_str().to_string()).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
        }
    }

    state.sink.on_session_closed(session.id()).await;
    info!(target: "ws", session = %session.id, "frontend disconnected");
    // Correlation entries may still hold sender clones; cancel so the
    // writer does not linger until they are swept.
    cancel.cancel();
    let _ = send_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    /// Sink that records frames and echoes them back uppercased.
    #[derive(Default)]
    struct EchoSink {
        frames: Mutex<Vec<String>>,
        closed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FrameSink for EchoSink {
        async fn on_session_opened(&self, _session: &SessionHandle) {}

        async fn on_frame(&self, session: &SessionHandle, text: String) {
            self.frames.lock().push(text.clone());
            let _ = session.send(text.to_uppercase());
        }

        async fn on_session_closed(&self, session_id: &str) {
            self.closed.lock().push(session_id.to_string());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_round_trip_through_session() {
        let sink = Arc::new(EchoSink::default());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = run_server(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            sink.clone(),
            shutdown_rx,
        )
        .await
        .unwrap();

        let url = format!("ws://127.0.0.1:{}/", handle.port());
        let (mut client, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        client.send(WsMessage::Text("hello".into())).await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply.to_text().unwrap(), "HELLO");
        assert_eq!(sink.frames.lock().as_slice(), ["hello".to_string()]);

        client.close(None).await.unwrap();
        // Give the server a moment to observe the close.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.closed.lock().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_server_binds_ephemeral_port() {
        let sink = Arc::new(EchoSink::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = run_server(SocketAddr::from(([127, 0, 0, 1], 0)), sink, shutdown_rx)
            .await
            .unwrap();
        assert_ne!(handle.port(), 0, "OS should assign a non-zero port");

        let _ = shutdown_tx.send(true);
        handle.join().await;
    }
}
