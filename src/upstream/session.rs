//! Supervised upstream session loop.
//!
//! One task per configured connection. The loop reconciles toward the
//! desired state: dial when it should be connected, back off on failure
//! (exponential, capped), and go quiet when an administrative disconnect
//! flips the flag. A live session runs reader and writer concurrently with
//! a keep-alive ping; a stalled peer is force-closed.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::config::model::Connection;
use crate::onebot;

use super::{LinkRegistry, LinkStatus, UpstreamFrame};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Keep-alive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Force-close when nothing (data or pong) arrives for this long.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);
/// Back-off ceiling between redial attempts.
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Network writes must complete within this deadline.
const WRITE_DEADLINE: Duration = Duration::from_secs(5);
/// Queued outbound frames survive a reconnect for this long.
const QUEUE_GRACE: Duration = Duration::from_secs(30);

/// Why a live session ended.
enum SessionEnd {
    /// Peer closed or the stream ended.
    Closed,
    /// Administrative disconnect or process shutdown.
    Requested,
    /// Read/write/keep-alive failure.
    Failed(String),
}

pub(super) async fn run_link(
    config: Connection,
    registry: Arc<LinkRegistry>,
    inbound_tx: mpsc::Sender<UpstreamFrame>,
    mut outbound_rx: mpsc::Receiver<String>,
    mut desired: watch::Receiver<bool>,
    mut shutdown: watch::Receiver<bool>,
) {
    let base_backoff = Duration::from_secs(config.reconnect_interval_s.max(1));
    let mut backoff = base_backoff;
    let mut disconnected_since = Instant::now();

    loop {
        if *shutdown.borrow() {
            break;
        }

        if !*desired.borrow() {
            registry.update_status(&config.id, LinkStatus::Disconnected);
            if !wait_for_change(
                &mut desired,
                &mut shutdown,
                &mut outbound_rx,
                disconnected_since,
            )
            .await
            {
                break;
            }
            continue;
        }

        registry.update_status(&config.id, LinkStatus::Dialing);
        match dial(&config).await {
            Ok(stream) => {
                backoff = base_backoff;
                registry.update_status(&config.id, LinkStatus::Connected);
                info!(target: "upstream", "connected: {} ({})", config.name, config.url);

                let end = run_session(
                    &config,
                    stream,
                    &inbound_tx,
                    &mut outbound_rx,
                    &mut desired,
                    &mut shutdown,
                )
                .await;
                disconnected_since = Instant::now();

                match end {
                    SessionEnd::Closed => {
                        registry.update_status(&config.id, LinkStatus::Disconnected);
                        warn!(target: "upstream", "connection closed: {}", config.name);
                    }
                    SessionEnd::Requested => {
                        registry.update_status(&config.id, LinkStatus::Closing);
                        registry.update_status(&config.id, LinkStatus::Disconnected);
                        info!(target: "upstream", "disconnected: {}", config.name);
                        continue;
                    }
                    SessionEnd::Failed(reason) => {
                        registry.set_error(&config.id, reason);
                    }
                }
            }
            Err(e) => {
                registry.set_error(&config.id, format!("dial failed: {e}"));
                warn!(target: "upstream", "dial failed: {} - {e}", config.name);
            }
        }

        if *shutdown.borrow() {
            break;
        }

        if config.auto_reconnect && *desired.borrow() {
            debug!(
                target: "upstream",
                "redialing {} in {}s", config.name, backoff.as_secs()
            );
            if !sleep_or_change(
                backoff,
                &mut desired,
                &mut shutdown,
                &mut outbound_rx,
                disconnected_since,
            )
            .await
            {
                break;
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        } else {
            // One-shot links park here until the next administrative
            // connect (or teardown).
            registry.update_status(&config.id, LinkStatus::Disconnected);
            if !wait_for_change(
                &mut desired,
                &mut shutdown,
                &mut outbound_rx,
                disconnected_since,
            )
            .await
            {
                break;
            }
        }
    }

    registry.update_status(&config.id, LinkStatus::Disconnected);
    debug!(target: "upstream", "supervisor for {} exited", config.id);
}

/// Open the WebSocket with the OneBot client headers (and bearer token when
/// configured).
async fn dial(config: &Connection) -> Result<WsStream, String> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| format!("bad url: {e}"))?;

    let headers = request.headers_mut();
    headers.insert("User-Agent", HeaderValue::from_static("switchboard/0.1"));
    headers.insert("X-Self-ID", HeaderValue::from_static("0"));
    headers.insert("X-Client-Role", HeaderValue::from_static("Universal"));
    if let Some(token) = &config.token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| format!("bad token: {e}"))?;
        headers.insert("Authorization", value);
    }

    let (stream, _) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| e.to_string())?;
    Ok(stream)
}

async fn run_session(
    config: &Connection,
    stream: WsStream,
    inbound_tx: &mpsc::Sender<UpstreamFrame>,
    outbound_rx: &mut mpsc::Receiver<String>,
    desired: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (mut write, mut read) = stream.split();

    // Announce ourselves; OneBot apps ignore peers that skip the lifecycle
    // connect event.
    let hello = onebot::lifecycle_connect(0, unix_time()).to_string();
    if let Err(e) = write_with_deadline(&mut write, Message::Text(hello.into())).await {
        return SessionEnd::Failed(format!("lifecycle send failed: {e}"));
    }

    let mut ping_ticker = tokio::time::interval(PING_INTERVAL);
    ping_ticker.tick().await; // skip the immediate tick
    // Tokio clock, not std: the stall check must follow a paused test clock.
    let mut last_seen = tokio::time::Instant::now();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Requested;
                }
            }
            changed = desired.changed() => {
                if changed.is_err() || !*desired.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Requested;
                }
            }
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else {
                    // Pool handle dropped: the link is being torn down.
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Requested;
                };
                if let Err(e) = write_with_deadline(&mut write, Message::Text(frame.into())).await {
                    return SessionEnd::Failed(format!("write failed: {e}"));
                }
            }
            _ = ping_ticker.tick() => {
                if last_seen.elapsed() > PONG_TIMEOUT {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Failed("keep-alive timeout".to_string());
                }
                if let Err(e) = write_with_deadline(&mut write, Message::Ping(Vec::new().into())).await {
                    return SessionEnd::Failed(format!("ping failed: {e}"));
                }
            }
            msg = read.next() => {
                let msg = match msg {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => return SessionEnd::Failed(format!("read failed: {e}")),
                    None => return SessionEnd::Closed,
                };
                last_seen = tokio::time::Instant::now();
                match msg {
                    Message::Text(text) => {
                        let frame = UpstreamFrame {
                            conn_id: config.id.clone(),
                            text: text.as_str().to_string(),
                        };
                        if inbound_tx.send(frame).await.is_err() {
                            return SessionEnd::Requested;
                        }
                    }
                    Message::Ping(payload) => {
                        if write_with_deadline(&mut write, Message::Pong(payload)).await.is_err() {
                            return SessionEnd::Failed("pong failed".to_string());
                        }
                    }
                    Message::Close(_) => return SessionEnd::Closed,
                    _ => {}
                }
            }
        }
    }
}

async fn write_with_deadline<S>(write: &mut S, msg: Message) -> Result<(), String>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    match tokio::time::timeout(WRITE_DEADLINE, write.send(msg)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("write deadline exceeded".to_string()),
    }
}

/// Park until the desired state or shutdown changes. Returns `false` when
/// the supervisor should exit. Queued frames are dropped once the link has
/// been down past the grace period.
async fn wait_for_change(
    desired: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
    outbound_rx: &mut mpsc::Receiver<String>,
    disconnected_since: Instant,
) -> bool {
    loop {
        let grace_left = QUEUE_GRACE.saturating_sub(disconnected_since.elapsed());
        tokio::select! {
            changed = desired.changed() => return changed.is_ok(),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return false;
                }
            }
            _ = tokio::time::sleep(grace_left), if grace_left > Duration::ZERO => {
                drain_queue(outbound_rx);
            }
            frame = outbound_rx.recv(), if grace_left == Duration::ZERO => {
                if frame.is_some() {
                    warn!(target: "upstream", "dropping queued frame for a long-disconnected link");
                } else {
                    return false;
                }
            }
        }
    }
}

/// Sleep out a back-off interval, reacting early to state changes. Returns
/// `false` when the supervisor should exit.
async fn sleep_or_change(
    duration: Duration,
    desired: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
    outbound_rx: &mut mpsc::Receiver<String>,
    disconnected_since: Instant,
) -> bool {
    let deadline = tokio::time::Instant::now() + duration;
    loop {
        let grace_left = QUEUE_GRACE.saturating_sub(disconnected_since.elapsed());
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return true,
            changed = desired.changed() => {
                if changed.is_err() {
                    return false;
                }
                // A fresh connect request cuts the back-off short.
                if *desired.borrow() {
                    return true;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return false;
                }
            }
            _ = tokio::time::sleep(grace_left), if grace_left > Duration::ZERO => {
                drain_queue(outbound_rx);
            }
        }
    }
}

fn drain_queue(outbound_rx: &mut mpsc::Receiver<String>) {
    let mut dropped = 0usize;
    while outbound_rx.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        warn!(target: "upstream", "reconnect grace expired, dropped {dropped} queued frames");
    }
}

fn unix_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
