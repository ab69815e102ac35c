//! Upstream link management.
//!
//! One supervised WebSocket client per configured backend connection. The
//! registry tracks per-link state for `/status` and the admin surface; the
//! pool owns the supervisor tasks and the send API.

mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::config::model::Connection;
use crate::router::LinkView;

/// Outbound queue depth per link.
const OUTBOUND_QUEUE: usize = 256;
/// How long a send may wait for queue space before failing.
const SEND_DEADLINE: Duration = Duration::from_secs(5);

/// Connection state of an upstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LinkStatus {
    /// Not connected and not trying.
    #[default]
    Disconnected,
    /// Dial in progress.
    Dialing,
    /// Session established and serving traffic.
    Connected,
    /// Closing down on request.
    Closing,
    /// Last attempt or session ended in an error.
    Errored,
}

impl std::fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Dialing => write!(f, "dialing"),
            Self::Connected => write!(f, "connected"),
            Self::Closing => write!(f, "closing"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// Information about a registered link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkInfo {
    pub id: String,
    pub name: String,
    pub status: LinkStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_changed_at: Option<i64>,
}

impl LinkInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: LinkStatus::Disconnected,
            last_error: None,
            last_connected_at: None,
            status_changed_at: None,
        }
    }
}

/// Thread-safe registry of upstream link states.
#[derive(Debug, Default)]
pub struct LinkRegistry {
    links: RwLock<HashMap<String, LinkInfo>>,
}

impl LinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, info: LinkInfo) {
        self.links.write().insert(info.id.clone(), info);
    }

    pub fn unregister(&self, link_id: &str) -> Option<LinkInfo> {
        self.links.write().remove(link_id)
    }

    pub fn get(&self, link_id: &str) -> Option<LinkInfo> {
        self.links.read().get(link_id).cloned()
    }

    pub fn get_status(&self, link_id: &str) -> Option<LinkStatus> {
        self.links.read().get(link_id).map(|info| info.status)
    }

    pub fn update_status(&self, link_id: &str, status: LinkStatus) -> bool {
        let mut links = self.links.write();
        if let Some(info) = links.get_mut(link_id) {
            info.status = status;
            info.status_changed_at = Some(now_millis());
            if status == LinkStatus::Connected {
                info.last_connected_at = Some(now_millis());
                info.last_error = None;
            }
            true
        } else {
            false
        }
    }

    pub fn set_error(&self, link_id: &str, error: impl Into<String>) -> bool {
        let mut links = self.links.write();
        if let Some(info) = links.get_mut(link_id) {
            info.status = LinkStatus::Errored;
            info.last_error = Some(error.into());
            info.status_changed_at = Some(now_millis());
            true
        } else {
            false
        }
    }

    pub fn list(&self) -> Vec<LinkInfo> {
        self.links.read().values().cloned().collect()
    }

    pub fn count_connected(&self) -> usize {
        self.links
            .read()
            .values()
            .filter(|info| info.status == LinkStatus::Connected)
            .count()
    }

    pub fn len(&self) -> usize {
        self.links.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.read().is_empty()
    }
}

impl LinkView for LinkRegistry {
    fn is_connected(&self, conn_id: &str) -> bool {
        self.get_status(conn_id) == Some(LinkStatus::Connected)
    }
}

/// A frame received from an upstream, tagged with its link id.
#[derive(Debug, Clone)]
pub struct UpstreamFrame {
    pub conn_id: String,
    pub text: String,
}

/// Send failures surfaced to callers of [`LinkPool::send`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("unknown connection {0}")]
    UnknownConnection(String),
    #[error("connection {0} unavailable")]
    Unavailable(String),
    #[error("send to {0} timed out (write backlog)")]
    Backlog(String),
}

struct LinkHandle {
    config: Connection,
    outbound_tx: mpsc::Sender<String>,
    desired_tx: watch::Sender<bool>,
    allow_forward: bool,
}

/// Owns one supervised session per configured connection.
pub struct LinkPool {
    registry: Arc<LinkRegistry>,
    inbound_tx: mpsc::Sender<UpstreamFrame>,
    shutdown: watch::Receiver<bool>,
    handles: Mutex<HashMap<String, LinkHandle>>,
}

impl LinkPool {
    pub fn new(
        registry: Arc<LinkRegistry>,
        inbound_tx: mpsc::Sender<UpstreamFrame>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            registry,
            inbound_tx,
            shutdown,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<LinkRegistry> {
        &self.registry
    }

    /// Register a connection and spawn its supervisor. The session starts
    /// dialing immediately when `auto_reconnect` is set; otherwise it waits
    /// for an administrative connect.
    pub fn open(&self, config: Connection) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (desired_tx, desired_rx) = watch::channel(config.auto_reconnect);

        self.registry
            .register(LinkInfo::new(config.id.clone(), config.name.clone()));

        tokio::spawn(session::run_link(
            config.clone(),
            self.registry.clone(),
            self.inbound_tx.clone(),
            outbound_rx,
            desired_rx,
            self.shutdown.clone(),
        ));

        let allow_forward = config.allow_forward;
        self.handles.lock().insert(
            config.id.clone(),
            LinkHandle {
                config,
                outbound_tx,
                desired_tx,
                allow_forward,
            },
        );
    }

    /// Tear a connection down and forget it. Dropping the desired-state
    /// sender ends the supervisor task.
    pub fn close(&self, conn_id: &str) {
        if let Some(handle) = self.handles.lock().remove(conn_id) {
            let _ = handle.desired_tx.send(false);
            drop(handle);
            info!(target: "upstream", "link {conn_id} torn down");
        }
        self.registry.unregister(conn_id);
    }

    /// Administrative connect: flip the desired state and let the
    /// supervisor reconcile. Also retriggers a dial on an errored
    /// non-auto-reconnect link.
    pub fn connect(&self, conn_id: &str) -> bool {
        match self.handles.lock().get(conn_id) {
            Some(handle) => handle.desired_tx.send(true).is_ok(),
            None => false,
        }
    }

    /// Administrative disconnect.
    pub fn disconnect(&self, conn_id: &str) -> bool {
        match self.handles.lock().get(conn_id) {
            Some(handle) => handle.desired_tx.send(false).is_ok(),
            None => false,
        }
    }

    /// Queue a frame for an upstream. Fails fast when the link's desired
    /// state is disconnected; otherwise waits for queue space up to the
    /// send deadline.
    pub async fn send(&self, conn_id: &str, frame: String) -> Result<(), SendError> {
        let (tx, desired) = {
            let handles = self.handles.lock();
            let handle = handles
                .get(conn_id)
                .ok_or_else(|| SendError::UnknownConnection(conn_id.to_string()))?;
            let pair = (handle.outbound_tx.clone(), *handle.desired_tx.borrow());
            pair
        };

        if !desired {
            return Err(SendError::Unavailable(conn_id.to_string()));
        }

        tokio::time::timeout(SEND_DEADLINE, tx.send(frame))
            .await
            .map_err(|_| SendError::Backlog(conn_id.to_string()))?
            .map_err(|_| SendError::Unavailable(conn_id.to_string()))
    }

    /// Ids of links that accept forwarded meta/other traffic.
    pub fn forward_targets(&self) -> Vec<String> {
        self.handles
            .lock()
            .iter()
            .filter(|(_, h)| h.allow_forward)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Absorb a config change that does not force a reconnect (name,
    /// reconnect interval, forward flag). The running session picks the
    /// interval up on its next dial.
    pub fn refresh(&self, config: Connection) {
        if let Some(handle) = self.handles.lock().get_mut(&config.id) {
            handle.allow_forward = config.allow_forward;
            handle.config = config;
        }
    }

    /// The config a link was opened with (reload diffing).
    pub fn link_config(&self, conn_id: &str) -> Option<Connection> {
        self.handles.lock().get(conn_id).map(|h| h.config.clone())
    }

    pub fn link_ids(&self) -> Vec<String> {
        self.handles.lock().keys().cloned().collect()
    }

    /// Tear everything down (shutdown path).
    pub fn close_all(&self) {
        let ids: Vec<String> = self.handles.lock().keys().cloned().collect();
        for id in ids {
            self.close(&id);
        }
    }
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_status_transitions() {
        let registry = LinkRegistry::new();
        registry.register(LinkInfo::new("c1", "backend"));

        assert_eq!(registry.get_status("c1"), Some(LinkStatus::Disconnected));
        assert!(!registry.is_connected("c1"));

        registry.update_status("c1", LinkStatus::Connected);
        assert!(registry.is_connected("c1"));
        let info = registry.get("c1").unwrap();
        assert!(info.last_connected_at.is_some());
        assert!(info.last_error.is_none());

        registry.set_error("c1", "dial failed");
        let info = registry.get("c1").unwrap();
        assert_eq!(info.status, LinkStatus::Errored);
        assert_eq!(info.last_error.as_deref(), Some("dial failed"));
        assert!(!registry.is_connected("c1"));
    }

    #[test]
    fn test_registry_counts() {
        let registry = LinkRegistry::new();
        registry.register(LinkInfo::new("a", "a"));
        registry.register(LinkInfo::new("b", "b"));
        registry.update_status("a", LinkStatus::Connected);

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.count_connected(), 1);

        registry.unregister("a");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.count_connected(), 0);
    }

    #[tokio::test]
    async fn test_pool_send_fails_fast_when_disconnected() {
        let registry = Arc::new(LinkRegistry::new());
        let (inbound_tx, _inbound_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = LinkPool::new(registry, inbound_tx, shutdown_rx);

        let err = pool.send("nope", "{}".into()).await.unwrap_err();
        assert_eq!(err, SendError::UnknownConnection("nope".into()));

        pool.open(Connection {
            id: "c1".into(),
            name: "backend".into(),
            url: "ws://127.0.0.1:1".into(),
            auto_reconnect: false,
            ..Default::default()
        });
        // Desired state starts disconnected for non-auto links.
        let err = pool.send("c1", "{}".into()).await.unwrap_err();
        assert_eq!(err, SendError::Unavailable("c1".into()));

        pool.close("c1");
        assert!(pool.link_ids().is_empty());
    }

    #[tokio::test]
    async fn test_pool_forward_targets() {
        let registry = Arc::new(LinkRegistry::new());
        let (inbound_tx, _inbound_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = LinkPool::new(registry, inbound_tx, shutdown_rx);

        pool.open(Connection {
            id: "c1".into(),
            url: "ws://127.0.0.1:1".into(),
            auto_reconnect: false,
            allow_forward: true,
            ..Default::default()
        });
        pool.open(Connection {
            id: "c2".into(),
            url: "ws://127.0.0.1:1".into(),
            auto_reconnect: false,
            ..Default::default()
        });

        assert_eq!(pool.forward_targets(), vec!["c1".to_string()]);
    }
}
