//! Dispatcher glue.
//!
//! Owns the upstream pool, the frontend plane, the router inputs and the
//! correlation table; executes routing decisions and carries frames in both
//! directions. Also the seam the external admin layer talks to: dry-run
//! resolve, connect/disconnect, reload, stats.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::model::{AppConfig, Connection};
use crate::config::{self, ConfigSnapshot};
use crate::correlate::{run_sweeper, CorrelationTable};
use crate::error::DispatchError;
use crate::onebot::{self, FrameClass, MessageEvent};
use crate::router::{self, Decision, Outcome, REPLY_TARGET_UNAVAILABLE};
use crate::server::{FrameSink, SessionHandle};
use crate::style::{StatusSummary, StyleManager};
use crate::upstream::{LinkPool, LinkRegistry, UpstreamFrame};
use crate::users::{Repository, UserRecord, UserStore};

/// Depth of the channel carrying frames from upstream sessions.
const INBOUND_QUEUE: usize = 1024;

/// Aggregate counters for the admin surface.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Stats {
    pub connections: ConnectionStats,
    pub messages: MessageStats,
    pub correlation: CorrelationStats,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConnectionStats {
    pub total: usize,
    pub connected: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct MessageStats {
    pub today: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CorrelationStats {
    pub in_flight: usize,
}

/// Message counter that resets at local midnight.
struct DailyCounter {
    state: Mutex<(NaiveDate, u64)>,
}

impl DailyCounter {
    fn new() -> Self {
        Self {
            state: Mutex::new((Local::now().date_naive(), 0)),
        }
    }

    fn increment(&self) {
        let today = Local::now().date_naive();
        let mut state = self.state.lock();
        if state.0 != today {
            *state = (today, 0);
        }
        state.1 += 1;
    }

    fn today(&self) -> u64 {
        let today = Local::now().date_naive();
        let state = self.state.lock();
        if state.0 == today {
            state.1
        } else {
            0
        }
    }
}

/// The glue layer. One per process, shared behind `Arc`.
pub struct Dispatcher {
    snapshot: RwLock<Arc<ConfigSnapshot>>,
    pool: LinkPool,
    registry: Arc<LinkRegistry>,
    store: Arc<UserStore>,
    style: StyleManager,
    correlation: Arc<CorrelationTable<SessionHandle>>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    messages: DailyCounter,
    inbound_rx: Mutex<Option<mpsc::Receiver<UpstreamFrame>>>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    /// Assemble the dispatcher around a validated config. Upstream links
    /// are not opened until [`start`](Self::start).
    pub fn new(
        config: AppConfig,
        repo: Arc<dyn Repository>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let registry = Arc::new(LinkRegistry::new());
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let pool = LinkPool::new(registry.clone(), inbound_tx, shutdown.clone());
        let store = Arc::new(UserStore::new(repo));
        let style = StyleManager::new(store.clone());

        Arc::new(Self {
            snapshot: RwLock::new(ConfigSnapshot::build(config)),
            pool,
            registry,
            store,
            style,
            correlation: Arc::new(CorrelationTable::new()),
            sessions: Mutex::new(HashMap::new()),
            messages: DailyCounter::new(),
            inbound_rx: Mutex::new(Some(inbound_rx)),
            shutdown,
        })
    }

    /// Open the configured upstream links and spawn the background tasks
    /// (upstream frame loop, correlation sweeper).
    pub fn start(self: &Arc<Self>) {
        let connections: Vec<Connection> = self.snapshot.read().connections().to_vec();
        for conn in connections {
            self.pool.open(conn);
        }

        tokio::spawn(run_sweeper(self.correlation.clone(), self.shutdown.clone()));

        let Some(mut inbound_rx) = self.inbound_rx.lock().take() else {
            warn!(target: "dispatch", "start() called twice, ignoring");
            return;
        };
        let dispatcher = self.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = inbound_rx.recv() => {
                        let Some(frame) = frame else { break };
                        dispatcher.handle_upstream_frame(frame).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(target: "dispatch", "upstream frame loop exited");
        });
    }

    /// Tear down the upstream pool (process shutdown).
    pub fn close_all(&self) {
        self.pool.close_all();
    }

    // ------------------------------------------------------------------
    // Admin surface
    // ------------------------------------------------------------------

    /// Dry-run resolution for the external admin layer. No user record is
    /// created and meta commands do not persist anything.
    pub async fn resolve(&self, text: &str, user_id: i64, group_id: Option<i64>) -> Decision {
        let snap = self.snapshot.read().clone();
        let event = MessageEvent::synthetic(text, user_id, group_id);
        let user = match self.store.peek(user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => UserRecord::transient(user_id),
            Err(e) => {
                warn!(target: "dispatch", "repository unavailable, degrading open: {e}");
                UserRecord::transient(user_id)
            }
        };

        match router::resolve(
            &snap,
            self.registry.as_ref(),
            &event,
            &user,
            Local::now().time(),
        ) {
            Outcome::Decided(decision) => decision,
            Outcome::Meta(meta) => Decision::Reply {
                text: self
                    .style
                    .handle_dry_run(&meta, &snap, &user, self.status_summary())
                    .await,
            },
        }
    }

    /// Administrative connect: reconcile the link toward connected.
    pub fn connect(&self, conn_id: &str) -> bool {
        self.pool.connect(conn_id)
    }

    /// Administrative disconnect.
    pub fn disconnect(&self, conn_id: &str) -> bool {
        self.pool.disconnect(conn_id)
    }

    /// Diff-apply a new config.
    ///
    /// Connection changes touch only the affected links; everything the
    /// router consumes swaps atomically as one snapshot. In-flight
    /// decisions finish against the snapshot they started with. A config
    /// that fails validation leaves the running state untouched.
    pub fn reload_config(&self, new: AppConfig) -> Result<(), DispatchError> {
        config::check(&new).map_err(|e| match e {
            config::ConfigError::ValidationError { path, message } => {
                DispatchError::ConfigInvalid {
                    path,
                    reason: message,
                }
            }
            other => DispatchError::ConfigInvalid {
                path: String::new(),
                reason: other.to_string(),
            },
        })?;

        let old: HashMap<String, Connection> = {
            let snap = self.snapshot.read();
            snap.connections()
                .iter()
                .map(|c| (c.id.clone(), c.clone()))
                .collect()
        };
        let new_ids: HashMap<&str, &Connection> =
            new.connections.iter().map(|c| (c.id.as_str(), c)).collect();

        for removed in old.keys().filter(|id| !new_ids.contains_key(id.as_str())) {
            info!(target: "dispatch", "reload: removing connection {removed}");
            self.pool.close(removed);
        }

        for conn in &new.connections {
            match old.get(&conn.id) {
                None => {
                    info!(target: "dispatch", "reload: adding connection {}", conn.id);
                    self.pool.open(conn.clone());
                }
                // An auto_reconnect flip must reopen too: the supervisor's
                // desired state is seeded from it, so a refresh() would
                // leave a parked link parked.
                Some(prev)
                    if prev.url != conn.url
                        || prev.token != conn.token
                        || prev.auto_reconnect != conn.auto_reconnect =>
                {
                    info!(target: "dispatch", "reload: reconnecting {} (connection settings changed)", conn.id);
                    self.pool.close(&conn.id);
                    self.pool.open(conn.clone());
                }
                Some(_) => self.pool.refresh(conn.clone()),
            }
        }

        *self.snapshot.write() = ConfigSnapshot::build(new);
        info!(target: "dispatch", "config reloaded");
        Ok(())
    }

    /// Counters for the admin surface and `/status`.
    pub fn snapshot_stats(&self) -> Stats {
        Stats {
            connections: ConnectionStats {
                total: self.registry.len(),
                connected: self.registry.count_connected(),
            },
            messages: MessageStats {
                today: self.messages.today(),
            },
            correlation: CorrelationStats {
                in_flight: self.correlation.in_flight(),
            },
        }
    }

    /// The current config snapshot (admin surface reads).
    pub fn config_snapshot(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.read().clone()
    }

    // ------------------------------------------------------------------
    // Frame handling
    // ------------------------------------------------------------------

    async fn handle_message_event(&self, session: &SessionHandle, frame: Value) {
        let event = match MessageEvent::from_value(frame) {
            Ok(event) => event,
            Err(reason) => {
                warn!(target: "ws", session = %session.id(), "frontend protocol error: {reason}");
                return;
            }
        };

        self.messages.increment();
        let snap = self.snapshot.read().clone();
        let user = match self.store.get_or_create(event.user_id, &event.nickname).await {
            Ok(user) => user,
            Err(e) => {
                // Reads degrade open; nothing will be written for this
                // decision.
                warn!(
                    target: "dispatch",
                    "{}, degrading open: {e}",
                    DispatchError::RepositoryUnavailable
                );
                UserRecord::transient(event.user_id)
            }
        };

        let decision = match router::resolve(
            &snap,
            self.registry.as_ref(),
            &event,
            &user,
            Local::now().time(),
        ) {
            Outcome::Decided(decision) => decision,
            Outcome::Meta(meta) => Decision::Reply {
                text: self
                    .style
                    .handle(&meta, &snap, &user, self.status_summary())
                    .await,
            },
        };

        match decision {
            Decision::Forward {
                connection_id,
                payload,
            } => {
                debug!(
                    target: "router",
                    user = event.user_id,
                    target_ws = %connection_id,
                    "forwarding message event"
                );
                if let Err(e) = self.pool.send(&connection_id, payload.to_string()).await {
                    let err = DispatchError::ConnectionUnavailable {
                        conn_id: connection_id.clone(),
                    };
                    warn!(target: "dispatch", "{err}: {e}");
                    self.reply(session, &event, REPLY_TARGET_UNAVAILABLE);
                }
            }
            Decision::Reply { text } => self.reply(session, &event, &text),
            Decision::Drop => {}
        }
    }

    fn reply(&self, session: &SessionHandle, event: &MessageEvent, text: &str) {
        let frame = onebot::reply_to(event, text);
        let _ = session.send(frame.to_string());
    }

    async fn handle_api_call(&self, session: &SessionHandle, mut frame: Value) {
        // Preserve the caller's echo, or mint one so the response can be
        // correlated back.
        let echo = onebot::echo_of(&frame).unwrap_or_else(|| Uuid::new_v4().to_string());
        onebot::set_echo(&mut frame, &echo);
        self.correlation.insert(&echo, session.id(), session.clone());

        let text = frame.to_string();
        for target in self.pool.forward_targets() {
            if let Err(e) = self.pool.send(&target, text.clone()).await {
                debug!(target: "dispatch", "api call not forwarded to {target}: {e}");
            }
        }
    }

    async fn forward_transparent(&self, frame_text: String) {
        for target in self.pool.forward_targets() {
            if let Err(e) = self.pool.send(&target, frame_text.clone()).await {
                debug!(target: "dispatch", "frame not forwarded to {target}: {e}");
            }
        }
    }

    async fn handle_upstream_frame(&self, frame: UpstreamFrame) {
        let value: Value = match serde_json::from_str(&frame.text) {
            Ok(value) => value,
            Err(e) => {
                let err = DispatchError::UpstreamProtocol {
                    conn_id: frame.conn_id.clone(),
                    reason: e.to_string(),
                };
                warn!(target: "upstream", "dropping frame: {err}");
                return;
            }
        };

        match onebot::classify(&value) {
            FrameClass::ApiResponse => {
                let Some(echo) = onebot::echo_of(&value) else {
                    debug!(target: "dispatch", "api response without echo, dropping");
                    return;
                };
                match self.correlation.complete(&echo) {
                    Some(session) => {
                        let _ = session.send(frame.text);
                    }
                    None => {
                        debug!(target: "dispatch", "no in-flight caller for echo {echo}, dropping");
                    }
                }
            }
            // Everything else from an upstream fans out to the connected
            // frontends unchanged (backends pushing API calls or events
            // toward the chat side).
            _ => self.broadcast_to_frontends(&frame.text),
        }
    }

    fn broadcast_to_frontends(&self, frame_text: &str) {
        let sessions: Vec<SessionHandle> = self.sessions.lock().values().cloned().collect();
        for session in sessions {
            let _ = session.send(frame_text.to_string());
        }
    }

    fn status_summary(&self) -> StatusSummary {
        StatusSummary {
            connections_connected: self.registry.count_connected(),
            connections_total: self.registry.len(),
            messages_today: self.messages.today(),
        }
    }
}

#[async_trait]
impl FrameSink for Dispatcher {
    async fn on_session_opened(&self, session: &SessionHandle) {
        self.sessions
            .lock()
            .insert(session.id().to_string(), session.clone());
    }

    async fn on_frame(&self, session: &SessionHandle, text: String) {
        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                let err = DispatchError::FrontendProtocol {
                    session: session.id().to_string(),
                    reason: e.to_string(),
                };
                warn!(target: "ws", "dropping frame: {err}");
                return;
            }
        };

        match onebot::classify(&value) {
            FrameClass::MessageEvent => self.handle_message_event(session, value).await,
            FrameClass::ApiCall => self.handle_api_call(session, value).await,
            FrameClass::MetaEvent | FrameClass::Other | FrameClass::ApiResponse => {
                self.forward_transparent(text).await;
            }
        }
    }

    async fn on_session_closed(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
        self.correlation.mark_session_gone(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{Command, CommandSet};
    use crate::users::MemoryRepository;

    fn test_config() -> AppConfig {
        AppConfig {
            connections: vec![Connection {
                id: "c1".into(),
                name: "backend".into(),
                url: "ws://127.0.0.1:1".into(),
                auto_reconnect: false,
                allow_forward: true,
                ..Default::default()
            }],
            command_sets: vec![CommandSet {
                id: "a".into(),
                name: "bota".into(),
                is_public: true,
                target_ws: Some("c1".into()),
                commands: vec![Command {
                    name: "/info".into(),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn dispatcher() -> Arc<Dispatcher> {
        let (_tx, rx) = watch::channel(false);
        Dispatcher::new(test_config(), Arc::new(MemoryRepository::new()), rx)
    }

    #[tokio::test]
    async fn test_dry_run_resolve_does_not_create_users() {
        let d = dispatcher();
        d.start();

        // Unmatched text falls to the default final rule.
        let decision = d.resolve("hello there", 100, None).await;
        assert_eq!(decision, Decision::reply("未知指令"));

        // The dry run never persisted a record.
        assert!(d.store.peek(100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dry_run_resolve_meta_is_replied() {
        let d = dispatcher();
        d.start();

        let decision = d.resolve("/help", 100, None).await;
        match decision {
            Decision::Reply { text } => assert!(text.contains("/style")),
            other => panic!("expected reply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resolve_target_down_replies_unavailable() {
        let d = dispatcher();
        d.start();

        // c1 is configured but not connected.
        let decision = d.resolve("/info", 100, None).await;
        assert_eq!(decision, Decision::reply(REPLY_TARGET_UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_reload_rejects_invalid_config() {
        let d = dispatcher();
        d.start();

        let mut bad = test_config();
        bad.command_sets[0].target_ws = Some("missing".into());
        let err = d.reload_config(bad).unwrap_err();
        assert!(matches!(err, DispatchError::ConfigInvalid { .. }));

        // Old snapshot still in force.
        assert!(d.config_snapshot().command_set("a").is_some());
    }

    #[tokio::test]
    async fn test_reload_diffs_connections() {
        let d = dispatcher();
        d.start();
        assert_eq!(d.pool.link_ids(), vec!["c1".to_string()]);

        let mut new = test_config();
        new.connections.push(Connection {
            id: "c2".into(),
            name: "second".into(),
            url: "ws://127.0.0.1:2".into(),
            auto_reconnect: false,
            ..Default::default()
        });
        d.reload_config(new).unwrap();

        let mut ids = d.pool.link_ids();
        ids.sort();
        assert_eq!(ids, vec!["c1".to_string(), "c2".to_string()]);

        // Dropping a connection tears its link down.
        let mut shrunk = test_config();
        shrunk.connections.clear();
        shrunk.command_sets[0].target_ws = None;
        d.reload_config(shrunk).unwrap();
        assert!(d.pool.link_ids().is_empty());
    }

    #[tokio::test]
    async fn test_reload_auto_reconnect_toggle_wakes_link() {
        let d = dispatcher();
        d.start();

        // Opened with auto_reconnect=false: desired state starts
        // disconnected and sends fail fast.
        assert!(d.pool.send("c1", "{}".into()).await.is_err());

        let mut new = test_config();
        new.connections[0].auto_reconnect = true;
        d.reload_config(new).unwrap();

        // The link was reopened with the new desired state: it is dialing
        // now, so frames queue instead of failing fast.
        assert!(d.pool.send("c1", "{}".into()).await.is_ok());

        // Flipping it back parks the link again.
        d.reload_config(test_config()).unwrap();
        assert!(d.pool.send("c1", "{}".into()).await.is_err());
    }

    #[tokio::test]
    async fn test_reload_swaps_router_snapshot_atomically() {
        let d = dispatcher();
        d.start();

        let before = d.config_snapshot();
        let mut new = test_config();
        new.command_sets[0].enabled = false;
        d.reload_config(new).unwrap();
        let after = d.config_snapshot();

        // The old snapshot is unchanged (in-flight decisions keep using it);
        // the new one reflects the reload.
        assert!(before.command_set("a").unwrap().enabled);
        assert!(!after.command_set("a").unwrap().enabled);
    }

    #[tokio::test]
    async fn test_stats_counters() {
        let d = dispatcher();
        d.start();

        let stats = d.snapshot_stats();
        assert_eq!(stats.connections.total, 1);
        assert_eq!(stats.connections.connected, 0);
        assert_eq!(stats.messages.today, 0);
        assert_eq!(stats.correlation.in_flight, 0);

        d.messages.increment();
        d.messages.increment();
        assert_eq!(d.snapshot_stats().messages.today, 2);
    }
}
