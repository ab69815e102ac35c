//! Dispatcher-level error kinds.
//!
//! Per-frame errors stay local to the frame, per-session errors close only
//! that session, and reload errors keep the previous config snapshot. Module
//! internals carry their own error enums (`config::ConfigError`,
//! `users::RepoError`, `upstream::SendError`) and convert into these kinds at
//! the glue layer.

use thiserror::Error;

/// Errors surfaced by the dispatch plane.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Configuration rejected at load or reload. Fatal at startup; at reload
    /// the previous snapshot is retained and the reason reported.
    #[error("invalid config at {path}: {reason}")]
    ConfigInvalid { path: String, reason: String },

    /// A forward could not proceed because the target upstream is not
    /// connected (or not configured). Recoverable; the dispatcher
    /// synthesizes a reply instead of forwarding.
    #[error("connection unavailable: {conn_id}")]
    ConnectionUnavailable { conn_id: String },

    /// Malformed frame received from an upstream. The frame is dropped and
    /// the session continues.
    #[error("upstream protocol error on {conn_id}: {reason}")]
    UpstreamProtocol { conn_id: String, reason: String },

    /// Malformed frame received from a frontend session. The frame is
    /// dropped and the session continues.
    #[error("frontend protocol error on session {session}: {reason}")]
    FrontendProtocol { session: String, reason: String },

    /// The user repository could not be reached. Reads degrade open with a
    /// transient empty record; writes fail loudly.
    #[error("repository unavailable")]
    RepositoryUnavailable,

    /// Unexpected internal failure. The affected session is closed and its
    /// supervisor restarts it.
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DispatchError::ConfigInvalid {
            path: ".command_sets[0].target_ws".into(),
            reason: "unknown connection id \"c9\"".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid config at .command_sets[0].target_ws: unknown connection id \"c9\""
        );

        let err = DispatchError::ConnectionUnavailable {
            conn_id: "c1".into(),
        };
        assert_eq!(err.to_string(), "connection unavailable: c1");
    }
}
