//! switchboard library
//!
//! Core of the OneBot v11 WebSocket command dispatcher: the frontend
//! WebSocket server, the upstream client pool, the command-resolution
//! router, and the glue that ties them together.

pub mod cli;
pub mod config;
pub mod correlate;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod onebot;
pub mod router;
pub mod server;
pub mod style;
pub mod upstream;
pub mod users;
