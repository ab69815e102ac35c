use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Local;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use switchboard::cli::{self, Cli, Command, ConfigCommand};
use switchboard::config::{self, ConfigSnapshot};
use switchboard::dispatch::Dispatcher;
use switchboard::logging::{self, LogConfig};
use switchboard::router::{self, Decision, Outcome};
use switchboard::server;
use switchboard::style::{StatusSummary, StyleManager};
use switchboard::users::file::FileRepository;
use switchboard::users::{MemoryRepository, Repository, UserRecord, UserStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        // No subcommand or explicit `start` both launch the dispatcher.
        None | Some(Command::Start) => run_server().await,

        Some(Command::Config(sub)) => {
            match sub {
                ConfigCommand::Show => cli::handle_config_show()?,
                ConfigCommand::Path => cli::handle_config_path(),
            }
            Ok(())
        }

        Some(Command::Resolve { text, user, group }) => run_resolve(&text, user, group).await,

        Some(Command::Version) => {
            cli::handle_version();
            Ok(())
        }
    }
}

async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::load_validated()?;
    logging::init_logging(LogConfig::from_settings(
        &config.logging.level,
        config.logging.file.as_deref(),
    ))?;
    info!("switchboard {} starting", env!("CARGO_PKG_VERSION"));

    let state_dir = config::state_dir();
    let repo: Arc<dyn Repository> = match FileRepository::open(&state_dir) {
        Ok(repo) => Arc::new(repo),
        Err(e) => {
            warn!("state dir {} unusable ({e}), user records will not persist", state_dir.display());
            Arc::new(MemoryRepository::new())
        }
    };

    let bind: SocketAddr = format!("{}:{}", config.server.host, config.server.ws_port).parse()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher = Dispatcher::new(config, repo, shutdown_rx.clone());
    dispatcher.start();

    let handle = server::run_server(bind, dispatcher.clone(), shutdown_rx.clone()).await?;

    #[cfg(unix)]
    spawn_sighup_handler(dispatcher.clone(), shutdown_rx.clone());

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    dispatcher.close_all();
    handle.join().await;
    Ok(())
}

/// SIGHUP triggers a config reload; a bad file keeps the running snapshot.
#[cfg(unix)]
fn spawn_sighup_handler(dispatcher: Arc<Dispatcher>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGHUP handler: {e}");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = sighup.recv() => {
                    info!("SIGHUP received, reloading config");
                    match config::load_config() {
                        Ok(new) => {
                            if let Err(e) = dispatcher.reload_config(new) {
                                error!("config reload failed: {e}");
                            }
                        }
                        Err(e) => error!("config reload failed: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

/// Offline dry-run: resolve a message against the configured routing rules,
/// assuming every configured connection is reachable.
async fn run_resolve(
    text: &str,
    user_id: i64,
    group_id: Option<i64>,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = config::load_validated()?;
    let links: HashSet<String> = config.connections.iter().map(|c| c.id.clone()).collect();
    let snap = ConfigSnapshot::build(config);

    let state_dir = config::state_dir();
    let repo: Arc<dyn Repository> = match FileRepository::open(&state_dir) {
        Ok(repo) => Arc::new(repo),
        Err(_) => Arc::new(MemoryRepository::new()),
    };
    let store = Arc::new(UserStore::new(repo));
    let user = store
        .peek(user_id)
        .await?
        .unwrap_or_else(|| UserRecord::transient(user_id));

    let event = switchboard::onebot::MessageEvent::synthetic(text, user_id, group_id);
    let outcome = router::resolve(&snap, &links, &event, &user, Local::now().time());

    let decision = match outcome {
        Outcome::Decided(decision) => decision,
        Outcome::Meta(meta) => {
            let style = StyleManager::new(store);
            Decision::Reply {
                text: style
                    .handle_dry_run(&meta, &snap, &user, StatusSummary::default())
                    .await,
            }
        }
    };

    match decision {
        Decision::Forward {
            connection_id,
            payload,
        } => println!("forward -> {connection_id}\n{payload}"),
        Decision::Reply { text } => println!("reply: {text}"),
        Decision::Drop => println!("drop"),
    }
    Ok(())
}
