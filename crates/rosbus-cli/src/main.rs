//! `rosbus` – talk to a rosbridge endpoint from the shell.
//!
//! 1. Loads `~/.rosbus/config.toml` (plus `ROSBUS_*` overrides).
//! 2. Installs the tracing subscriber on stderr.
//! 3. Runs one command against a [`RosbridgeConnection`]:
//!    `echo` prints incoming messages as JSON lines until Ctrl-C,
//!    `pub` publishes a single message and tears the topic down.

mod cli;
mod config;
mod telemetry;

use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use rosbus_middleware::{Callback, Connection, RosbridgeConnection, Topic};
use rosbus_types::{ConnectionEvent, Message};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::cli::Command;
use crate::config::Config;

fn main() -> ExitCode {
    let command = match cli::parse(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            eprintln!("Run `{}` for usage.", "rosbus help".bold());
            return ExitCode::from(2);
        }
    };

    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            eprintln!("  Using default configuration.");
            let mut cfg = Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    let _guard = telemetry::init_tracing("rosbus", cfg.log_format);

    let result = match command {
        Command::Help => {
            print_help();
            Ok(())
        }
        Command::SetUrl(url) => set_url(cfg, url),
        Command::Echo { topic, message_type } => {
            block_on(echo(cfg.rosbridge_url, topic, message_type))
        }
        Command::Pub {
            topic,
            message_type,
            message,
        } => block_on(publish(cfg.rosbridge_url, topic, message_type, message)),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            ExitCode::FAILURE
        }
    }
}

fn block_on<F>(fut: F) -> Result<(), String>
where
    F: std::future::Future<Output = Result<(), String>>,
{
    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| format!("Failed to start Tokio runtime: {e}"))?;
    runtime.block_on(fut)
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

fn set_url(mut cfg: Config, url: String) -> Result<(), String> {
    cfg.rosbridge_url = url;
    config::save(&cfg)?;
    println!(
        "  {} rosbridge URL set to {} in {}",
        "✓".green().bold(),
        cfg.rosbridge_url.bold(),
        config::config_path().display()
    );
    Ok(())
}

async fn connect(url: &str) -> Result<(RosbridgeConnection, Arc<dyn Connection>), String> {
    let bridge = RosbridgeConnection::connect(url)
        .await
        .map_err(|e| e.to_string())?;
    info!(url = %url, "connected");
    let connection: Arc<dyn Connection> = Arc::new(bridge.clone());
    Ok((bridge, connection))
}

async fn echo(url: String, topic: String, message_type: String) -> Result<(), String> {
    let printer = Callback::new(|message: Message| {
        println!("{} {}", chrono::Utc::now().to_rfc3339().dimmed(), message);
    });
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| format!("Failed to listen for Ctrl-C: {e}"))
    };
    run_echo(&url, topic, message_type, printer, ctrl_c).await
}

/// Deliver messages to `callback` until `stop` resolves or the connection
/// goes away, then tear the subscription down.
async fn run_echo<S>(
    url: &str,
    topic: String,
    message_type: String,
    callback: Callback,
    stop: S,
) -> Result<(), String>
where
    S: std::future::Future<Output = Result<(), String>>,
{
    let (bridge, connection) = connect(url).await?;
    let mut events = bridge.events();
    let topic = Topic::new(connection, topic, message_type).map_err(|e| e.to_string())?;

    topic.subscribe(callback.clone()).await;
    if !topic.is_subscribed(&callback) {
        let name = topic.name().to_string();
        topic.close().await;
        bridge.close();
        return Err(format!("Could not subscribe to {name}"));
    }
    eprintln!(
        "  Listening on {} ({}). Press Ctrl-C to stop.",
        topic.name().bold(),
        topic.message_type().dimmed()
    );

    let outcome = tokio::select! {
        stopped = stop => stopped,
        reason = wait_for_close(&mut events) => Err(reason),
    };

    topic.close().await;
    bridge.close();
    outcome
}

/// Resolve with a description once the connection goes away.
async fn wait_for_close(events: &mut broadcast::Receiver<ConnectionEvent>) -> String {
    let mut last_error = None;
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::Error(e)) => {
                warn!(error = %e, "connection error");
                last_error = Some(e);
            }
            Ok(ConnectionEvent::Closed) | Err(broadcast::error::RecvError::Closed) => {
                return match last_error {
                    Some(e) => format!("Connection closed: {e}"),
                    None => "Connection closed by peer".to_string(),
                };
            }
            Ok(ConnectionEvent::Connected) | Err(broadcast::error::RecvError::Lagged(_)) => {}
        }
    }
}

async fn publish(
    url: String,
    topic: String,
    message_type: String,
    message: Message,
) -> Result<(), String> {
    let (bridge, connection) = connect(&url).await?;
    let topic = Topic::new(connection, topic, message_type).map_err(|e| e.to_string())?;

    topic.publish(message).await;
    let name = topic.name().to_string();
    topic.close().await;
    bridge.close();
    info!(topic = %name, "published");

    println!("  {} published to {}", "✓".green().bold(), name.bold());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Help
// ─────────────────────────────────────────────────────────────────────────────

fn print_help() {
    println!();
    println!("{} {}", "rosbus".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Publish and subscribe to rosbridge topics.");
    println!();
    println!("{}", "Commands".bold().underline());
    println!("  {}  – print messages until Ctrl-C", "echo <topic> <type>".bold().cyan());
    println!("  {}  – publish one JSON message", "pub <topic> <type> <json>".bold().cyan());
    println!("  {}  – save the rosbridge URL", "config url <ws-url>".bold().cyan());
    println!("  {}  – show this help", "help".bold().cyan());
    println!();
    println!(
        "  Config: {}  (override the URL with {})",
        config::config_path().display().to_string().dimmed(),
        "ROSBUS_URL".bold()
    );
    println!();
}
