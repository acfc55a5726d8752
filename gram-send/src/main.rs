//! gram-send - Long-running publish queue driven by JSON-line commands
//!
//! Reads one command per line on stdin, answers one JSON object per line
//! on stdout and streams queue events on the same channel.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use libgramcast::logging::{LogFormat, LoggingConfig};
use libgramcast::{Config, ContentType, GramcastError, GramcastService, MediaRef, SubmitOptions};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "gram-send")]
#[command(version)]
#[command(about = "Long-running publish queue driven by JSON-line commands")]
#[command(long_about = "\
gram-send - Long-running publish queue driven by JSON-line commands

DESCRIPTION:
    gram-send keeps one publish queue alive and processes jobs one at a
    time. Commands arrive as JSON objects, one per line on stdin. Every
    command gets exactly one JSON reply on stdout; queue events are
    written to stdout as they happen.

COMMANDS:
    {\"cmd\":\"submit\",\"media\":[\"a.jpg\",\"b.jpg\"],\"caption\":\"Hi\"}
    {\"cmd\":\"status\",\"id\":\"<job id>\"}
    {\"cmd\":\"stats\"}
    {\"cmd\":\"history\",\"limit\":10}
    {\"cmd\":\"reset\",\"id\":\"<job id>\"}
    {\"cmd\":\"shutdown\"}

    submit also accepts content_type (image, carousel, reel),
    share_to_feed and owns_media.

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (drains queued jobs)

CONFIGURATION:
    Configuration file: ~/.config/gramcast/config.toml
    Override with --config or GRAMCAST_CONFIG.

    [queue]
    max_history = 100
    retention = \"24h\"
    shutdown_timeout = \"30s\"

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration error
")]
struct Cli {
    /// Configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log format for stderr (text, json, pretty)
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<LogFormat>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Command {
    Submit {
        media: Vec<String>,
        #[serde(default)]
        caption: String,
        #[serde(default)]
        content_type: Option<ContentType>,
        #[serde(default)]
        share_to_feed: Option<bool>,
        #[serde(default)]
        owns_media: bool,
    },
    Status {
        id: String,
    },
    Stats,
    History {
        #[serde(default = "default_history_limit")]
        limit: usize,
    },
    Reset {
        id: String,
    },
    Shutdown,
}

fn default_history_limit() -> usize {
    20
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    LoggingConfig::from_env(cli.log_format, cli.verbose).init();

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<GramcastError>().map(|e| e.exit_code()).unwrap_or(1)
        }
    };
    // A blocking stdin read may still be pending; exit without waiting on it
    std::process::exit(code);
}

fn load_config(path: Option<&PathBuf>) -> libgramcast::Result<Config> {
    match path {
        Some(path) => {
            let mut config = Config::load_from_path(path)?;
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
        None => Config::load(),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_ref())?;
    let service = GramcastService::from_config(config)?;
    info!("gram-send starting");

    let (out_tx, out_rx) = mpsc::unbounded_channel::<Value>();
    let writer = spawn_writer(out_rx);
    let forwarder = spawn_event_forwarder(&service, out_tx.clone());

    let stop = Arc::new(Notify::new());
    let signals = setup_signal_handlers(stop.clone())?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = stop.notified() => {
                info!("Shutdown requested, stopping command loop");
                break;
            }
            line = lines.next_line() => {
                let line = match line.context("Failed to read stdin")? {
                    Some(line) => line,
                    None => {
                        debug!("stdin closed");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let (reply, done) = handle_line(&service, &line);
                let _ = out_tx.send(reply);
                if done {
                    break;
                }
            }
        }
    }

    service.shutdown().await;
    info!(stats = ?service.queue().get_stats(), "gram-send stopped");

    // Dropping the service closes the event channel so the forwarder ends
    drop(service);
    if let Err(e) = forwarder.await {
        warn!("Event forwarder ended abnormally: {}", e);
    }
    drop(out_tx);
    if let Err(e) = writer.await {
        warn!("Output writer ended abnormally: {}", e);
    }
    if let Some(signals) = signals {
        signals.abort();
    }
    Ok(())
}

/// Parse and execute one command line; the flag asks the loop to stop
fn handle_line(service: &GramcastService, line: &str) -> (Value, bool) {
    let command: Command = match serde_json::from_str(line) {
        Ok(command) => command,
        Err(e) => {
            return (
                json!({"ok": false, "error": format!("Invalid command: {}", e), "exit_code": 3}),
                false,
            )
        }
    };

    let done = matches!(command, Command::Shutdown);
    let reply = match execute(service, command) {
        Ok(value) => value,
        Err(e) => json!({"ok": false, "error": e.to_string(), "exit_code": e.exit_code()}),
    };
    (reply, done)
}

fn execute(service: &GramcastService, command: Command) -> libgramcast::Result<Value> {
    let queue = service.queue();
    let reply = match command {
        Command::Submit {
            media,
            caption,
            content_type,
            share_to_feed,
            owns_media,
        } => {
            let options = SubmitOptions {
                content_type,
                share_to_feed,
                owns_media,
            };
            let media = media.into_iter().map(MediaRef::new).collect();
            let id = queue.submit(media, caption, options)?;
            json!({"ok": true, "id": id})
        }
        Command::Status { id } => json!({"ok": true, "job": to_value(queue.get_status(&id)?)}),
        Command::Stats => json!({"ok": true, "stats": to_value(queue.get_stats())}),
        Command::History { limit } => json!({"ok": true, "jobs": to_value(queue.get_history(limit))}),
        Command::Reset { id } => json!({"ok": true, "job": to_value(queue.reset_to_pending(&id)?)}),
        Command::Shutdown => json!({"ok": true}),
    };
    Ok(reply)
}

fn to_value<T: serde::Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Single owner of stdout so replies and events never interleave mid-line
fn spawn_writer(mut rx: mpsc::UnboundedReceiver<Value>) -> JoinHandle<()> {
    tokio::spawn(async move {
        use tokio::io::AsyncWriteExt;

        let mut stdout = tokio::io::stdout();
        while let Some(value) = rx.recv().await {
            let mut line = value.to_string();
            line.push('\n');
            if let Err(e) = stdout.write_all(line.as_bytes()).await {
                error!("Failed to write to stdout: {}", e);
                break;
            }
            let _ = stdout.flush().await;
        }
    })
}

fn spawn_event_forwarder(service: &GramcastService, out: mpsc::UnboundedSender<Value>) -> JoinHandle<()> {
    use tokio::sync::broadcast::error::RecvError;

    let mut events = service.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if out.send(json!({"event": to_value(event)})).is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Event stream lagged, some events were not forwarded");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(stop: Arc<Notify>) -> anyhow::Result<Option<JoinHandle<()>>> {
    use futures::StreamExt;
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook_tokio::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Signal setup failed")?;
    let handle = tokio::spawn(async move {
        if let Some(sig) = signals.next().await {
            info!(signal = sig, "Received shutdown signal, stopping gracefully...");
            stop.notify_one();
        }
    });
    Ok(Some(handle))
}

#[cfg(not(unix))]
fn setup_signal_handlers(stop: Arc<Notify>) -> anyhow::Result<Option<JoinHandle<()>>> {
    let handle = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully...");
            stop.notify_one();
        }
    });
    Ok(Some(handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_submit_defaults() {
        let command: Command = serde_json::from_str(r#"{"cmd":"submit","media":["a.jpg","b.jpg"]}"#).unwrap();
        match command {
            Command::Submit {
                media,
                caption,
                content_type,
                share_to_feed,
                owns_media,
            } => {
                assert_eq!(media, vec!["a.jpg", "b.jpg"]);
                assert!(caption.is_empty());
                assert!(content_type.is_none());
                assert!(share_to_feed.is_none());
                assert!(!owns_media);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_history_default_limit() {
        let command: Command = serde_json::from_str(r#"{"cmd":"history"}"#).unwrap();
        assert!(matches!(command, Command::History { limit: 20 }));
    }

    #[test]
    fn test_parse_content_type() {
        let command: Command =
            serde_json::from_str(r#"{"cmd":"submit","media":["a.jpg"],"content_type":"carousel"}"#).unwrap();
        assert!(matches!(
            command,
            Command::Submit {
                content_type: Some(ContentType::Carousel),
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_command_rejected() {
        assert!(serde_json::from_str::<Command>(r#"{"cmd":"explode"}"#).is_err());
    }
}
