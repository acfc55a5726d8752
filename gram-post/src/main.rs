//! gram-post - Publish one image, carousel or reel and wait for the result

use std::io::{IsTerminal, Read};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use libgramcast::logging::{LogFormat, LoggingConfig};
use libgramcast::{
    Config, ContentType, Event, GramcastError, GramcastService, Job, JobStatus, MediaRef, SubmitOptions,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

#[derive(Parser, Debug)]
#[command(name = "gram-post")]
#[command(version)]
#[command(about = "Publish an image, carousel or reel and wait for the result")]
#[command(long_about = "\
gram-post - Publish an image, carousel or reel and wait for the result

DESCRIPTION:
    gram-post submits one publish job, waits until it reaches a terminal
    status and prints the outcome. One media reference publishes an image
    (or a reel when it is a video), several publish a carousel.

    Media references are public URLs or local files. Local files are
    exposed under publishing.media_base_url when it is configured.

USAGE:
    # Publish a single image
    gram-post https://cdn.example.com/photo.jpg -c \"Sunset\"

    # Carousel with the caption read from stdin
    echo \"Weekend\" | gram-post a.jpg b.jpg c.jpg

    # Reel that stays off the main feed, JSON output
    gram-post clip.mp4 --no-share-to-feed --format json

CONFIGURATION:
    Configuration file: ~/.config/gramcast/config.toml
    Override with --config or GRAMCAST_CONFIG.
    Credentials: GRAMCAST_ACCOUNT_ID, GRAMCAST_ACCESS_TOKEN

EXIT CODES:
    0 - Published
    1 - Publish failed
    2 - Authentication, permission or configuration error
    3 - Invalid input or missing media
    4 - Rate limited (retry after the reported wait)
")]
struct Cli {
    /// Media URLs or local paths, in order
    #[arg(required = true, value_name = "MEDIA")]
    media: Vec<String>,

    /// Caption (read from stdin when omitted and stdin is piped)
    #[arg(short, long)]
    caption: Option<String>,

    /// Content type: image, carousel or reel (inferred when omitted)
    #[arg(long = "type", value_name = "TYPE")]
    content_type: Option<ContentType>,

    /// Keep a reel off the main feed
    #[arg(long)]
    no_share_to_feed: bool,

    /// Delete local media files after processing
    #[arg(long)]
    owns_media: bool,

    /// Configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Output format (text or json)
    #[arg(short, long, default_value = "text")]
    format: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

const EXIT_RATE_LIMITED: i32 = 4;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = std::env::var("GRAMCAST_LOG_LEVEL").unwrap_or_else(|_| "error".to_string());
    LoggingConfig::new(LogFormat::Text, level, cli.verbose).init();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
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

fn read_caption(cli: &Cli) -> libgramcast::Result<String> {
    if let Some(caption) = &cli.caption {
        return Ok(caption.clone());
    }
    let stdin = std::io::stdin();
    if stdin.is_terminal() {
        return Ok(String::new());
    }
    let mut caption = String::new();
    stdin.lock().read_to_string(&mut caption)?;
    Ok(caption.trim_end_matches(['\n', '\r']).to_string())
}

async fn run(cli: Cli) -> libgramcast::Result<i32> {
    if cli.format != "text" && cli.format != "json" {
        return Err(GramcastError::InvalidInput(format!(
            "Invalid format '{}'. Valid options: text, json",
            cli.format
        )));
    }

    let config = load_config(cli.config.as_ref())?;
    let caption = read_caption(&cli)?;
    let service = GramcastService::from_config(config)?;

    let mut events = service.subscribe();
    let options = SubmitOptions {
        content_type: cli.content_type,
        share_to_feed: Some(!cli.no_share_to_feed),
        owns_media: cli.owns_media,
    };
    let media = cli.media.iter().map(MediaRef::new).collect();
    let job_id = service.queue().submit(media, caption, options)?;
    debug!(job_id = %job_id, "Submitted");

    let interrupted = tokio::select! {
        _ = wait_for_job(&mut events, &service, &job_id) => false,
        _ = tokio::signal::ctrl_c() => true,
    };
    if interrupted {
        warn!("Interrupted, cancelling");
        service.abort().await;
    } else {
        service.shutdown().await;
    }

    let job = service.queue().get_status(&job_id)?;
    if let Err(e) = print_job(&job, &cli.format) {
        eprintln!("Error: {:#}", e);
    }
    Ok(exit_code_for(&job))
}

async fn wait_for_job(
    events: &mut tokio::sync::broadcast::Receiver<Event>,
    service: &GramcastService,
    job_id: &str,
) {
    loop {
        match events.recv().await {
            Ok(event) if event.is_terminal() && event.job_id() == job_id => return,
            Ok(_) => {}
            Err(RecvError::Lagged(missed)) => {
                debug!(missed, "Event stream lagged, checking status directly");
                let done = service
                    .queue()
                    .get_status(job_id)
                    .map(|job| job.status.is_terminal())
                    .unwrap_or(true);
                if done {
                    return;
                }
            }
            Err(RecvError::Closed) => return,
        }
    }
}

fn exit_code_for(job: &Job) -> i32 {
    match job.status {
        JobStatus::Completed => 0,
        JobStatus::RateLimited => EXIT_RATE_LIMITED,
        _ => match job.error.as_ref().map(|e| e.kind.as_str()) {
            Some("authentication") | Some("permission") => 2,
            _ => 1,
        },
    }
}

fn print_job(job: &Job, format: &str) -> anyhow::Result<()> {
    if format == "json" {
        let output = serde_json::to_string_pretty(job).context("Failed to serialize job")?;
        println!("{}", output);
        return Ok(());
    }

    match (&job.result, &job.error) {
        (Some(result), _) => match &result.permalink {
            Some(permalink) => println!("{} {}", result.id, permalink),
            None => println!("{}", result.id),
        },
        (None, Some(error)) => {
            let mut line = format!("{} ({}): {}", job.status, error.kind, error.message);
            if let Some(secs) = error.retry_after {
                line.push_str(&format!(" [retry after {}s]", secs));
            }
            eprintln!("{}", line);
        }
        (None, None) => eprintln!("job {} is {}", job.id, job.status),
    }
    Ok(())
}
