use anyhow::Context;
use clap::{Parser, Subcommand};
use spewguard::{spew, Pipeline, Supervisor};
use spewguard_core::{Aggregator, Config, SourceId};
use spewguard_feeds::{HttpAggregator, StdinAttacher, WriterAggregator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "spewguard", about = "Supervise instances without letting their log volume kill them")]
struct Cli {
    /// Write debug logs to /tmp/spewguard-debug.log (tail -f to inspect).
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Supervise CMD and forward its output; with no CMD, forward stdin.
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        /// POST batches to this URL instead of printing JSON lines.
        #[arg(long)]
        aggregator: Option<String>,
        /// Source id attached to every forwarded frame.
        #[arg(long, default_value = "app")]
        source: String,
        #[arg(last = true)]
        command: Vec<String>,
    },
    /// Write BYTES random bytes to stdout, then report on stderr.
    Spew {
        bytes: u64,
        /// Stay alive this many milliseconds after writing.
        #[arg(long)]
        hold: Option<u64>,
    },
    /// Print the effective configuration.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_logging(debug: bool) -> anyhow::Result<()> {
    let filter = |default: &str| {
        tracing_subscriber::EnvFilter::try_from_env("RUST_LOG")
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default))
    };
    if debug {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open("/tmp/spewguard-debug.log")?;
        tracing_subscriber::fmt()
            .with_writer(std::sync::Mutex::new(file))
            .with_ansi(false)
            .with_env_filter(filter("debug"))
            .init();
        tracing::info!("spewguard debug log started, tail -f /tmp/spewguard-debug.log");
    } else {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(filter("info"))
            .init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug)?;

    match cli.command {
        Commands::Run {
            config,
            aggregator,
            source,
            command,
        } => {
            let mut config = Config::load(config.as_deref())?;
            if aggregator.is_some() {
                config.aggregator.endpoint = aggregator;
            }
            run(config, SourceId::new(source), command).await
        }
        Commands::Spew { bytes, hold } => {
            let mut stdout = tokio::io::stdout();
            let message = spew::spew(&mut stdout, bytes).await?;
            eprintln!("{message}");
            if let Some(ms) = hold {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            Ok(())
        }
        Commands::Config { config } => {
            let config = Config::load(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run(config: Config, source_id: SourceId, command: Vec<String>) -> anyhow::Result<()> {
    let aggregator: Arc<dyn Aggregator> = match &config.aggregator.endpoint {
        Some(url) => Arc::new(
            HttpAggregator::new(url, config.aggregator.timeout())
                .context("configuring aggregator")?,
        ),
        None => Arc::new(WriterAggregator::stdout()),
    };
    let pipeline = Arc::new(Pipeline::start(config.clone(), aggregator));

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, shutting down");
            }
            cancel.cancel();
        }
    });

    if command.is_empty() {
        pipeline
            .attach_source(source_id.clone(), StdinAttacher::new())
            .await;
        tokio::select! {
            exit = pipeline.join_reader(&source_id) => {
                tracing::info!(source_id = %source_id, ?exit, "stdin closed");
            }
            _ = cancel.cancelled() => {}
        }
    } else {
        let mut supervisor = Supervisor::new(
            pipeline.clone(),
            source_id,
            command,
            config.supervisor.clone(),
        );
        supervisor.start().await?;
        supervisor.run(cancel).await?;
    }

    match Arc::try_unwrap(pipeline) {
        Ok(pipeline) => pipeline.shutdown().await,
        Err(_) => tracing::warn!("pipeline still shared at exit, skipping drain"),
    }
    Ok(())
}
