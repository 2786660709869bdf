//! coalesce - queue payloads on disk and report them in batches.
//!
//! Every command works on the JSON record of one token under `--store-dir`,
//! so `push` from one invocation is drained by `run` or `flush` in another.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use coalesce_core::{
    Batch, BatchHandler, Collector, HandlerError, JsonFileStore, QueueRecord, Scheduler,
    SchedulerConfig,
};

/// Batching task scheduler.
#[derive(Parser)]
#[command(name = "coalesce")]
#[command(about = "Queue payloads and report them in batches")]
#[command(version)]
struct Cli {
    /// TOML config file (token, interval_ms, timeout_ms, retry_time_ms)
    #[arg(short, long, env = "COALESCE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Directory holding the queue records
    #[arg(long, env = "COALESCE_STORE_DIR", default_value = ".coalesce", global = true)]
    store_dir: PathBuf,

    /// Override the configured token
    #[arg(long, global = true)]
    token: Option<String>,

    /// Append reported batches to this file instead of stdout (JSON lines)
    #[arg(long, global = true)]
    out: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue payloads for the next batch
    Push {
        /// JSON values; anything that is not valid JSON is queued as a string
        #[arg(required = true)]
        payloads: Vec<String>,
    },

    /// Queue a form id stamped with createTime
    Form {
        form_id: String,

        /// Extra fields, as key=value
        #[arg(short, long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Keep empty and mock form ids
        #[arg(long)]
        lenient: bool,
    },

    /// Report payloads right away, queueing them if that fails
    Report {
        #[arg(required = true)]
        payloads: Vec<String>,
    },

    /// Print the queue record
    Show,

    /// Drop all pending tasks
    Clear {
        /// Clear even while a drain holds the lock
        #[arg(long)]
        force: bool,
    },

    /// Run one drain now (waits for the fire time, at most one interval)
    Flush,

    /// Run the scheduler loop until Ctrl-C
    Run {
        /// Stop after this many seconds
        #[arg(long)]
        for_secs: Option<u64>,
    },
}

/// Writes each batch as one JSON line.
struct SinkHandler {
    out: Option<PathBuf>,
}

#[async_trait]
impl BatchHandler for SinkHandler {
    fn name(&self) -> &str {
        "sink"
    }

    async fn handle(&self, batch: Batch) -> Result<(), HandlerError> {
        let mut line =
            serde_json::to_string(&*batch).map_err(|e| HandlerError::new(e.to_string()))?;
        line.push('\n');
        match &self.out {
            Some(path) => {
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(|e| HandlerError::new(format!("open {}: {e}", path.display())))?;
                file.write_all(line.as_bytes())
                    .await
                    .map_err(|e| HandlerError::new(e.to_string()))?;
            }
            None => {
                let mut stdout = tokio::io::stdout();
                stdout
                    .write_all(line.as_bytes())
                    .await
                    .map_err(|e| HandlerError::new(e.to_string()))?;
                stdout.flush().await.map_err(|e| HandlerError::new(e.to_string()))?;
            }
        }
        Ok(())
    }
}

/// `show` output.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RecordView<'a> {
    token: &'a str,
    now: i64,
    due_in_ms: Option<i64>,
    #[serde(flatten)]
    record: &'a QueueRecord,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .init();
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn parse_payload(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn load_config(cli: &Cli) -> Result<SchedulerConfig> {
    let mut config = match &cli.config {
        Some(path) => SchedulerConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => SchedulerConfig::default(),
    };
    if let Some(token) = &cli.token {
        config = config.with_token(token.clone());
        config.validate()?;
    }
    Ok(config)
}

fn build_scheduler(cli: &Cli) -> Result<Scheduler> {
    let config = load_config(cli)?;
    let store = JsonFileStore::open(&cli.store_dir)
        .with_context(|| format!("opening store {}", cli.store_dir.display()))?;
    let scheduler = Scheduler::builder()
        .config(config)
        .store(Arc::new(store))
        .handler(SinkHandler {
            out: cli.out.clone(),
        })?
        .build()?;
    Ok(scheduler)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let scheduler = build_scheduler(&cli)?;

    match cli.command {
        Commands::Push { payloads } => {
            for raw in &payloads {
                match scheduler.push(parse_payload(raw))? {
                    Some(id) => println!("{id}"),
                    None => warn!(payload = %raw, "skipped null payload"),
                }
            }
        }
        Commands::Form {
            form_id,
            params,
            lenient,
        } => {
            let mut collector = Collector::new(scheduler);
            if lenient {
                collector = collector.lenient();
            }
            let params: Map<String, Value> = params
                .into_iter()
                .map(|(k, v)| (k, parse_payload(&v)))
                .collect();
            match collector.push(&form_id, params)? {
                Some(id) => println!("{id}"),
                None => warn!(form_id = %form_id, "form id dropped"),
            }
        }
        Commands::Report { payloads } => {
            let payloads = payloads.iter().map(|raw| parse_payload(raw)).collect();
            let status = scheduler.report(payloads).await?;
            println!("{}", serde_json::to_string(&status)?);
        }
        Commands::Show => {
            let now = scheduler.now_millis();
            match scheduler.snapshot()? {
                Some(record) => {
                    let view = RecordView {
                        token: &scheduler.config().token,
                        now,
                        due_in_ms: (!record.is_empty())
                            .then(|| record.next_fire_at.saturating_sub(now).max(0)),
                        record: &record,
                    };
                    println!("{}", serde_json::to_string_pretty(&view)?);
                }
                None => info!(token = %scheduler.config().token, "no record yet"),
            }
        }
        Commands::Clear { force } => {
            if !scheduler.clear(force)? {
                anyhow::bail!("queue is locked by a running drain; retry with --force");
            }
        }
        Commands::Flush => {
            let outcome = scheduler
                .drain_once()
                .await
                .context("nothing was drained")?;
            eprintln!("{}", serde_json::to_string(&outcome)?);
        }
        Commands::Run { for_secs } => {
            let mut states = scheduler.subscribe_state();
            tokio::spawn(async move {
                while states.changed().await.is_ok() {
                    let state = *states.borrow_and_update();
                    debug!(?state, "scheduler state");
                }
            });
            scheduler.start();
            match for_secs {
                Some(secs) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                        _ = tokio::signal::ctrl_c() => {}
                    }
                }
                None => {
                    tokio::signal::ctrl_c()
                        .await
                        .context("waiting for Ctrl-C")?;
                }
            }
            info!("shutting down");
            scheduler.shutdown().await;
        }
    }

    Ok(())
}
