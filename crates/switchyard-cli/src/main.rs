//! Switchyard command-line tool
//!
//! Loads a file catalog and drives the routing engine against it:
//! - `check` validates the catalog and prints the default channel ring
//! - `route` runs a group router for a number of attempts
//! - `pin` / `unpin` move the persisted scheduler pointer
//! - `metrics` routes silently and prints the Prometheus exposition
//! - `relay` pumps an SSE stream from stdin to stdout
//!
//! Usage:
//! ```bash
//! switchyard --config switchyard.yaml check
//! switchyard --config switchyard.yaml route --user 42 --attempts 4 --fail-status 502
//! SWITCHYARD_POINTER_STATE=./pointers.json switchyard pin 3
//! ```

mod config;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use config::ServerConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use switchyard_catalog_file::{FileCatalog, JsonPointerStore};
use switchyard_core::{
    AttemptResult, ChannelPointerRecord, ChannelType, Constraints, POINTER_RECORD_VERSION,
    PointerReason, route_key_hash,
};
use switchyard_observability::{Metrics, init_logging};
use switchyard_routing::{
    CachedUpstreamStore, GroupRouter, PointerPersistence, Scheduler, build_default_channel_ring,
};
use switchyard_stream::SsePump;

#[derive(Parser)]
#[command(name = "switchyard")]
#[command(about = "Switchyard - upstream channel scheduler for LLM gateways", long_about = None)]
struct Cli {
    /// Path to configuration file (YAML or TOML)
    #[arg(short, long, global = true, env = "SWITCHYARD_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the catalog and print its default channel ring
    Check,
    /// Run the group router and print each selection as JSON
    Route(RouteArgs),
    /// Pin the scheduler pointer to a channel
    Pin {
        channel_id: i64,
    },
    /// Clear the pinned scheduler pointer
    Unpin,
    /// Route silently, then print Prometheus metrics
    Metrics(RouteArgs),
    /// Relay an SSE stream from stdin to stdout
    Relay,
}

#[derive(clap::Args, Clone)]
struct RouteArgs {
    /// Caller user id
    #[arg(long)]
    user: i64,

    /// Session route key; hashed before use
    #[arg(long)]
    route_key: Option<String>,

    /// Restrict routing to channels tagged with one of these groups
    #[arg(long = "group")]
    groups: Vec<String>,

    /// Restrict routing to one channel type
    #[arg(long, value_parser = parse_channel_type)]
    channel_type: Option<ChannelType>,

    /// Number of attempts to run
    #[arg(long, default_value = "1")]
    attempts: u32,

    /// Report every attempt as a retriable failure with this HTTP status
    #[arg(long)]
    fail_status: Option<u16>,
}

fn parse_channel_type(value: &str) -> Result<ChannelType, String> {
    value.parse()
}

/// Catalog plus the routing engine built over it
struct Engine {
    config: ServerConfig,
    catalog: Arc<FileCatalog>,
    scheduler: Arc<Scheduler>,
    metrics: Arc<Metrics>,
    pointers: Option<Arc<PointerPersistence>>,
}

impl Engine {
    async fn build(config: ServerConfig) -> anyhow::Result<Self> {
        let catalog = Arc::new(
            FileCatalog::from_file(&config.catalog.path).with_context(|| {
                format!("Failed to load catalog {}", config.catalog.path.display())
            })?,
        );
        let metrics = Arc::new(Metrics::new().context("Failed to register metrics")?);

        let upstream = CachedUpstreamStore::wrap(
            catalog.clone(),
            Duration::from_secs(config.catalog.cache_ttl_secs),
        );
        let mut scheduler = Scheduler::new(upstream, config.scheduler.to_scheduler_config())
            .with_metrics(metrics.clone());

        let pointers = config.catalog.pointer_state.as_ref().map(|path| {
            debug!(path = ?path, "Using pointer state file");
            Arc::new(PointerPersistence::new(Arc::new(JsonPointerStore::new(path))))
        });
        if let Some(pointers) = &pointers {
            scheduler = scheduler.with_pointer_persistence(pointers.clone());
        }
        let scheduler = Arc::new(scheduler);

        let ring =
            build_default_channel_ring(catalog.as_ref(), &config.router.default_group_name).await?;
        scheduler.set_channel_ring(&ring);
        if scheduler.restore_pointer().await? {
            let pointer = scheduler.channel_pointer();
            info!(
                channel_id = pointer.channel_id,
                pinned = pointer.pinned,
                "Restored scheduler pointer"
            );
        }

        Ok(Self {
            config,
            catalog,
            scheduler,
            metrics,
            pointers,
        })
    }

    fn router(&self, args: &RouteArgs) -> GroupRouter {
        let mut cons = Constraints::default();
        if let Some(channel_type) = args.channel_type {
            cons = cons.with_channel_type(channel_type);
        }
        if !args.groups.is_empty() {
            cons = cons.with_allow_groups(args.groups.iter().cloned());
        }
        let hash = args.route_key.as_deref().map(route_key_hash).unwrap_or_default();

        GroupRouter::new(self.catalog.clone(), self.scheduler.clone(), args.user, hash, cons)
            .with_config(self.config.router.clone())
    }

    async fn route(&self, args: &RouteArgs, print: bool) -> anyhow::Result<usize> {
        let mut router = self.router(args);
        let mut selected = 0;

        for attempt in 1..=args.attempts {
            let sel = match router.next().await {
                Ok(sel) => sel,
                Err(e) if e.is_upstream_unavailable() => {
                    warn!(attempt, error = %e, "No upstream left for this request");
                    if print {
                        eprintln!("attempt {}: {}", attempt, e);
                    }
                    break;
                }
                Err(e) => return Err(e.into()),
            };
            selected += 1;
            if print {
                println!("{}", serde_json::to_string(&sel)?);
            }

            let result = match args.fail_status {
                Some(status) => AttemptResult::failure(true, Some(status), None),
                None => AttemptResult::success(),
            };
            self.scheduler.report(&sel, &result);
        }

        Ok(selected)
    }

    /// Write the current scheduler pointer straight to the state file
    async fn save_pointer(&self) -> anyhow::Result<()> {
        let Some(pointers) = &self.pointers else {
            bail!("catalog.pointer_state is not configured (set SWITCHYARD_POINTER_STATE)");
        };
        let pointer = self.scheduler.channel_pointer();
        let record = ChannelPointerRecord {
            v: POINTER_RECORD_VERSION,
            channel_id: pointer.channel_id,
            pinned: pointer.pinned,
            moved_at_unix_ms: pointer.moved_at.map_or(0, |at| at.timestamp_millis()),
            reason: pointer.reason.unwrap_or(PointerReason::Manual),
        };
        pointers.store().upsert_channel_pointer(&record).await?;
        Ok(())
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<ServerConfig> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    config.merge_env();
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Err(e) = config.validate() {
        bail!("Invalid configuration: {}", e);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    if let Commands::Relay = cli.command {
        return relay(&config).await;
    }

    let engine = Engine::build(config).await?;

    match cli.command {
        Commands::Check => {
            let summary = engine.catalog.summary();
            println!("channels:       {}", summary.channels);
            println!("endpoints:      {}", summary.endpoints);
            println!("credentials:    {}", summary.credentials);
            println!("codex accounts: {}", summary.codex_accounts);
            println!("groups:         {}", summary.groups);
            println!(
                "default ring:   {:?} (group {:?})",
                engine.scheduler.channel_ring(),
                engine.config.router.default_group_name
            );
            if let Some(pinned) = engine.scheduler.pinned_channel() {
                println!("pinned channel: {}", pinned);
            }
        }
        Commands::Route(args) => {
            engine.route(&args, true).await?;
        }
        Commands::Pin { channel_id } => {
            if !engine.catalog.channels().iter().any(|c| c.id == channel_id) {
                bail!("Channel {} is not in the catalog", channel_id);
            }
            engine.scheduler.pin_channel(channel_id);
            engine.save_pointer().await?;
            println!("pinned channel {}", channel_id);
        }
        Commands::Unpin => {
            engine.scheduler.clear_pinned_channel();
            engine.save_pointer().await?;
            println!("scheduler pointer cleared");
        }
        Commands::Metrics(args) => {
            engine.route(&args, false).await?;
            print!("{}", engine.metrics.gather_text()?);
        }
        Commands::Relay => {}
    }

    Ok(())
}

async fn relay(config: &ServerConfig) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let summary = SsePump::new(config.stream.to_pump_options())
        .with_cancel(cancel)
        .run(tokio::io::stdin(), tokio::io::stdout(), &mut ())
        .await?;
    info!(
        lines = summary.lines,
        events = summary.events,
        bytes = summary.bytes_written,
        "Relay finished"
    );
    Ok(())
}
