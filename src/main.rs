use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use haven_engine::executor::ToolExecutor;
use haven_engine::toolsource::{ToolSourceConfig, ToolSourceRegistry};
use haven_llm::{ClientRegistry, OpenAiClient, Purpose};
use haven_store::{ConfigRepo, Database, FrameStore, RuleLogRepo, RuleRepo};
use haven_telemetry::{init_telemetry, TelemetryConfig};
use haven_trigger::dynamic::DynamicExecutor;
use haven_trigger::{SchedulerConfig, SnapshotFrameSource, TriggerScheduler};

#[derive(Parser, Debug)]
#[command(name = "haven", about = "Home automation orchestration backend")]
struct Cli {
    /// Path to the SQLite database.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Root directory for persisted camera frames.
    #[arg(long)]
    media_root: Option<PathBuf>,

    /// Trigger scheduler tick interval in seconds.
    #[arg(long, default_value_t = 30)]
    tick_secs: u64,

    /// Emit JSON logs instead of human-readable text.
    #[arg(long)]
    log_json: bool,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_filter: String,
}

fn haven_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".haven")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let db_path = cli
        .db_path
        .clone()
        .unwrap_or_else(|| haven_dir().join("database/haven.db"));
    let media_root = cli
        .media_root
        .clone()
        .unwrap_or_else(|| haven_dir().join("media"));

    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: cli
            .log_filter
            .parse()
            .unwrap_or(tracing::Level::INFO),
        json_output: cli.log_json,
        log_db_path: db_path.with_file_name("logs.db"),
        ..Default::default()
    });

    info!(db = %db_path.display(), media = %media_root.display(), "haven starting");

    let db = Database::open(&db_path).context("open database")?;
    let rules = RuleRepo::new(db.clone());
    let rule_logs = RuleLogRepo::new(db.clone());
    let config = ConfigRepo::new(db.clone());
    let frames = Arc::new(FrameStore::new(media_root));

    let clients = Arc::new(build_clients(&config)?);

    let registry = Arc::new(ToolSourceRegistry::new());
    registry.init_all(load_tool_sources(&config)).await;

    let executor = Arc::new(ToolExecutor::new(registry.clone()));
    let dynamic = Arc::new(DynamicExecutor::new(
        clients.clone(),
        executor,
        rule_logs.clone(),
    ));

    let frame_source = Arc::new(
        SnapshotFrameSource::new(
            config
                .get("cameras.snapshot_url")?
                .unwrap_or_else(|| "http://127.0.0.1:8554/snapshot/{camera_id}/{channel}".into()),
        )
        .context("build frame source")?,
    );

    let scheduler = Arc::new(TriggerScheduler::new(
        SchedulerConfig {
            tick: Duration::from_secs(cli.tick_secs),
        },
        clients,
        frame_source,
        registry.clone(),
        dynamic,
        rule_logs,
        frames,
    ));
    scheduler.load_rules(rules.load_all().context("load rules")?);

    let cancel = CancellationToken::new();
    let scheduler_task = tokio::spawn({
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    });

    tokio::signal::ctrl_c().await.context("ctrl-c handler")?;
    info!("shutdown requested");

    cancel.cancel();
    let _ = scheduler_task.await;
    registry.shutdown().await;

    info!("haven stopped");
    Ok(())
}

/// Bind planning and vision clients from the config table. A missing endpoint
/// leaves the registry empty; dialog and trigger evaluation then surface
/// ConfigurationMissing per use instead of failing startup.
fn build_clients(config: &ConfigRepo) -> anyhow::Result<ClientRegistry> {
    let registry = ClientRegistry::new();

    let Some(endpoint) = config.get("llm.endpoint")? else {
        warn!("llm.endpoint not configured, no chat clients bound");
        return Ok(registry);
    };
    let api_key = config.get("llm.api_key")?.map(SecretString::from);
    let default_model = config.get("llm.model")?;

    for (purpose, key) in [
        (Purpose::Planning, "llm.planning_model"),
        (Purpose::Vision, "llm.vision_model"),
    ] {
        let model = config.get(key)?.or_else(|| default_model.clone());
        match model {
            Some(model) => {
                let client = OpenAiClient::new(endpoint.clone(), api_key.clone(), model)
                    .context("build chat client")?;
                registry.bind(purpose, Arc::new(client));
                info!(purpose = purpose.as_str(), "chat client bound");
            }
            None => warn!(purpose = purpose.as_str(), "no model configured"),
        }
    }

    Ok(registry)
}

/// Tool source definitions live in the config table as a JSON array.
fn load_tool_sources(config: &ConfigRepo) -> Vec<ToolSourceConfig> {
    let raw = match config.get("tool_sources") {
        Ok(Some(raw)) => raw,
        Ok(None) => return Vec::new(),
        Err(e) => {
            warn!(error = %e, "failed to read tool source config");
            return Vec::new();
        }
    };
    match serde_json::from_str(&raw) {
        Ok(configs) => configs,
        Err(e) => {
            warn!(error = %e, "malformed tool_sources config, ignoring");
            Vec::new()
        }
    }
}
