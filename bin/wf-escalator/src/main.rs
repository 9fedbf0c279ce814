//! Workflow Escalator
//!
//! Opens the configured workflow store and runs the escalation scheduler until
//! SIGINT/SIGTERM. Settings come from a TOML file, then `WF_*` overrides.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `WF_CONFIG` | `workflow.toml` | Configuration file (optional) |
//! | `WF_DEFINITIONS` | - | JSON array of process definitions registered at startup |
//! | `WF_DATABASE_KIND` | `memory` | `memory`, `sqlite`, `postgres`, `mongo` |
//! | `WF_DATABASE_URL` | - | Connection URL (required unless `memory`) |
//! | `WF_DATABASE_MAX_CONNECTIONS` | `10` | SQL pool size |
//! | `WF_MONGO_DATABASE` | `workflow` | MongoDB database name |
//! | `WF_ESCALATION_ENABLED` | `false` | Run the scheduler |
//! | `WF_ESCALATION_INTERVAL_SECS` | `300` | Seconds between sweeps |
//! | `WF_LOG_LEVEL` | `info` | Default log level |
//! | `WF_LOG_JSON` | `false` | JSON log output |
//! | `RUST_LOG` | - | Overrides log filtering |

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wf_config::{DatabaseConfig, DatabaseKind, LoggingConfig, WorkflowConfig};
use wf_engine::repository::mongo::{MongoDefinitionRepository, MongoInstanceRepository};
use wf_engine::repository::postgres::{PostgresDefinitionRepository, PostgresInstanceRepository};
use wf_engine::repository::sqlite::{SqliteDefinitionRepository, SqliteInstanceRepository};
use wf_engine::repository::{InMemoryDefinitionRepository, InMemoryInstanceRepository};
use wf_engine::{
    DefinitionRepository, EscalationScheduler, EscalationSchedulerConfig, InstanceRepository,
    ProcessDefinition, WorkflowServices,
};

/// Workflow escalation worker
#[derive(Parser, Debug)]
#[command(name = "wf-escalator")]
#[command(about = "Periodic SLA escalation for workflow instances")]
struct Args {
    /// Configuration file
    #[arg(long, env = "WF_CONFIG", default_value = "workflow.toml")]
    config: PathBuf,

    /// Process definitions (JSON array) to register before sweeping
    #[arg(long, env = "WF_DEFINITIONS")]
    definitions: Option<PathBuf>,

    /// Run a single sweep and exit
    #[arg(long, default_value = "false")]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = WorkflowConfig::load(Some(args.config.as_path()))
        .with_context(|| format!("loading {}", args.config.display()))?;

    init_logging(&config.logging);
    info!(
        backend = ?config.database.kind,
        targets = config.escalation.targets.len(),
        "Starting workflow escalator"
    );

    let (definitions, instances) = open_store(&config.database).await?;
    let services = WorkflowServices::new(definitions, instances, &config);

    if let Some(path) = &args.definitions {
        register_definitions(&services, path).await?;
    }

    let scheduler_config = EscalationSchedulerConfig::from_config(&config.escalation);

    if args.once {
        let result = wf_engine::scheduler::sweep(&services.escalation, &scheduler_config).await;
        info!(
            found = result.total_found,
            escalated = result.total_escalated,
            errors = result.errors.len(),
            "Single sweep complete"
        );
        return Ok(());
    }

    if !config.escalation.enabled {
        warn!("Escalation is disabled (escalation.enabled = false), nothing to do");
        return Ok(());
    }

    let scheduler = EscalationScheduler::start(services.escalation.clone(), scheduler_config);

    info!("Workflow escalator started");
    info!("Press Ctrl+C to shutdown");

    shutdown_signal().await;
    info!("Shutdown signal received...");

    if tokio::time::timeout(Duration::from_secs(30), scheduler.shutdown())
        .await
        .is_err()
    {
        warn!("Escalation sweep did not finish within 30s");
    }

    info!("Workflow escalator shutdown complete");
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let default_level = logging
        .level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    let filter = EnvFilter::from_default_env().add_directive(default_level.into());

    if logging.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn open_store(
    database: &DatabaseConfig,
) -> Result<(Arc<dyn DefinitionRepository>, Arc<dyn InstanceRepository>)> {
    let url = || {
        database
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("database.url is required for {:?}", database.kind))
    };

    match database.kind {
        DatabaseKind::Memory => {
            info!("Using in-memory workflow store");
            Ok((
                Arc::new(InMemoryDefinitionRepository::new()),
                Arc::new(InMemoryInstanceRepository::new()),
            ))
        }
        DatabaseKind::Sqlite => {
            let url = url()?;
            let pool = SqlitePoolOptions::new()
                .max_connections(sqlite_pool_size(&url, database.max_connections))
                .connect(&url)
                .await?;
            wf_engine::repository::sqlite::init_schema(&pool).await?;
            info!("Using SQLite workflow store: {}", url);
            Ok((
                Arc::new(SqliteDefinitionRepository::new(pool.clone())),
                Arc::new(SqliteInstanceRepository::new(pool)),
            ))
        }
        DatabaseKind::Postgres => {
            let pool = PgPoolOptions::new()
                .max_connections(database.max_connections)
                .connect(&url()?)
                .await?;
            wf_engine::repository::postgres::init_schema(&pool).await?;
            info!("Using PostgreSQL workflow store");
            Ok((
                Arc::new(PostgresDefinitionRepository::new(pool.clone())),
                Arc::new(PostgresInstanceRepository::new(pool)),
            ))
        }
        DatabaseKind::Mongo => {
            let client = mongodb::Client::with_uri_str(&url()?).await?;
            let db = client.database(&database.mongo_database);
            let definitions = MongoDefinitionRepository::new(&db);
            definitions.init_indexes().await?;
            let instances = MongoInstanceRepository::new(&db);
            instances.init_indexes().await?;
            info!("Using MongoDB workflow store: {}", database.mongo_database);
            Ok((Arc::new(definitions), Arc::new(instances)))
        }
    }
}

/// Every connection to an in-memory SQLite URL opens its own empty database
fn sqlite_pool_size(url: &str, configured: u32) -> u32 {
    if url.contains(":memory:") || url.contains("mode=memory") {
        1
    } else {
        configured
    }
}

async fn register_definitions(services: &WorkflowServices, path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let definitions: Vec<ProcessDefinition> = serde_json::from_str(&raw)?;

    for definition in definitions {
        let graph = services.definitions.register_process(definition).await?;
        let process = graph.process();
        info!(
            code = %process.code,
            version = process.version,
            "Registered process from {}",
            path.display()
        );
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
