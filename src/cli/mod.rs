mod config;

pub use config::{FlowStateConfig, IngestConfig, PersistenceConfig};

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::service::FlowStateService;
use crate::state::{FlowFilter, Status, Step};
use crate::storage::{Backend, RelationalStore};

#[derive(Parser)]
#[command(name = "flowstate", version, about = "Flow execution state store")]
pub struct Cli {
    /// Path to a .env file to load (default: auto-detect .env in cwd)
    #[arg(long, global = true)]
    dotenv: Option<PathBuf>,

    /// Path to flowstate.yaml (default: auto-detect in cwd)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database URL, overrides the persistence section of the config file
    #[arg(long, global = true, env = "FLOWSTATE_DATABASE_URL")]
    database_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Probe the relational backend and report its schema
    Check,

    /// Create the flowstate, steps and appstate tables
    InitSchema,

    /// List flow instances
    List {
        #[arg(long)]
        user: Option<String>,

        #[arg(long)]
        app: Option<String>,

        #[arg(long)]
        app_version: Option<String>,

        #[arg(long)]
        host: Option<String>,

        #[arg(long)]
        flow: Option<String>,

        /// Filter by status (Started, Completed, Failed, Cancelled, ...)
        #[arg(short, long)]
        status: Option<String>,

        #[arg(long)]
        offset: Option<i64>,

        #[arg(long)]
        limit: Option<i64>,

        /// Output format (table, json)
        #[arg(long, default_value = "table")]
        format: String,
    },

    /// Show one flow instance
    Inspect { flow_id: String },

    /// Print the step log of an instance
    Steps {
        flow_id: String,

        /// Reconcile each step into task views
        #[arg(long)]
        tasks: bool,
    },

    /// Print one summary row per step
    StatusLog { flow_id: String },

    /// Print the snapshot of an instance, optionally as of a step
    Snapshot {
        flow_id: String,

        #[arg(long)]
        step: Option<i64>,
    },

    /// Delete an instance and its steps
    Delete { flow_id: String },

    /// Delete every step from a step id onwards
    Truncate {
        flow_id: String,

        #[arg(long)]
        from: i64,
    },

    /// Load a JSON array of steps
    Ingest {
        file: PathBuf,

        /// Route the steps through the asynchronous pipeline
        #[arg(long = "async")]
        queued: bool,
    },
}

pub async fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Load .env file
    load_dotenv(cli.dotenv.as_deref());

    let config = FlowStateConfig::load(cli.config.as_deref())?;
    let backend = config.backend(cli.database_url.as_deref());

    match cli.command {
        Commands::Check => cmd_check(&backend).await,
        Commands::InitSchema => cmd_init_schema(&backend).await,
        Commands::List {
            user,
            app,
            app_version,
            host,
            flow,
            status,
            offset,
            limit,
            format,
        } => {
            let status = status
                .as_deref()
                .map(|s| s.parse::<Status>().map_err(|e| anyhow::anyhow!(e)))
                .transpose()?;
            let filter = FlowFilter {
                user_id: user,
                app_name: app,
                app_version,
                host_id: host,
                flow_name: flow,
                status: status.map(|s| s.to_string()),
                offset,
                limit,
                ..Default::default()
            };
            let service = open_service(&config, &backend).await?;
            cmd_list(&service, &filter, &format).await
        }
        Commands::Inspect { flow_id } => {
            let service = open_service(&config, &backend).await?;
            cmd_inspect(&service, &flow_id).await
        }
        Commands::Steps { flow_id, tasks } => {
            let service = open_service(&config, &backend).await?;
            cmd_steps(&service, &flow_id, tasks).await
        }
        Commands::StatusLog { flow_id } => {
            let service = open_service(&config, &backend).await?;
            let rows = service.steps_status(&flow_id).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
            Ok(())
        }
        Commands::Snapshot { flow_id, step } => {
            let service = open_service(&config, &backend).await?;
            cmd_snapshot(&service, &flow_id, step).await
        }
        Commands::Delete { flow_id } => {
            let service = open_service(&config, &backend).await?;
            service.delete_flow(&flow_id).await?;
            println!("Deleted flow {}", flow_id);
            Ok(())
        }
        Commands::Truncate { flow_id, from } => {
            let service = open_service(&config, &backend).await?;
            service.delete_steps(&flow_id, from).await?;
            println!("Deleted steps >= {} of flow {}", from, flow_id);
            Ok(())
        }
        Commands::Ingest { file, queued } => {
            let service = open_service(&config, &backend).await?;
            cmd_ingest(&service, file, queued).await
        }
    }
}

/// Load environment variables from a .env file.
/// If an explicit path is given, load from that path (error if missing).
/// Otherwise, auto-detect .env in the current working directory (silently skip if absent).
fn load_dotenv(explicit_path: Option<&std::path::Path>) {
    match explicit_path {
        Some(path) => match dotenvy::from_path(path) {
            Ok(()) => info!("Loaded env from {}", path.display()),
            Err(e) => {
                eprintln!(
                    "Warning: Failed to load dotenv file '{}': {}",
                    path.display(),
                    e
                );
            }
        },
        None => match dotenvy::dotenv() {
            Ok(path) => info!("Loaded env from {}", path.display()),
            Err(dotenvy::Error::Io(_)) => {}
            Err(e) => {
                eprintln!("Warning: Failed to parse .env file: {}", e);
            }
        },
    }
}

async fn open_service(config: &FlowStateConfig, backend: &Backend) -> Result<FlowStateService> {
    FlowStateService::open(backend, &config.ingest_options())
        .await
        .context("Failed to open state store")
}

async fn open_relational(backend: &Backend) -> Result<RelationalStore> {
    let Backend::Relational(settings) = backend else {
        anyhow::bail!("This command needs a relational backend (set --database-url or persistence.type)");
    };
    RelationalStore::connect(settings)
        .await
        .context("Failed to connect to database")
}

async fn cmd_check(backend: &Backend) -> Result<()> {
    let store = open_relational(backend).await?;
    store.connection().ping().await?;
    let details = store.details().await;

    println!("Connected:      {}", details.connected);
    println!("Tables present: {}", details.tables_exist);
    println!("Schema version: {}", details.schema_version);
    println!("Max connections: {}", store.connection().max_concurrency());
    println!("Message:        {}", details.message);

    if !details.tables_exist {
        anyhow::bail!("Schema is incomplete, run `flowstate init-schema`");
    }
    Ok(())
}

async fn cmd_init_schema(backend: &Backend) -> Result<()> {
    let store = open_relational(backend).await?;
    store.init_schema().await?;
    let details = store.details().await;
    println!("Schema ready (version {})", details.schema_version);
    Ok(())
}

async fn cmd_list(service: &FlowStateService, filter: &FlowFilter, format: &str) -> Result<()> {
    let record = service.list_flows(filter).await?;

    if record.flow_data.is_empty() {
        println!("No flows found.");
        return Ok(());
    }

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    println!(
        "{:<38} {:<24} {:<10} {:<24} {:>10}",
        "INSTANCE ID", "FLOW", "STATUS", "STARTED", "MS"
    );
    println!("{}", "-".repeat(110));

    for flow in &record.flow_data {
        let started = flow
            .start_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        let millis = flow
            .execution_time
            .map(|ms| ms.to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<38} {:<24} {:<10} {:<24} {:>10}",
            flow.id, flow.flow_name, flow.status, started, millis
        );
    }

    println!(
        "\nShowing {} of {} flow(s)",
        record.flow_data.len(),
        record.count
    );
    Ok(())
}

async fn cmd_inspect(service: &FlowStateService, flow_id: &str) -> Result<()> {
    let info = service
        .flow(flow_id)
        .await?
        .with_context(|| format!("Flow '{}' not found", flow_id))?;

    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}

async fn cmd_steps(service: &FlowStateService, flow_id: &str, tasks: bool) -> Result<()> {
    if tasks {
        let tasks = service.steps_as_tasks(flow_id).await?;
        println!("{}", serde_json::to_string_pretty(&tasks)?);
    } else {
        let steps = service.steps(flow_id).await?;
        println!("{}", serde_json::to_string_pretty(&steps)?);
    }
    Ok(())
}

async fn cmd_snapshot(service: &FlowStateService, flow_id: &str, step: Option<i64>) -> Result<()> {
    let snapshot = match step {
        Some(step_id) => service.snapshot_at(flow_id, step_id).await?,
        None => service.snapshot(flow_id).await?,
    };
    let snapshot = snapshot.with_context(|| format!("Flow '{}' has no recorded state", flow_id))?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

async fn cmd_ingest(service: &FlowStateService, file: PathBuf, queued: bool) -> Result<()> {
    let data = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let items: Vec<serde_json::Value> = serde_json::from_str(&data)
        .with_context(|| format!("{} is not a JSON array of steps", file.display()))?;

    let total = items.len();
    for item in items {
        if queued {
            service.submit_step(serde_json::to_vec(&item)?).await?;
        } else {
            let step: Step = serde_json::from_value(item).context("Invalid step")?;
            service.save_step(&step).await?;
        }
    }
    if queued {
        info!(pending = service.pending_writes().await, "Draining ingestion queue");
    }
    service.shutdown().await;

    println!("Ingested {} step(s)", total);
    Ok(())
}
