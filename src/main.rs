//! WolfMigrate - Online MySQL/PostgreSQL Data Migration
//!
//! Runs the migration service, or talks to a running one over its HTTP API.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfmigrate::api::{ErrorResponse, HttpServer};
use wolfmigrate::config::{LoggingConfig, MigratorConfig};
use wolfmigrate::dialect::DialectRegistry;
use wolfmigrate::error::{Error, Result};
use wolfmigrate::job::{
    CheckStatusInfo, JobCoordinator, JobItemInfo, JobListInfo, ProgressStore,
};

/// WolfMigrate - Online MySQL/PostgreSQL Data Migration
#[derive(Parser)]
#[command(name = "wolfmigrate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfmigrate.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the migration service
    Run,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfmigrate.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// List jobs
    List {
        /// API address of the service
        #[arg(short, long, default_value = "localhost:8090")]
        address: String,
    },

    /// Show per-item status of a job
    Status {
        job_id: String,

        #[arg(short, long, default_value = "localhost:8090")]
        address: String,
    },

    /// Start a consistency check, or show the latest one with --status
    Check {
        job_id: String,

        /// Show check progress instead of starting a check
        #[arg(long)]
        status: bool,

        #[arg(short, long, default_value = "localhost:8090")]
        address: String,
    },

    /// Restart a stopped job from its saved positions
    Start {
        job_id: String,

        #[arg(short, long, default_value = "localhost:8090")]
        address: String,
    },

    /// Stop a job
    Stop {
        job_id: String,

        #[arg(short, long, default_value = "localhost:8090")]
        address: String,
    },

    /// Verify a job and release its source retention
    Commit {
        job_id: String,

        #[arg(short, long, default_value = "localhost:8090")]
        address: String,
    },

    /// Stop a job and delete its progress
    Drop {
        job_id: String,

        #[arg(short, long, default_value = "localhost:8090")]
        address: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Service commands log as configured, client commands stay quiet
    let logging = match &cli.command {
        Commands::Run => MigratorConfig::from_file(&cli.config)
            .map(|c| c.logging)
            .unwrap_or_default(),
        _ => LoggingConfig {
            level: "warn".into(),
            ..LoggingConfig::default()
        },
    };
    init_logging(&logging, cli.log_level.as_deref());

    match cli.command {
        Commands::Run => run_service(cli.config).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::List { address } => run_list(address).await,
        Commands::Status { job_id, address } => run_status(address, job_id).await,
        Commands::Check {
            job_id,
            status,
            address,
        } => run_check(address, job_id, status).await,
        Commands::Start { job_id, address } => {
            run_action(address, reqwest::Method::POST, format!("jobs/{}/start", job_id)).await
        }
        Commands::Stop { job_id, address } => {
            run_action(address, reqwest::Method::POST, format!("jobs/{}/stop", job_id)).await
        }
        Commands::Commit { job_id, address } => {
            run_action(address, reqwest::Method::POST, format!("jobs/{}/commit", job_id)).await
        }
        Commands::Drop { job_id, address } => {
            run_action(address, reqwest::Method::DELETE, format!("jobs/{}", job_id)).await
        }
    }
}

/// Initialize logging
fn init_logging(config: &LoggingConfig, level: Option<&str>) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.unwrap_or(&config.level).into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Run the migration service until interrupted
async fn run_service(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting WolfMigrate...");

    let config = match MigratorConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    let store = match ProgressStore::open(&config.progress_db_path()) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            tracing::error!(
                "Failed to open progress store {:?}: {}",
                config.progress_db_path(),
                e
            );
            return Err(e);
        }
    };

    let coordinator = Arc::new(JobCoordinator::new(
        config.node.id.clone(),
        config.pipeline.clone(),
        DialectRegistry::with_defaults(),
        store,
    ));

    let resumed = coordinator.resume_all().await?;
    tracing::info!("Resumed {} jobs", resumed);

    // Jobs declared in the file start once; later runs resume them from the store
    let known: Vec<String> = coordinator.list().await?.into_iter().map(|j| j.id).collect();
    for (index, mut job) in config.jobs.iter().cloned().enumerate() {
        let id = job
            .id
            .get_or_insert_with(|| format!("{}_job{}", config.node.id, index))
            .clone();
        if known.contains(&id) {
            continue;
        }
        if let Err(e) = coordinator.start(job).await {
            tracing::error!("Failed to start job {}: {}", id, e);
        }
    }

    let server = HttpServer::new(config.api.clone(), Arc::clone(&coordinator));
    let http_handle = tokio::spawn(async move {
        if let Err(e) = server.start().await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received shutdown signal"),
        Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
    }

    http_handle.abort();
    coordinator.shutdown().await;
    tracing::info!("WolfMigrate shutdown complete");
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(
        r#"# WolfMigrate Configuration
# Generated configuration file

[node]
id = "{node_id}"
data_dir = "/var/lib/wolfmigrate/{node_id}"

[pipeline]
channel_capacity = 1000
push_timeout_ms = 30000
importer_concurrency = 3
batch_size = 1000
retry_times = 3
retry_interval_ms = 1000
progress_interval_ms = 1000
drain_timeout_ms = 30000
check_chunk_size = 1000

[api]
enabled = true
bind_address = "0.0.0.0:8090"
cors_enabled = false

[logging]
level = "info"
format = "pretty"

# Jobs listed here start when the service first runs.
# [[jobs]]
# id = "orders"
# tables = ["t_order", "t_order_item"]
# concurrency = 3
#
# [[jobs.sources]]
# url = "jdbc:mysql://127.0.0.1:3306/ds_0"
# username = "root"
# password = "changeme"
#
# [jobs.target]
# url = "jdbc:mysql://127.0.0.1:3307/ds_target"
# username = "root"
# password = "changeme"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your jobs.");
    println!("Then start with: wolfmigrate --config {} run", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match MigratorConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Progress Store: {}", config.progress_db_path().display());
            println!("  API: {}", config.api.bind_address);
            println!("  Jobs: {}", config.jobs.len());
            for job in &config.jobs {
                println!(
                    "    {} -> {} ({} sources, tables {})",
                    job.source_dialect().map(|d| d.to_string()).unwrap_or_default(),
                    job.target.display_address(),
                    job.sources.len(),
                    job.tables.join(",")
                );
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

async fn request<T: DeserializeOwned>(
    address: &str,
    method: reqwest::Method,
    path: &str,
) -> Result<T> {
    let url = format!("http://{}/{}", address, path);
    let connection_error = |e: reqwest::Error| Error::Connection {
        address: address.to_string(),
        reason: e.to_string(),
    };

    let response = reqwest::Client::new()
        .request(method, &url)
        .send()
        .await
        .map_err(connection_error)?;
    if !response.status().is_success() {
        let status = response.status();
        let message = match response.json::<ErrorResponse>().await {
            Ok(error) => error.error,
            Err(_) => status.to_string(),
        };
        return Err(Error::Protocol(message));
    }
    response.json().await.map_err(connection_error)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_list(address: String) -> Result<()> {
    let jobs: Vec<JobListInfo> = request(&address, reqwest::Method::GET, "jobs").await?;
    if jobs.is_empty() {
        println!("No jobs");
        return Ok(());
    }
    println!(
        "{:<34} {:<7} {:<6} {:<24} {}",
        "ID", "ACTIVE", "ITEMS", "CREATED", "TABLES"
    );
    for job in jobs {
        println!(
            "{:<34} {:<7} {:<6} {:<24} {}",
            job.id, job.active, job.job_item_count, job.create_time, job.tables
        );
    }
    Ok(())
}

async fn run_status(address: String, job_id: String) -> Result<()> {
    let items: Vec<JobItemInfo> =
        request(&address, reqwest::Method::GET, &format!("jobs/{}", job_id)).await?;
    print_json(&items)
}

async fn run_check(address: String, job_id: String, status: bool) -> Result<()> {
    let path = format!("jobs/{}/check", job_id);
    if status {
        let check: CheckStatusInfo = request(&address, reqwest::Method::GET, &path).await?;
        return print_json(&check);
    }
    let response: serde_json::Value = request(&address, reqwest::Method::POST, &path).await?;
    print_json(&response)
}

async fn run_action(address: String, method: reqwest::Method, path: String) -> Result<()> {
    let response: serde_json::Value = request(&address, method, &path).await?;
    print_json(&response)
}
