//! WolfHACtl - Command line tool for managing WolfHA clusters
//!
//! Usage:
//!   wolfhactl list                 - Show backend states
//!   wolfhactl status               - Show node status and backend health
//!   wolfhactl deactivate <name>    - Remove a backend from the active set
//!   wolfhactl activate <name>      - Resynchronize and reactivate a backend
//!   wolfhactl resync <name>        - Resynchronize with a chosen strategy

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use std::path::PathBuf;

use wolfha::api::{
    ActivateResponse, BackendDetail, DeactivateResponse, ErrorResponse, ResyncRequest, SqlRequest,
    SqlResponse, StatusResponse,
};
use wolfha::config::WolfHaConfig;
use wolfha::state::{BackendState, BackendStatus};
use wolfha::sync::{SyncReport, SyncStrategy, SynchronizationPlan};

/// WolfHA Cluster Control Tool
#[derive(Parser)]
#[command(name = "wolfhactl")]
#[command(about = "Control and monitor WolfHA clusters", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/wolfha/config.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List backends and their states
    List,
    /// Show node status and backend health
    Status,
    /// Show one backend and its last synchronization
    Show { name: String },
    /// Remove a backend from the active set
    Deactivate { name: String },
    /// Resynchronize a backend with the default strategy and reactivate it
    Activate { name: String },
    /// Resynchronize a backend
    Resync {
        name: String,
        /// full-copy, diff or passive
        #[arg(short, long)]
        strategy: Option<SyncStrategy>,
        /// Reference backend (defaults to the primary or first active)
        #[arg(long)]
        from: Option<String>,
    },
    /// Show the structural changes a resync would apply
    Plan {
        name: String,
        #[arg(long)]
        from: Option<String>,
    },
    /// Run one SQL statement through the cluster
    Sql { sql: String },
    /// Check configuration file for errors
    CheckConfig {
        /// Path to config file to check (defaults to --config path)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let endpoint = cli
        .endpoint
        .clone()
        .unwrap_or_else(|| endpoint_from_config(&cli.config));
    let client = reqwest::Client::new();

    let result = match &cli.command {
        Commands::List => list_backends(&client, &endpoint).await,
        Commands::Status => show_status(&client, &endpoint).await,
        Commands::Show { name } => show_backend(&client, &endpoint, name).await,
        Commands::Deactivate { name } => deactivate(&client, &endpoint, name).await,
        Commands::Activate { name } => activate(&client, &endpoint, name).await,
        Commands::Resync {
            name,
            strategy,
            from,
        } => resync(&client, &endpoint, name, *strategy, from.clone()).await,
        Commands::Plan { name, from } => plan(&client, &endpoint, name, from.as_deref()).await,
        Commands::Sql { sql } => run_sql(&client, &endpoint, sql).await,
        Commands::CheckConfig { file } => {
            check_config(file.as_ref().unwrap_or(&cli.config))
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// API endpoint from the config's bind address, 0.0.0.0 mapped to localhost
fn endpoint_from_config(path: &PathBuf) -> String {
    let fallback = "http://127.0.0.1:8080".to_string();
    let Ok(content) = std::fs::read_to_string(path) else {
        return fallback;
    };
    let Ok(config) = WolfHaConfig::from_str(&content) else {
        return fallback;
    };
    let addr = config.api.bind_address;
    if addr.starts_with("0.0.0.0") {
        format!(
            "http://127.0.0.1:{}",
            addr.split(':').nth(1).unwrap_or("8080")
        )
    } else {
        format!("http://{}", addr)
    }
}

/// Decode a successful response, or turn an API error into a message
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response.json().await.context("invalid API response");
    }
    match response.json::<ErrorResponse>().await {
        Ok(error) => bail!("{} ({})", error.error, error.code),
        Err(_) => bail!("API error: {}", status),
    }
}

fn colored_state(state: BackendState) -> String {
    let padded = format!("{:<14}", state.as_str());
    match state {
        BackendState::Active => format!("\x1b[32m{}\x1b[0m", padded),
        BackendState::Synchronizing => format!("\x1b[33m{}\x1b[0m", padded),
        BackendState::Inactive => format!("\x1b[31m{}\x1b[0m", padded),
    }
}

// ============ Commands ============

async fn list_backends(client: &reqwest::Client, endpoint: &str) -> Result<()> {
    let response = client.get(format!("{}/backends", endpoint)).send().await?;
    let backends: Vec<BackendStatus> = decode(response).await?;

    let active = backends
        .iter()
        .filter(|b| b.state == BackendState::Active)
        .count();

    println!();
    println!("WolfHA Backends (wolfhactl v{})", env!("CARGO_PKG_VERSION"));
    println!("==============================");
    println!();
    println!("Total: {} backends  |  Active: {}", backends.len(), active);
    println!();
    println!("{:<16} {:<10} {:<7} {:<14} {}", "NAME", "DIALECT", "WEIGHT", "STATE", "SINCE");
    println!("{}", "-".repeat(72));
    for backend in &backends {
        println!(
            "{:<16} {:<10} {:<7} {} {}",
            backend.name,
            backend.dialect.to_string(),
            backend.weight,
            colored_state(backend.state),
            backend.last_transition.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!();
    Ok(())
}

async fn show_status(client: &reqwest::Client, endpoint: &str) -> Result<()> {
    let response = client.get(format!("{}/status", endpoint)).send().await?;
    let status: StatusResponse = decode(response).await?;

    println!();
    println!("Node Status");
    println!("===========");
    println!();
    println!("Node ID:      {}", status.node_id);
    println!("Cluster:      {}", status.cluster_id);
    println!("Uptime:       {}s", status.uptime_seconds);
    println!();
    for backend in &status.backends {
        println!(
            "  {:<16} {} {}",
            backend.status.name,
            colored_state(backend.status.state),
            if backend.reachable { "reachable" } else { "UNREACHABLE" }
        );
    }
    println!();
    Ok(())
}

async fn show_backend(client: &reqwest::Client, endpoint: &str, name: &str) -> Result<()> {
    let response = client
        .get(format!("{}/backends/{}", endpoint, name))
        .send()
        .await?;
    let detail: BackendDetail = decode(response).await?;

    println!("Backend:      {}", detail.status.name);
    println!("Dialect:      {}", detail.status.dialect);
    println!("State:        {}", detail.status.state);
    println!("Since:        {}", detail.status.last_transition);
    match detail.last_sync {
        Some(sync) => println!(
            "Last sync:    {} {} at {}{}",
            sync.strategy,
            if sync.succeeded { "succeeded" } else { "failed" },
            sync.finished_at,
            sync.detail.map(|d| format!(" ({})", d)).unwrap_or_default()
        ),
        None => println!("Last sync:    never"),
    }
    Ok(())
}

async fn deactivate(client: &reqwest::Client, endpoint: &str, name: &str) -> Result<()> {
    let response = client
        .post(format!("{}/backends/{}/deactivate", endpoint, name))
        .send()
        .await?;
    let result: DeactivateResponse = decode(response).await?;
    if result.deactivated {
        println!("✓ Backend {} deactivated", result.backend);
    } else {
        println!("Backend {} was not active", result.backend);
    }
    Ok(())
}

async fn activate(client: &reqwest::Client, endpoint: &str, name: &str) -> Result<()> {
    println!("Activating {} (this synchronizes it first)...", name);
    let response = client
        .post(format!("{}/backends/{}/activate", endpoint, name))
        .send()
        .await?;
    let result: ActivateResponse = decode(response).await?;
    match result.report {
        Some(report) => print_report(&report),
        None => println!("Backend {} is already active", result.backend),
    }
    Ok(())
}

async fn resync(
    client: &reqwest::Client,
    endpoint: &str,
    name: &str,
    strategy: Option<SyncStrategy>,
    reference: Option<String>,
) -> Result<()> {
    let response = client
        .post(format!("{}/backends/{}/resync", endpoint, name))
        .json(&ResyncRequest { strategy, reference })
        .send()
        .await?;
    let report: SyncReport = decode(response).await?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &SyncReport) {
    println!(
        "✓ Backend {} synchronized from {} ({}) in {} ms",
        report.backend, report.reference, report.strategy, report.duration_ms
    );
    println!("  Structural changes: {}", report.structural_changes);
    println!("  Sequences reset:    {}", report.sequences_reset);
    for table in &report.tables {
        println!(
            "  {:<24} +{} ~{} -{}",
            table.table, table.inserted, table.updated, table.deleted
        );
    }
}

async fn plan(
    client: &reqwest::Client,
    endpoint: &str,
    name: &str,
    reference: Option<&str>,
) -> Result<()> {
    let mut request = client.get(format!("{}/backends/{}/plan", endpoint, name));
    if let Some(reference) = reference {
        request = request.query(&[("reference", reference)]);
    }
    let plan: SynchronizationPlan = decode(request.send().await?).await?;
    if plan.is_empty() {
        println!("No structural changes");
    }
    for step in &plan.steps {
        println!("  {}", step);
    }
    Ok(())
}

async fn run_sql(client: &reqwest::Client, endpoint: &str, sql: &str) -> Result<()> {
    let response = client
        .post(format!("{}/sql", endpoint))
        .json(&SqlRequest {
            sql: sql.to_string(),
            params: Vec::new(),
        })
        .send()
        .await?;
    match decode::<SqlResponse>(response).await? {
        SqlResponse::Rows { columns, rows } => {
            println!("{}", columns.join("\t"));
            for row in rows {
                let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
                println!("{}", cells.join("\t"));
            }
        }
        SqlResponse::Update {
            rows_affected,
            last_insert_id,
            generated_key_divergent,
        } => {
            println!("{} rows affected", rows_affected);
            if let Some(id) = last_insert_id {
                println!("Generated key: {}", id);
            }
            if generated_key_divergent {
                println!("Warning: backends generated different keys");
            }
        }
    }
    Ok(())
}

fn check_config(path: &PathBuf) -> Result<()> {
    let config = WolfHaConfig::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    println!("✓ Configuration is valid");
    println!("  Node ID:  {}", config.node.id);
    println!("  Cluster:  {}", config.cluster.id);
    for backend in &config.backends {
        println!("  Backend:  {} ({})", backend.name, backend.dialect);
    }
    Ok(())
}
