//! tollgate - prepaid consumption ledger
//!
//! Operator CLI for inspecting and exercising a Tollgate ledger database.
//! Results are printed as JSON on stdout; logs go to stderr.
//!
//! Exit codes: 0 on success, 1 on error, 2 when `verify` denies the request,
//! 3 when `settle` requires reconciliation.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tollgate_core::{Account, AccountId, AccountStatus, Ledger, SqliteLedger};
use tollgate_runtime::{DenialReason, Gatekeeper, RuntimeConfig, SettlementResult};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// tollgate - prepaid consumption ledger
#[derive(Parser, Debug)]
#[command(name = "tollgate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the ledger database
    #[arg(long, default_value = "tollgate.db")]
    db: PathBuf,

    /// Path to a YAML runtime configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging (overridden by RUST_LOG)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the database schema
    Init,

    /// Open a prepaid account
    OpenAccount {
        /// Account identifier
        account_id: String,

        /// Plan name
        #[arg(long)]
        plan: String,

        /// Hours granted by the plan
        #[arg(long)]
        hours: f64,

        /// Initial status (active, trial, suspended, cancelled)
        #[arg(long, default_value = "active")]
        status: AccountStatus,
    },

    /// Show the committed balance
    Balance {
        /// Account identifier
        account_id: String,
    },

    /// Show consumption status
    Status {
        /// Account identifier
        account_id: String,
    },

    /// Check whether an account can cover an estimate
    Verify {
        /// Account identifier
        account_id: String,

        /// Estimated hours
        hours: f64,
    },

    /// Record actual usage
    Settle {
        /// Account identifier
        account_id: String,

        /// Actual hours consumed
        hours: f64,

        /// Unique reference of the consuming work (e.g. a meeting id)
        reference: String,
    },

    /// Print the usage audit trail
    Audit {
        /// Account identifier
        account_id: String,
    },
}

#[derive(Serialize)]
struct Denial {
    allowed: bool,
    reason: DenialReason,
    retryable: bool,
    error: String,
}

#[derive(Serialize)]
struct Balance<'a> {
    account_id: &'a AccountId,
    available_hours: f64,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match &cli.config {
        Some(path) => RuntimeConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => RuntimeConfig::default(),
    };

    let ledger = Arc::new(
        SqliteLedger::open(&cli.db)
            .with_context(|| format!("failed to open ledger at {}", cli.db.display()))?,
    );
    tracing::debug!(db = %cli.db.display(), "ledger opened");
    let gatekeeper = Gatekeeper::builder(ledger.clone()).config(config).build();

    match cli.command {
        Commands::Init => {
            print_json(&serde_json::json!({ "database": cli.db }))?;
        }
        Commands::OpenAccount {
            account_id,
            plan,
            hours,
            status,
        } => {
            let account = Account::new(account_id, plan, hours).with_status(status);
            gatekeeper
                .open_account(account.clone())
                .await
                .context("failed to open account")?;
            print_json(&account)?;
        }
        Commands::Balance { account_id } => {
            let account_id = AccountId::new(account_id);
            let available_hours = ledger
                .get_balance(&account_id)
                .with_context(|| format!("failed to read balance of {account_id}"))?;
            print_json(&Balance {
                account_id: &account_id,
                available_hours,
            })?;
        }
        Commands::Status { account_id } => {
            let account_id = AccountId::new(account_id);
            let status = gatekeeper
                .status(&account_id)
                .await
                .with_context(|| format!("failed to read status of {account_id}"))?;
            print_json(&status)?;
        }
        Commands::Verify { account_id, hours } => {
            let account_id = AccountId::new(account_id);
            match gatekeeper.verify(&account_id, hours).await {
                Ok(authorization) => print_json(&authorization)?,
                Err(err) => {
                    print_json(&Denial {
                        allowed: false,
                        reason: err.denial_reason(),
                        retryable: err.is_retryable(),
                        error: err.to_string(),
                    })?;
                    return Ok(ExitCode::from(2));
                }
            }
        }
        Commands::Settle {
            account_id,
            hours,
            reference,
        } => {
            let account_id = AccountId::new(account_id);
            let result = gatekeeper
                .settle(&account_id, hours, &reference)
                .await
                .with_context(|| format!("failed to settle {reference} for {account_id}"))?;
            print_json(&result)?;
            if let SettlementResult::ReconciliationRequired(_) = result {
                return Ok(ExitCode::from(3));
            }
        }
        Commands::Audit { account_id } => {
            let account_id = AccountId::new(account_id);
            let trail = gatekeeper
                .audit_trail(&account_id)
                .await
                .with_context(|| format!("failed to read audit trail of {account_id}"))?;
            print_json(&trail)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to serialize output")?;
    println!("{json}");
    Ok(())
}
