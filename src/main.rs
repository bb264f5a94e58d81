//! sqlclient - Main entry point.
//!
//! Runs a query, a statement or a file of statements through a named client
//! and prints the result as JSON.

use clap::Parser;
use sqlclient::config::{Cli, Command};
use sqlclient::db::{self, Client, governor};
use sqlclient::error::{SqlError, SqlResult};
use sqlclient::models::Arg;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // Logs go to stderr; stdout carries the results.
    if cli.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Statements in a batch file: one per line, blank lines and `--` comments skipped.
fn read_statements(path: &Path) -> SqlResult<Vec<String>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        SqlError::config(format!("cannot read {}: {}", path.display(), e))
    })?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("--"))
        .map(str::to_string)
        .collect())
}

fn run(cli: &Cli, client: &Arc<Client>) -> SqlResult<serde_json::Value> {
    match &cli.command {
        Command::Query { sql } => {
            let records = client.simple_query(sql)?;
            serde_json::to_value(&records).map_err(|e| SqlError::internal(format!("Failed to encode rows: {}", e)))
        }
        Command::Execute { sql } => {
            let affected = client.execute(&[Arg::from(sql.as_str())])?;
            Ok(serde_json::json!({ "rows_affected": affected }))
        }
        Command::Batch {
            file,
            stop_on_failure,
            merge,
        } => {
            let mut batch = client.batch(*stop_on_failure);
            batch.set_merge(*merge);
            for statement in read_statements(file)? {
                batch.add(&[Arg::from(statement)])?;
            }
            let mut failures = client.transaction();
            let succeeded = batch.execute_batch_returning_failures(Some(&mut failures), true)?;
            Ok(serde_json::json!({
                "succeeded": succeeded,
                "failed": failures.total_count(),
                "failures": failures.statements(),
            }))
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    db::set_default_debugging(cli.debugging);
    db::set_default_duration_logging(cli.duration_logging.map(Duration::from_millis));

    info!("Starting sqlclient v{}", env!("CARGO_PKG_VERSION"));

    let result = cli
        .sql_config()
        .and_then(|config| Client::open(&config, cli.reference.as_deref()))
        .and_then(|client| run(&cli, &client));

    governor::shutdown();

    match result {
        Ok(output) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&output).unwrap_or_else(|_| output.to_string())
            );
        }
        Err(e) => {
            error!(error = %e, "Command failed");
            if let Some(hint) = e.suggestion() {
                eprintln!("Error: {}\nHint: {}", e, hint);
            } else {
                eprintln!("Error: {}", e);
            }
            std::process::exit(1);
        }
    }
}
