//! Run one budgeted tagging pass, or one mapping purge, and exit.
//!
//! Usage:
//!   cargo run --bin tag-pass                     # Tag up to SCAN_BUDGET rows
//!   cargo run --bin tag-pass -- --budget 5000    # Override the budget
//!   cargo run --bin tag-pass -- --purge          # Purge stale scope mappings
//!   cargo run --bin tag-pass -- --purge --batch 2000
//!
//! Reads the same environment as the service (DATABASE_PATH,
//! CONTENT_DATABASE_PATH, REGISTRY_FILE, ...).

use anyhow::{bail, Context, Result};
use tagsync::app::App;
use tagsync::config::Config;
use tagsync::scan::PassState;
use tracing::info;

struct Args {
    purge: bool,
    budget: Option<usize>,
    batch: Option<usize>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        purge: false,
        budget: None,
        batch: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--purge" => args.purge = true,
            "--budget" => {
                let value = iter.next().context("--budget needs a number")?;
                args.budget = Some(value.parse().context("--budget needs a number")?);
            }
            "--batch" => {
                let value = iter.next().context("--batch needs a number")?;
                args.batch = Some(value.parse().context("--batch needs a number")?);
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                print_usage();
                bail!("Unknown argument: {}", other);
            }
        }
    }
    Ok(args)
}

fn print_usage() {
    eprintln!("Usage: tag-pass [--budget N] | --purge [--batch N]");
}

fn main() -> Result<()> {
    // Load environment from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tagsync=info".parse()?),
        )
        .init();

    let args = parse_args()?;
    let config = Config::from_env()?;
    let app = App::from_config(config)?;

    if args.purge {
        let batch = args.batch.unwrap_or(app.config.purge_batch_size);
        let report = app.scope_mapper().purge(batch)?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let budget = args.budget.unwrap_or(app.config.scan_budget);
    info!("Tagging up to {} rows", budget);
    let outcome = app.tagging_pass().run(budget)?;

    match outcome.state {
        PassState::Idle => println!(
            "Pass complete: {} rows, {} fields changed, {} skipped",
            outcome.rows_processed, outcome.fields_changed, outcome.rows_skipped
        ),
        PassState::Paused { table, last_id } => println!(
            "Paused at {}#{}: {} rows, {} fields changed, {} skipped (run again to continue)",
            table, last_id, outcome.rows_processed, outcome.fields_changed, outcome.rows_skipped
        ),
    }
    Ok(())
}
