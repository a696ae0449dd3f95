//! Enqueue a translation job and run it in the foreground.
//!
//! Usage:
//!   cargo run --bin translate                       # TARGET_LANGUAGES
//!   cargo run --bin translate -- --lang es,fr       # Explicit languages
//!   cargo run --bin translate -- --scope 42 --limit 500
//!   cargo run --bin translate -- --resume           # Only run queued tasks
//!
//! Ctrl-C stops after re-queueing the unfinished items; the next run
//! (or the service's queue polling) picks them up.
//!
//! Required environment variables:
//! - OPENAI_API_KEY
//! - TARGET_LANGUAGES (unless --lang is given)

use anyhow::{bail, Context, Result};
use tagsync::app::App;
use tagsync::config::{parse_languages, Config};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct Args {
    langs: Vec<String>,
    scope: Option<i64>,
    limit: Option<usize>,
    resume: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        langs: Vec::new(),
        scope: None,
        limit: None,
        resume: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--lang" => args.langs = parse_languages(&iter.next().context("--lang needs a list")?),
            "--scope" => {
                let value = iter.next().context("--scope needs an id")?;
                args.scope = Some(value.parse().context("--scope needs an id")?);
            }
            "--limit" => {
                let value = iter.next().context("--limit needs a number")?;
                args.limit = Some(value.parse().context("--limit needs a number")?);
            }
            "--resume" => args.resume = true,
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
    eprintln!("Usage: translate [--lang es,fr] [--scope ID] [--limit N] [--resume]");
}

#[tokio::main]
async fn main() -> Result<()> {
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
    let mut config = Config::from_env()?;
    if !args.langs.is_empty() {
        config.target_languages = args.langs.clone();
    }
    config.validate_translation()?;
    let app = App::from_config(config)?;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing the current step");
            trigger.cancel();
        }
    });

    let job_id = if args.resume {
        None
    } else {
        let job = app
            .orchestrator
            .enqueue_translation(&args.langs, args.scope, args.limit)?;
        info!("Job {}: {} items, status {}", job.id, job.total, job.status.as_str());
        Some(job.id)
    };

    let ran = app.orchestrator.drain(&cancel).await?;
    info!("Ran {} tasks", ran);

    if let Some(id) = job_id {
        if let Some(job) = app.db.get_job(&id)? {
            println!(
                "Job {}: {} ({}/{} items, {:.1}%)",
                job.id,
                job.status.as_str(),
                job.processed,
                job.total,
                job.percentage()
            );
            if let Some(reason) = job.failure_reason {
                println!("Reason: {}", reason);
            }
        }
    }
    if cancel.is_cancelled() {
        println!("Unfinished items stay queued; run with --resume to continue.");
    }
    Ok(())
}
