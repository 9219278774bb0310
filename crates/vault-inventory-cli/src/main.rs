mod commands;
mod logging;
mod progress;

use std::io::{self, Write};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use colored::*;
use commands::{Cli, Commands, IndexArgs};
use dotenv::dotenv;
use progress::CliReporter;
use tracing::{error, info, warn};
use vault_inventory_core::config::load_configuration;
use vault_inventory_core::{
    AppConfig, Error, FilterSet, InventoryItem, InventoryReader, OverwritePolicy, RunOptions,
    RunOrchestrator, RunStatus, SourceKind,
};

fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let args = Cli::parse();
    let _guard = logging::init_logger(args.verbose);

    let config = match load_configuration(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    match args.command {
        Some(Commands::Index(index)) => {
            if let Err(err) = run_index(&config, &index) {
                report_failure(&err);
                process::exit(1);
            }
        }
        Some(Commands::Search { term }) => run_search(&config, &term)?,
        Some(Commands::Missing) => run_missing(&config)?,
        Some(Commands::PrintConfig) => {
            println!("Configuration: {:#?}", config);
        }
        None => {
            let _ = Cli::command().print_long_help();
        }
    }

    Ok(())
}

fn run_index(config: &AppConfig, args: &IndexArgs) -> anyhow::Result<()> {
    let selection = match (args.pdm_only, args.plm_only) {
        (true, _) => vec![SourceKind::Pdm],
        (_, true) => vec![SourceKind::Plm],
        _ => vec![SourceKind::Pdm, SourceKind::Plm],
    };
    let filters = FilterSet::from_args(
        &args.extensions,
        args.path_prefix.as_deref(),
        args.date_from.as_deref(),
        args.date_to.as_deref(),
    )?;

    let output = &config.output.path;
    let policy = if args.dry_run {
        OverwritePolicy::DryRun
    } else if args.force {
        OverwritePolicy::Force
    } else if !args.resume && output.exists() {
        let confirmed = prompt_confirm(
            &format!("{} already exists. Overwrite it?", output.display()),
            Some(false),
        )?;
        if !confirmed {
            info!("Keeping existing inventory {}", output.display());
            return Ok(());
        }
        OverwritePolicy::Prompt { confirmed }
    } else {
        OverwritePolicy::Prompt { confirmed: false }
    };

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            cancel.store(true, Ordering::SeqCst);
            eprintln!("Interrupt received, stopping after the current unit...");
        })
        .context("installing interrupt handler")?;
    }

    let mut orchestrator = RunOrchestrator::from_config(config.clone(), &selection)?;
    let reporter = CliReporter::new();
    let options = RunOptions {
        resume: args.resume,
        policy,
        filters,
        cancel,
    };
    let outcome = orchestrator.run(&options, &reporter)?;

    let summary = &outcome.summary;
    println!();
    for kind in &selection {
        info!(
            "{}: {} items",
            kind.as_str().to_uppercase(),
            format!("{}", summary.stats.total(*kind)).green()
        );
    }
    info!(
        "{} matched locally, {} missing locally, {} total in {:.2}s",
        format!("{}", summary.stats.matched).green(),
        format!("{}", summary.stats.missing_locally).red(),
        summary.total_items,
        outcome.duration.as_secs_f64()
    );
    if args.dry_run {
        info!("{}", "[DRY RUN] No inventory file was written.".yellow());
    } else {
        info!("Inventory written to {}", outcome.output.display());
    }

    if summary.status == RunStatus::Partial {
        warn!(
            "{} units failed; the inventory's summary.status is \"partial\". \
             Re-run with --resume to retry failed sources.",
            format!("{}", summary.failed_paths.len()).red()
        );
    }
    Ok(())
}

fn report_failure(err: &anyhow::Error) {
    match err.downcast_ref::<Error>() {
        Some(Error::RunAborted {
            cause,
            emitted,
            last_cursor,
        }) => {
            error!("Run aborted after {} items: {}", emitted, cause);
            match last_cursor {
                Some(cursor) => error!("Last recorded position: {}", cursor),
                None => error!("No position recorded yet"),
            }
            error!("Re-run with --resume to continue from there.");
        }
        _ => error!("Error: {:#}", err),
    }
}

fn print_item(item: &InventoryItem) {
    let local = match &item.local_path {
        Some(path) => path.green(),
        None => "missing locally".red(),
    };
    println!(
        "[{}] {}\n    remote: {}\n    local:  {}",
        item.source,
        item.name.bold(),
        item.remote_path,
        local
    );
}

fn run_search(config: &AppConfig, term: &str) -> anyhow::Result<()> {
    let reader = InventoryReader::open(&config.output.path)
        .with_context(|| format!("reading {}", config.output.path.display()))?;
    let hits = reader.search(term);
    for item in &hits {
        print_item(item);
    }
    info!("{} matches for '{}'", format!("{}", hits.len()).cyan(), term);
    Ok(())
}

fn run_missing(config: &AppConfig) -> anyhow::Result<()> {
    let reader = InventoryReader::open(&config.output.path)
        .with_context(|| format!("reading {}", config.output.path.display()))?;
    let missing = reader.report_missing();
    for item in &missing {
        print_item(item);
    }
    info!(
        "{} remote items missing locally",
        format!("{}", missing.len()).red()
    );
    Ok(())
}

fn prompt_confirm(prompt: &str, default: Option<bool>) -> io::Result<bool> {
    let mut input = String::new();

    loop {
        input.clear();

        match default {
            Some(true) => print!("{} (Y/n): ", prompt),
            Some(false) | None => print!("{} (y/N): ", prompt),
        }
        io::stdout().flush()?;

        io::stdin().read_line(&mut input)?;

        match input.trim().to_uppercase().as_str() {
            "Y" => return Ok(true),
            "N" => return Ok(false),
            "" => match default {
                Some(default) => return Ok(default),
                None => continue,
            },
            _ => continue,
        }
    }
}
