// SPDX-License-Identifier: PMPL-1.0-or-later

//! chaos-warden: periodically disrupt one member of each eligible instance
//! group and keep a ledger of what was done.

use anyhow::{anyhow, Context, Result};
use chaos_warden::catalog::{embedded_names, JsonInstanceCatalog};
use chaos_warden::config::parse_duration;
use chaos_warden::ledger::{EventLedger, LedgerMode};
use chaos_warden::report::{self, ReportFormatter, ReportOutputFormat};
use chaos_warden::{backend, credentials, ChaosConfig, ChaosEngine, Scheduler};
use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chaos-warden")]
#[command(version)]
#[command(about = "Fault-injection control loop for fleet resilience testing")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file (.yaml, .yml or .json)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug, -vvv trace); RUST_LOG wins
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Values that override the configuration file
#[derive(Args, Debug, Default)]
struct Overrides {
    /// Backend name (local, command)
    #[arg(long)]
    backend: Option<String>,

    /// Instance catalog location: file, http(s) URL or embedded:<name>
    #[arg(long)]
    catalog: Option<String>,

    /// Event ledger: "memory" or a JSON-lines file
    #[arg(long)]
    ledger: Option<String>,

    /// Decide, but neither disrupt nor record
    #[arg(long)]
    leashed: bool,

    /// Only consider these groups (repeatable)
    #[arg(long = "group", value_name = "NAME")]
    groups: Vec<String>,

    /// Seed the random draws for a reproducible run
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single chaos cycle and print its report
    Once {
        #[command(flatten)]
        overrides: Overrides,

        /// Save the report to a file (format from extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the report as JSON or YAML instead of text
        #[arg(short, long, value_enum)]
        format: Option<ReportOutputFormat>,
    },

    /// Run cycles on the configured interval
    Run {
        #[command(flatten)]
        overrides: Overrides,

        /// Stop after this many cycles
        #[arg(long)]
        cycles: Option<u64>,

        /// Interval between cycle starts, e.g. 30m or 1h
        #[arg(long)]
        interval: Option<String>,
    },

    /// Load an instance catalog and list its groups and instances
    Catalog {
        #[arg(value_name = "LOCATION")]
        location: String,
    },

    /// Print recorded chaos events
    History {
        /// Ledger file (defaults to the configured ledger)
        #[arg(long)]
        ledger: Option<String>,

        #[arg(short, long, value_enum)]
        format: Option<ReportOutputFormat>,
    },

    /// Show how credentials resolve for one instance, without secrets
    Credentials {
        #[arg(value_name = "LOCATION")]
        location: String,

        #[arg(value_name = "INSTANCE")]
        instance: String,
    },
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("chaos_warden={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&PathBuf>, overrides: &Overrides) -> Result<ChaosConfig> {
    let mut config = match path {
        Some(path) => ChaosConfig::load(path)?,
        None => ChaosConfig::default(),
    };
    if let Some(backend) = &overrides.backend {
        config.backend = backend.clone();
    }
    if let Some(catalog) = &overrides.catalog {
        config.catalog = catalog.clone();
    }
    if let Some(ledger) = &overrides.ledger {
        config.ledger = LedgerMode::parse(ledger);
    }
    if overrides.leashed {
        config.leashed = true;
    }
    if !overrides.groups.is_empty() {
        config.allow = overrides.groups.clone();
    }
    Ok(config)
}

fn build_engine(config: ChaosConfig, seed: Option<u64>) -> Result<ChaosEngine> {
    let backend = backend::build(&config.backend, &config)
        .with_context(|| format!("starting {} backend", config.backend))?;
    let ledger = config.ledger.open().context("opening event ledger")?;
    let engine = ChaosEngine::new(backend.crawler, backend.client, ledger, Arc::new(config))?;
    Ok(match seed {
        Some(seed) => engine.with_seed(seed),
        None => engine,
    })
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Once {
            overrides,
            output,
            format,
        } => {
            let config = load_config(cli.config.as_ref(), &overrides)?;
            let engine = build_engine(config, overrides.seed)?;
            let cycle = engine.run_cycle().context("chaos cycle failed")?;

            match format {
                Some(format) => println!("{}", format.serialize(&cycle)?),
                None => report::print_report(&cycle),
            }
            if let Some(output_path) = output {
                report::save_report(&cycle, output_path)?;
            }
        }

        Commands::Run {
            overrides,
            cycles,
            interval,
        } => {
            let mut config = load_config(cli.config.as_ref(), &overrides)?;
            if let Some(raw) = interval {
                config.interval = parse_duration(&raw).context("--interval")?;
            }
            let every = config.interval;
            let engine = Arc::new(build_engine(config, overrides.seed)?);
            info!(interval = ?every, "starting chaos scheduler");

            let formatter = ReportFormatter::new();
            let ran = Scheduler::new(engine, every)
                .run(cycles, |cycle| formatter.print(cycle))
                .context("chaos scheduler stopped")?;
            println!("\nCompleted {} cycle(s)", ran);
        }

        Commands::Catalog { location } => {
            let catalog = JsonInstanceCatalog::new(&location).with_context(|| {
                format!(
                    "bundled catalogs: {}",
                    embedded_names().collect::<Vec<_>>().join(", ")
                )
            })?;
            let snapshot = catalog.refresh()?;
            ReportFormatter::new().print_catalog(catalog.source(), &snapshot);
        }

        Commands::History { ledger, format } => {
            let overrides = Overrides {
                ledger,
                ..Overrides::default()
            };
            let config = load_config(cli.config.as_ref(), &overrides)?;
            if config.ledger == LedgerMode::Memory {
                return Err(anyhow!(
                    "the in-memory ledger keeps no history; pass --ledger <file>"
                ));
            }
            let events = config.ledger.open()?.events()?;
            match format {
                Some(format) => println!("{}", format.serialize(&events)?),
                None => ReportFormatter::new().print_history(&events),
            }
        }

        Commands::Credentials { location, instance } => {
            let config = load_config(cli.config.as_ref(), &Overrides::default())?;
            let catalog = JsonInstanceCatalog::new(&location)?;
            let snapshot = catalog.refresh()?;
            let found = snapshot
                .instances
                .get(&instance)
                .ok_or_else(|| anyhow!("instance {} not found in {}", instance, catalog.source()))?;
            let resolved = credentials::resolve(&found.login(), &config.global_ssh());
            ReportFormatter::new().print_credentials(&instance, &resolved);
        }
    }

    Ok(())
}
