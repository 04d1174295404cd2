//! `liveness`: inspect recurrence definitions and run liveness passes over a
//! JSON state file.

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use liveness_engine::recurrence::parse_hhmm;
use liveness_engine::window::{format_utc_offset, is_dst_active, parse_timezone, window_in};
use liveness_engine::{union, Engine, EngineConfig, EntityId, MemoryStore, Recurrence, StoreState};

#[derive(Parser)]
#[command(name = "liveness", version, about = "Session liveness reconciliation")]
struct Cli {
    /// Engine configuration file (TOML, YAML or JSON). `LIVENESS__*`
    /// environment variables override it.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a recurrence definition and print its canonical form
    Validate {
        /// Input file (reads stdin if omitted)
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
    /// List the occurrences of a recurrence definition between two dates
    Occurrences {
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// First date, inclusive (YYYY-MM-DD)
        #[arg(long)]
        from: NaiveDate,
        /// Last date, inclusive (YYYY-MM-DD)
        #[arg(long)]
        to: NaiveDate,
    },
    /// Compute the UTC active window of one occurrence
    Window {
        #[arg(long)]
        date: NaiveDate,
        /// Local start time (HH:MM)
        #[arg(long, value_parser = hhmm)]
        start: NaiveTime,
        /// Local end time (HH:MM)
        #[arg(long, value_parser = hhmm)]
        end: NaiveTime,
        /// IANA timezone, e.g. America/Chicago
        #[arg(long)]
        timezone: String,
        #[arg(long, default_value_t = 60)]
        before: i64,
        #[arg(long, default_value_t = 60)]
        after: i64,
    },
    /// Export each schedule rule as RFC 5545 DTSTART/RRULE lines
    Rrule {
        #[arg(short, long)]
        input: Option<PathBuf>,
        #[arg(long)]
        timezone: String,
        /// Date the first exported occurrence is on or after
        #[arg(long)]
        from: NaiveDate,
    },
    /// Run one periodic pass (reconcile, then provision) over a state file
    Run {
        #[arg(long)]
        state: PathBuf,
        /// Wall-clock time of the tick (RFC 3339); defaults to now
        #[arg(long)]
        now: Option<DateTime<Utc>>,
        /// Print the summary without writing the state file back
        #[arg(long)]
        dry_run: bool,
    },
    /// Reconcile a single entity at an exact instant, as an event hook would
    Reconcile {
        #[arg(long)]
        state: PathBuf,
        #[arg(long)]
        entity: EntityId,
        #[arg(long)]
        now: Option<DateTime<Utc>>,
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Serialize)]
struct WindowReport {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    occurrence_start: DateTime<Utc>,
    occurrence_end: DateTime<Utc>,
    utc_offset_at_start: String,
    dst_at_start: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { input } => {
            let recurrence = read_recurrence(input.as_deref())?;
            println!("{}", recurrence.to_definition().to_json());
        }
        Command::Occurrences { input, from, to } => {
            if from > to {
                bail!("--from {from} is after --to {to}");
            }
            let recurrence = read_recurrence(input.as_deref())?;
            let dates = union(recurrence.schedules(), from, to);
            println!("{}", serde_json::to_string_pretty(&dates)?);
        }
        Command::Window {
            date,
            start,
            end,
            timezone,
            before,
            after,
        } => {
            let tz = parse_timezone(&timezone)?;
            let w = window_in(date, start, end, tz, before, after)?;
            let report = WindowReport {
                start: w.start,
                end: w.end,
                occurrence_start: w.occurrence_start,
                occurrence_end: w.occurrence_end,
                utc_offset_at_start: format_utc_offset(w.occurrence_start, tz),
                dst_at_start: is_dst_active(w.occurrence_start, tz),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Rrule {
            input,
            timezone,
            from,
        } => {
            parse_timezone(&timezone)?;
            let recurrence = read_recurrence(input.as_deref())?;
            let rules: Vec<String> = recurrence
                .schedules()
                .iter()
                .map(|s| s.to_rrule(&timezone, from))
                .collect();
            println!("{}", rules.join("\n\n"));
        }
        Command::Run {
            state,
            now,
            dry_run,
        } => {
            let engine = Engine::new(load_state(&state)?, load_config(cli.config.as_deref())?)?;
            let summary = engine.run_periodic(now.unwrap_or_else(Utc::now))?;
            if !dry_run {
                save_state(&state, engine.store())?;
            }
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Reconcile {
            state,
            entity,
            now,
            dry_run,
        } => {
            let engine = Engine::new(load_state(&state)?, load_config(cli.config.as_deref())?)?;
            let rec = engine.reconcile_entity(entity, now.unwrap_or_else(Utc::now))?;
            if !dry_run && !rec.is_noop() {
                save_state(&state, engine.store())?;
            }
            println!("{}", serde_json::to_string_pretty(&rec)?);
        }
    }

    Ok(())
}

fn hhmm(s: &str) -> Result<NaiveTime, String> {
    parse_hhmm(s).ok_or_else(|| format!("expected HH:MM, got {s:?}"))
}

fn read_input(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => {
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
        }
        None => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("reading stdin")?;
            Ok(buf)
        }
    }
}

fn read_recurrence(path: Option<&Path>) -> Result<Recurrence> {
    let text = read_input(path)?;
    Ok(Recurrence::from_json(&text)?)
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    EngineConfig::load(path).context("loading engine configuration")
}

fn load_state(path: &Path) -> Result<MemoryStore> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let state: StoreState =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    info!(
        entities = state.entities.len(),
        occurrences = state.occurrences.len(),
        "loaded state"
    );
    Ok(MemoryStore::from_state(state))
}

fn save_state(path: &Path, store: &MemoryStore) -> Result<()> {
    let json = serde_json::to_string_pretty(&store.to_state()?)?;
    fs::write(path, json).with_context(|| format!("writing {}", path.display()))
}
