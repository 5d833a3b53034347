#![forbid(unsafe_code)]

use chrono::{DateTime, NaiveDateTime, Utc};
use error_iter::ErrorIter as _;
use is_terminal::IsTerminal as _;
use onlyargs::CliError;
use onlyargs_derive::OnlyArgs;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::{env, process::ExitCode};
use taxpot::accounting::{AccountingPot, ModuleSettingsRegistry, RunSettings};
use taxpot::errors::{PriceTableError, ProcessError, SettingsError};
use taxpot::model::{AccountingEvent, Asset, PriceTable};
use thiserror::Error;
use tracing::debug;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;

#[derive(Debug, OnlyArgs)]
#[footer = "Environment variables:"]
#[footer = "  - RUST_LOG configures log filtering. E.g. RUST_LOG=debug"]
#[footer = "      https://docs.rs/tracing-subscriber/latest/tracing_subscriber/struct.EnvFilter.html#directives"]
#[footer = "  - TERM_COLOR accepts \"always\" to override automatic terminal sensing"]
struct Args {
    /// Read accounting events JSON from a file.
    ///   Multiple files are concatenated in order; the combined stream
    ///   must be sorted by timestamp.
    #[long]
    input_events: Vec<PathBuf>,

    /// Read the historical price table RON from a file.
    #[long]
    input_prices: PathBuf,

    /// Profit currency all PnL and cost basis is denominated in.
    ///   Default is "USD".
    #[short('c')]
    currency: Option<String>,

    /// Start of the tax period, as "YYYY-MM-DD HH:MM:SS" UTC.
    ///   Earlier events establish cost basis without contributing PnL.
    start: Option<String>,

    /// End of the tax period, as "YYYY-MM-DD HH:MM:SS" UTC.
    ///   Default is now. Later events are skipped.
    end: Option<String>,
}

#[derive(Debug, Error)]
enum Error {
    #[error("CLI argument error")]
    Args(#[from] CliError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("Error reading events from {0:?}")]
    Events(PathBuf, #[source] serde_json::Error),

    #[error("Error loading price table from {0:?}")]
    Prices(PathBuf, #[source] PriceTableError),

    #[error("Date parse error")]
    Date(#[from] chrono::ParseError),

    #[error("Module settings error")]
    Settings(#[from] SettingsError),

    #[error("Accounting error")]
    Process(#[from] ProcessError),
}

fn main() -> ExitCode {
    // Initialize the tracing subscriber for instrumentation.
    // Uses the `RUST_LOG` environment var for configuration. E.g. `RUST_LOG=debug cargo run`
    //
    // See: https://docs.rs/tracing-subscriber/latest/tracing_subscriber/struct.EnvFilter.html#directives
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let term_color = env::var("TERM_COLOR")
        .map(|color| color == "always")
        .unwrap_or_else(|_| std::io::stdout().is_terminal());
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_ansi(term_color))
        .with(env_filter)
        .init();

    match run(onlyargs::parse()) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            for source in err.sources().skip(1) {
                eprintln!("  Caused by: {source}");
            }

            ExitCode::FAILURE
        }
    }
}

fn run(args: Result<Args, CliError>) -> Result<(), Error> {
    let args = args?;

    let prices = PriceTable::load(&args.input_prices)
        .map_err(|err| Error::Prices(args.input_prices.clone(), err))?;

    let mut events = Vec::new();
    for path in &args.input_events {
        debug!("Loading events from {path:?}");

        let file = File::open(path)?;
        let batch: Vec<AccountingEvent> = serde_json::from_reader(BufReader::new(file))
            .map_err(|err| Error::Events(path.clone(), err))?;
        events.extend(batch);
    }

    let query_start = args
        .start
        .as_deref()
        .map(parse_datetime)
        .transpose()?
        .unwrap_or(DateTime::UNIX_EPOCH);
    let query_end = args
        .end
        .as_deref()
        .map(parse_datetime)
        .transpose()?
        .unwrap_or_else(Utc::now);
    let currency = args.currency.as_deref().unwrap_or("USD");

    let settings = RunSettings::new(Asset::from(currency), query_start, query_end);
    let registry = ModuleSettingsRegistry::with_defaults();
    let mut pot = AccountingPot::new(settings, &registry, &prices)?;
    pot.process(events)?;

    print_report(&pot);

    Ok(())
}

fn parse_datetime(datetime: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(NaiveDateTime::parse_from_str(datetime, "%F %T")?.and_utc())
}

fn print_report(pot: &AccountingPot<'_>) {
    let currency = &pot.settings().profit_currency;

    println!("PnL Overview ({currency})");
    println!("=== ========");
    let overview = pot.pnls().overview();
    if overview.is_empty() {
        println!("No realized PnL in the query period.");
    }
    for (label, pnl) in &overview {
        println!(
            "{label:<20} taxable {taxable:>18}  free {free:>18}",
            taxable = pnl.taxable,
            free = pnl.free,
        );
    }

    println!();
    println!("Per-category breakdown");
    println!("============ =========");
    let categories: BTreeMap<_, _> = pot.pnls().iter().collect();
    for (category, pnl) in categories {
        println!(
            "{category:<20} taxable {taxable:>18}  free {free:>18}",
            category = category.to_string(),
            taxable = pnl.taxable,
            free = pnl.free,
        );
    }

    println!();
    println!("Cost basis ({currency})");
    println!("==== =====");
    let mut assets: Vec<_> = pot.cost_basis().assets().collect();
    assets.sort();
    for asset in assets {
        println!("{asset}: {balance}", balance = pot.cost_basis().balance(asset));
        for lot in pot.cost_basis().lots(asset) {
            println!(
                "  {amount} @ {unit_cost}, acquired {acquired}",
                amount = lot.amount,
                unit_cost = lot.unit_cost,
                acquired = lot.acquired_at.format("%F %T"),
            );
        }
    }

    if !pot.warnings().is_empty() {
        println!();
        println!("Warnings");
        println!("========");
        for warning in pot.warnings() {
            println!("❌ {warning}");
            for source in warning.sources().skip(1) {
                println!("     Caused by {source}");
            }
        }
    }
}
