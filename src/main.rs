#![deny(
    warnings,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo
)]
#![allow(clippy::multiple_crate_versions)]

use anyhow::{Context, Result};
use clap::Parser;
use healthkit2sqlite::archive::ExportInput;
use healthkit2sqlite::database::SqliteStore;
use healthkit2sqlite::progress::ProgressReporter;
use healthkit2sqlite::types::Progress;
use healthkit2sqlite::{cli, convert, utils};
use std::time::Instant;

#[macro_use]
extern crate healthkit2sqlite;

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    utils::init_logging(cli.verbose, cli.quiet);

    let started = Instant::now();
    let input = ExportInput::open(&cli.export, cli.xml)
        .with_context(|| format!("opening export: {}", cli.export.display()))?;
    dlog!(
        "mode=convert export={:?} db={}",
        input,
        cli.db_path.display()
    );

    let total = input.size().context("reading export size")?;
    let mut store = SqliteStore::open(&cli.db_path)
        .with_context(|| format!("opening database: {}", cli.db_path.display()))?;

    let reporter = ProgressReporter::new(total, cli.silent);
    let mut on_progress = |p: Progress| reporter.update(p);
    let stats = convert::convert_export(&input, &mut store, Some(&mut on_progress))
        .with_context(|| format!("converting {}", cli.export.display()))?;

    let elapsed = chrono::Duration::from_std(started.elapsed())
        .unwrap_or_else(|_| chrono::Duration::zero());
    tracing::info!(
        db = %cli.db_path.display(),
        records = stats.records,
        record_tables = stats.record_tables.len(),
        activity_summaries = stats.activity_summaries,
        workouts = stats.workouts,
        workout_points = stats.workout_points,
        elapsed = %utils::format_duration(elapsed),
        "export imported"
    );

    Ok(())
}
