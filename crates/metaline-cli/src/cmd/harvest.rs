//! Harvest subcommand - run the full pipeline for one or all sources.

use anyhow::{Context, Result};
use clap::Args;
use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

use metaline_core::{SharedProgress, fmt_num};
use metaline_oai::FileState;

use crate::config::Config;
use crate::pipeline::{self, RunOptions, RunSummary};

#[derive(Args, Debug)]
pub struct HarvestArgs {
    /// Source to harvest (or use --all)
    #[arg(short, long)]
    pub source: Option<String>,

    /// Harvest every configured source
    #[arg(long)]
    pub all: bool,

    /// Start of the date window (YYYY-MM-DD or ISO seconds); defaults to the
    /// stored harvest position
    #[arg(long)]
    pub from: Option<String>,

    /// End of the date window
    #[arg(long)]
    pub until: Option<String>,

    /// Number of pool workers (0 = process synchronously)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Bound on the pending request queue
    #[arg(long)]
    pub queue: Option<usize>,
}

pub fn run(args: HarvestArgs, config: &Config, progress: &SharedProgress) -> Result<()> {
    let mut state = FileState::open(&config.state.path)?;

    let selected: Vec<(&String, &metaline_oai::SourceConfig)> = if args.all {
        config.sources.iter().collect()
    } else {
        let name = args
            .source
            .as_ref()
            .context("pass --source <name> or --all")?;
        let source = config
            .sources
            .get(name)
            .with_context(|| format!("source {name} is not configured"))?;
        vec![(name, source)]
    };
    anyhow::ensure!(!selected.is_empty(), "no sources configured");

    let opts = RunOptions {
        from: args.from.clone(),
        until: args.until.clone(),
        workers: args.workers.unwrap_or(config.workers.count),
        max_queue: args.queue.unwrap_or(config.workers.max_queue),
    };

    let mut failed = Vec::new();
    for (name, source) in selected {
        log::info!("Harvesting {name} from {}", source.url);
        match pipeline::run_source(name, source, config, &opts, &mut state, progress) {
            Ok(summary) => print_summary(name, &summary),
            Err(e) => {
                log::error!("{name}: {e:#}");
                failed.push(name.clone());
            }
        }
        if metaline_core::is_shutdown_requested() {
            log::warn!("shutdown requested, skipping remaining sources");
            break;
        }
    }

    if !failed.is_empty() {
        anyhow::bail!("{} source(s) failed: {}", failed.len(), failed.join(", "));
    }
    Ok(())
}

/// Print a per-source summary table on stderr.
fn print_summary(name: &str, summary: &RunSummary) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new(name).fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);
    table.add_row(vec!["Changed", &fmt_num(summary.changed)]);
    table.add_row(vec!["Deleted", &fmt_num(summary.deleted)]);
    table.add_row(vec!["Indexed", &fmt_num(summary.indexed)]);
    table.add_row(vec!["Pages", &fmt_num(summary.pages)]);
    table.add_row(vec![
        "Harvested through",
        summary.harvested_until.as_deref().unwrap_or("-"),
    ]);
    table.add_row(vec!["Time", &format!("{:.1}s", summary.elapsed.as_secs_f64())]);
    eprintln!("\n{table}");
}
