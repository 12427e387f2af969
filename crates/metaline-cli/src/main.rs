//! metaline - metadata harvesting and enrichment pipeline
//!
//! Incrementally harvests bibliographic records over OAI-PMH, enriches them
//! against SKOS vocabularies through a bounded worker pool, and writes flat
//! documents to the configured sink.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;
mod config;
mod pipeline;

use config::Config;

#[derive(Parser)]
#[command(name = "metaline")]
#[command(about = "Metadata harvesting and enrichment pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Config file path (default: ./metaline.toml or ~/.config/metaline/config.toml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Harvest records from configured OAI-PMH sources
    Harvest(cmd::harvest::HarvestArgs),
    /// List record identifiers from one source
    Identifiers(cmd::identifiers::IdentifiersArgs),
    /// Show current configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Progress context (TTY auto-detect)
    let progress = Arc::new(metaline_core::ProgressContext::new());

    // Logging:
    //   TTY:     quiet (warn) unless --debug  — status lines show activity
    //   non-TTY: info unless --debug          — logs are the only progress indicator
    let is_tty = progress.is_tty();
    let multi = if is_tty { Some(progress.multi()) } else { None };
    let quiet = if is_tty { !cli.debug } else { false };
    metaline_core::init_logging(quiet, cli.debug, multi);
    metaline_core::install_interrupt_handler();

    let config = if let Some(path) = cli.config {
        Config::from_file(&path)?
    } else {
        Config::load()?
    };

    match cli.command {
        Command::Harvest(args) => cmd::harvest::run(args, &config, &progress),
        Command::Identifiers(args) => cmd::identifiers::run(args, &config, &progress),
        Command::Config => {
            use comfy_table::{
                Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL,
            };

            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .apply_modifier(UTF8_ROUND_CORNERS)
                .set_header(vec![
                    Cell::new("Setting").fg(Color::Cyan),
                    Cell::new("Value").fg(Color::Cyan),
                ]);

            table.add_row(vec![
                "State file",
                &config.state.path.display().to_string(),
            ]);
            table.add_row(vec!["Output directory", &config.output.dir.display().to_string()]);
            table.add_row(vec![
                "Workers",
                &format!(
                    "{} (queue bound: {})",
                    config.workers.count, config.workers.max_queue
                ),
            ]);
            table.add_row(vec![
                "HTTP retries",
                &format!(
                    "{} tries, {}s apart",
                    config.http.max_tries, config.http.retry_wait_secs
                ),
            ]);
            table.add_row(vec!["User agent", &config.http.user_agent]);
            table.add_row(vec![
                "Enrichment base URL",
                if config.enrichment.base_url.is_empty() {
                    "not set"
                } else {
                    &config.enrichment.base_url
                },
            ]);
            table.add_row(vec![
                "Enrichment whitelist",
                &format!("{} prefixes", config.enrichment.url_prefix_whitelist.len()),
            ]);
            for (name, source) in &config.sources {
                table.add_row(vec![&format!("Source {name}"), &source.url]);
            }

            eprintln!("\n{table}");
            Ok(())
        }
    }
}
