//! Identifiers subcommand - list record identifiers from one source.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;

use metaline_core::{Fetcher, SharedProgress, fmt_num};
use metaline_oai::{Harvester, HttpBackend};

use crate::config::Config;

#[derive(Args, Debug)]
pub struct IdentifiersArgs {
    /// Source to list
    pub source: String,

    /// Start of the date window (YYYY-MM-DD or ISO seconds)
    #[arg(long)]
    pub from: Option<String>,

    /// End of the date window
    #[arg(long)]
    pub until: Option<String>,
}

pub fn run(args: IdentifiersArgs, config: &Config, progress: &SharedProgress) -> Result<()> {
    let source = config
        .sources
        .get(&args.source)
        .with_context(|| format!("source {} is not configured", args.source))?;

    let fetcher = Fetcher::new(
        config.http.max_tries,
        Duration::from_secs(config.http.retry_wait_secs),
        config.http.user_agent.as_str(),
    )
    .with_trace_log(source.debug_log.clone());
    let backend = HttpBackend::new(&source.url, &fetcher);
    let mut harvester = Harvester::new(args.source.clone(), source, &backend)?;

    let pb = progress.stage_line(&args.source);
    let mut count: u64 = 0;
    let summary = harvester.list_identifiers(
        args.from.as_deref(),
        args.until.as_deref(),
        &mut |envelope| {
            if envelope.deleted {
                println!("{}\t{}\tdeleted", envelope.source, envelope.id);
            } else {
                println!("{}\t{}", envelope.source, envelope.id);
            }
            count += 1;
            pb.set_message(format!("{count} identifiers"));
            Ok(0)
        },
    )?;
    pb.finish_and_clear();

    log::info!(
        "{}: {} identifiers ({} deleted) across {} pages",
        args.source,
        fmt_num(count),
        fmt_num(summary.deleted),
        fmt_num(summary.pages)
    );
    Ok(())
}
