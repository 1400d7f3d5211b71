use anyhow::{Context, Result};
use clap::Parser;
use log::error;

use find_donors::{run, Config};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();

    let summary = run(&config)
        .inspect_err(|e| error!("❌ {} stage failed", e.stage()))
        .with_context(|| format!("processing {}", config.input.display()))?;

    println!(
        "✓ {} zip lines, {} date lines in {:.2}s",
        summary.stats.accepted,
        summary.date_lines,
        summary.elapsed.as_secs_f64()
    );

    Ok(())
}
