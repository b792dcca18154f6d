//! `hub-cli`: drive the playback hub from the command line.
//!
//! - `demo`: run a scripted session against a simulated player and print the
//!   resulting player state, sync outcomes and registry stats as JSON.
//! - `classify`: check consumer ids against the takeover denylist.

mod cli;
mod demo;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use playback_hub::sim::{SimulatedPlayer, SimulatedPlayerStats};
use playback_hub::{EnvironmentFlag, PlaybackHub, is_takeover_id};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,playback_hub=info,hub_cli=info")
        }))
        .init();
    let config = args.hub_config()?;

    match &args.cmd {
        cli::Command::Classify { ids } => {
            for id in ids {
                let takeover = is_takeover_id(id, &config.takeover_patterns);
                println!("{id}\t{}", if takeover { "takeover" } else { "regular" });
            }
        }
        cli::Command::Demo {
            consumers,
            takeover,
        } => {
            let environment = EnvironmentFlag::new();
            environment.set(*takeover);
            let stats = SimulatedPlayerStats::shared();
            let hub = Arc::new(
                PlaybackHub::builder(SimulatedPlayer::factory(stats.clone()))
                    .config(config)
                    .surface(Arc::new(demo::LogSurface))
                    .environment(environment)
                    .build()
                    .context("start playback hub")?,
            );

            let hub_for_signal = hub.clone();
            let _ = ctrlc::set_handler(move || {
                hub_for_signal.shutdown();
                std::process::exit(130);
            });

            let report = demo::run(&hub, consumers)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("encode demo report")?
            );
            hub.shutdown();
            tracing::info!(
                constructed = SimulatedPlayerStats::count(&stats.constructed),
                mutations = SimulatedPlayerStats::count(&stats.mutations),
                foreign_mutations = SimulatedPlayerStats::count(&stats.foreign_mutations),
                "demo finished"
            );
        }
    }

    Ok(())
}
