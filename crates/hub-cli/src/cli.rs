use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use playback_hub::{HubConfig, HubConfigFile};

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("HUB_BUILD"), ")");

#[derive(Parser, Debug)]
#[command(name = "hub-cli", version = VERSION)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// TOML file with hub settings
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Minimum spacing between accepted consumer syncs, in milliseconds
    #[arg(long)]
    pub throttle_ms: Option<u64>,

    /// Wait bound for queries answered by the playback executor, in milliseconds
    #[arg(long)]
    pub call_timeout_ms: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Drive a simulated player with simulated consumers and print the result
    Demo {
        /// Consumer id to attach (repeatable)
        #[arg(long = "consumer", default_value = "watch.face")]
        consumers: Vec<String>,

        /// Pretend the host is in an external takeover context
        #[arg(long)]
        takeover: bool,
    },

    /// Report whether consumer ids match the takeover denylist
    Classify {
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

impl Args {
    /// File config (if any) with command-line overrides applied.
    pub fn hub_config(&self) -> Result<HubConfig> {
        let file = match &self.config {
            Some(path) => HubConfigFile::load(path)?,
            None => HubConfigFile::default(),
        };
        let mut config = file.resolve();
        if let Some(ms) = self.throttle_ms {
            config.sync_throttle = Duration::from_millis(ms);
        }
        if let Some(ms) = self.call_timeout_ms {
            config.call_timeout = Duration::from_millis(ms);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from([
            "hub-cli",
            "--throttle-ms",
            "50",
            "--call-timeout-ms",
            "750",
            "demo",
            "--consumer",
            "a",
            "--consumer",
            "auto.b",
        ]);
        let config = args.hub_config().unwrap();
        assert_eq!(config.sync_throttle, Duration::from_millis(50));
        assert_eq!(config.call_timeout, Duration::from_millis(750));
        match args.cmd {
            Command::Demo {
                consumers,
                takeover,
            } => {
                assert_eq!(consumers, vec!["a".to_string(), "auto.b".to_string()]);
                assert!(!takeover);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn classify_requires_ids() {
        assert!(Args::try_parse_from(["hub-cli", "classify"]).is_err());
    }
}
