use std::path::PathBuf;

use clap::Parser;
use vigil_core::{IdentityOverrides, SettingsLoader};

#[derive(Parser, Debug, Clone)]
#[command(name = "vigil-agent")]
#[command(about = "Vigil monitoring agent - keepalives, subscriptions and checks")]
#[command(version = vigil_core::VERSION)]
pub struct Cli {
    /// Main JSON configuration file
    #[arg(long = "config-file", default_value = "config.json")]
    pub config_file: PathBuf,

    /// Comma separated directories of JSON snippets merged over the config file
    #[arg(long = "config-dir", default_value = "conf.d")]
    pub config_dir: String,

    /// Buffer check results in this file while the broker rejects them
    #[arg(long = "stat-store")]
    pub stat_store: Option<PathBuf>,

    /// Report under this client name instead of the configured one
    #[arg(long)]
    pub hostname: Option<String>,

    /// Report this client address instead of the configured one
    #[arg(long)]
    pub address: Option<String>,

    /// Log nothing
    #[arg(long, short)]
    pub quiet: bool,
}

impl Cli {
    pub fn loader(&self) -> SettingsLoader {
        SettingsLoader::new(
            self.config_file.clone(),
            SettingsLoader::parse_dirs(&self.config_dir),
        )
        .with_overrides(IdentityOverrides {
            hostname: self.hostname.clone(),
            address: self.address.clone(),
        })
    }
}
