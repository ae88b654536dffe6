//! Configuration view command: `placescout config`.

use std::path::Path;

use anyhow::Result;

use placescout::config::ServiceConfig;

use super::super::ConfigCommands;

const REDACTED: &str = "********";

pub fn cmd_config(
    config_path: &Path,
    config: &ServiceConfig,
    command: Option<ConfigCommands>,
) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No config file at {}; using defaults", config_path.display());
            }
            println!("# Effective values (with environment overrides):");
            println!();
            let mut shown = config.clone();
            if shown.campaign.relay_token.is_some() {
                shown.campaign.relay_token = Some(REDACTED.to_string());
            }
            print!("{}", toml::to_string_pretty(&shown)?);
        }
        Some(ConfigCommands::Init) => {
            print!("{}", toml::to_string_pretty(&ServiceConfig::default())?);
        }
    }
    Ok(())
}
