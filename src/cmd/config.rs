//! Configuration view and initialization (`testforge config`).

use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::ConfigCommands;
use testforge::config::{self, Config};

pub fn cmd_config(path: Option<&Path>, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(config::default_path);

    match command {
        None | Some(ConfigCommands::Show) => {
            let mut config = if config_path.exists() {
                println!("# Config file: {}", config_path.display());
                Config::load(&config_path)?
            } else {
                println!(
                    "# No config file at {}; showing defaults",
                    config_path.display()
                );
                Config::default()
            };
            config.apply_env();
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", rendered);

            let problems = config.validate();
            if problems.is_empty() {
                println!("# Configuration is valid");
            } else {
                for problem in &problems {
                    println!("# warning: {}", problem);
                }
            }
        }
        Some(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    config_path.display()
                );
            }
            Config::default().save(&config_path)?;
            println!("Created {}", config_path.display());
        }
    }
    Ok(())
}
