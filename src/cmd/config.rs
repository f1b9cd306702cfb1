//! Configuration view and initialization commands: `adw config`.

use anyhow::{Context, Result};

use adw::config::{AdwConfig, CONFIG_DIR, CONFIG_FILE};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    let config_dir = project_dir.join(CONFIG_DIR);
    let config_path = config_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found at {}", CONFIG_FILE, config_path.display());
                println!("Using defaults. Run 'adw config init' to create one.");
            }
            println!();

            // Effective values include ADW_* environment overrides.
            let config = AdwConfig::load(project_dir)?;
            println!("{}", config.to_toml()?);

            let warnings = config.validate();
            if !warnings.is_empty() {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
                println!();
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&config_dir)
                .with_context(|| format!("Failed to create {}", config_dir.display()))?;
            std::fs::write(&config_path, AdwConfig::default().to_toml()?)
                .with_context(|| format!("Failed to write {}", config_path.display()))?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [paths] state_dir, trees_dir");
            println!("  - [ports] backend_start, frontend_start, pool_size");
            println!("  - [retry] retry counts and loop detection");
            println!("  - [executor] the phase command");
            println!();
        }
    }

    Ok(())
}
