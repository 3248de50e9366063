//! Configuration view and validation commands: `cowork config`.

use anyhow::Result;
use std::path::Path;

use cowork::config::{CONFIG_DIR, CONFIG_FILE, CliOverrides, CoworkConfig, CoworkToml};

use super::super::ConfigCommands;

pub fn cmd_config(
    project_dir: &Path,
    overrides: &CliOverrides,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let cowork_dir = project_dir.join(CONFIG_DIR);
    let config_path = overrides
        .config_path
        .clone()
        .unwrap_or_else(|| cowork_dir.join(CONFIG_FILE));

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Cowork Configuration");
            println!("====================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No cowork.toml found at {} (using defaults)", config_path.display());
            }
            println!();

            let config = CoworkConfig::load(project_dir, overrides)?;
            let toml = &config.toml;
            println!("[lease]");
            println!("  ttl_secs = {}", toml.lease.ttl_secs);
            println!("  watchdog_interval_secs = {}", toml.lease.watchdog_interval_secs);
            println!();
            println!("[github]");
            println!("  api_url = \"{}\"", toml.github.api_url);
            println!("  token_env = \"{}\"", toml.github.token_env);
            println!();
            println!("[defaults]");
            println!("  base_branch = \"{}\"", toml.defaults.base_branch);
            println!("  sync_strategy = \"{}\"", toml.defaults.sync_strategy);
            println!("  max_retries = {}", toml.defaults.max_retries);
            println!("  timeout_minutes = {}", toml.defaults.timeout_minutes);
            println!("  draft_pr = {}", toml.defaults.draft_pr);
            println!();

            println!("Effective values (with env/CLI overrides):");
            println!("  data_dir = \"{}\"", config.data_dir.display());
            println!("  workspace_root = \"{}\"", config.workspace_root.display());
            println!("  lease_ttl = {}s", config.lease_ttl.as_secs());
            println!("  holder_id = \"{}\"", config.holder_id);
            println!("  log_level = \"{}\"", config.log.level);
            println!(
                "  github_token = {}",
                if config.github_token().is_some() { "set" } else { "not set" }
            );
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let config = CoworkConfig::load(project_dir, overrides)?;
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("cowork.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            if let Some(parent) = config_path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            CoworkToml::default().save(&config_path)?;

            println!("Created cowork.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [lease] ttl_secs, watchdog_interval_secs, holder_id");
            println!("  - [github] api_url, token_env");
            println!("  - [defaults] base_branch, sync_strategy, draft_pr");
            println!();
        }
    }

    Ok(())
}
