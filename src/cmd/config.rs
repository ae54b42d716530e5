//! Configuration view and validation commands (`draftsave config`).

use anyhow::Result;
use std::path::{Path, PathBuf};

use draftsave::config::{CONFIG_FILE_NAME, DraftsaveToml, ENDPOINT_ENV};

use super::super::ConfigCommands;

fn print_settings(toml: &DraftsaveToml) {
    println!("[autosave]");
    println!("  endpoint_base = \"{}\"", toml.autosave.endpoint_base);
    println!("  save_interval_ms = {}", toml.autosave.save_interval_ms);
    println!("  max_retries = {}", toml.autosave.max_retries);
    println!("  retry_delay_ms = {}", toml.autosave.retry_delay_ms);
    println!("  enabled = {}", toml.autosave.enabled);
    if let Some(ms) = toml.autosave.request_timeout_ms {
        println!("  request_timeout_ms = {}", ms);
    }
    println!();
    println!("[auth]");
    println!("  token_env = \"{}\"", toml.auth.token_env);
    println!();
    println!("[logging]");
    println!("  json = {}", toml.logging.json);
    println!("  filter = \"{}\"", toml.logging.filter);
    println!();
}

pub fn cmd_config(
    working_dir: &Path,
    explicit: Option<&Path>,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let found: Option<PathBuf> = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => DraftsaveToml::locate(working_dir),
    };

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Draftsave Configuration");
            println!("=======================");
            println!();

            let toml = match &found {
                Some(path) => {
                    println!("Config file: {}", path.display());
                    println!();
                    DraftsaveToml::load(path)?
                }
                None => {
                    println!("No {} found. Using default configuration:", CONFIG_FILE_NAME);
                    println!();
                    DraftsaveToml::default()
                }
            };
            print_settings(&toml);

            println!("Effective values (with env overrides):");
            println!("  endpoint_base = \"{}\"", toml.endpoint_base());
            if std::env::var(ENDPOINT_ENV).is_ok_and(|v| !v.trim().is_empty()) {
                println!("  (from {})", ENDPOINT_ENV);
            }
            let token_set = std::env::var(&toml.auth.token_env).is_ok_and(|v| !v.is_empty());
            println!(
                "  token = {}",
                if token_set { "set" } else { "not set" }
            );
            println!();
            if found.is_none() {
                println!("Run 'draftsave config init' to create a {} file.", CONFIG_FILE_NAME);
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let Some(path) = &found else {
                println!("No {} found. Using defaults (valid).", CONFIG_FILE_NAME);
                return Ok(());
            };

            let toml = DraftsaveToml::load(path)?;
            let warnings = toml.validate();

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
            let config_path = explicit
                .map(Path::to_path_buf)
                .unwrap_or_else(|| working_dir.join(CONFIG_FILE_NAME));
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE_NAME, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }

            let toml = DraftsaveToml::default();
            toml.save(&config_path)?;

            println!("Created {} at {}", CONFIG_FILE_NAME, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [autosave] endpoint_base, save_interval_ms, max_retries, retry_delay_ms");
            println!("  - [auth] token_env");
            println!("  - [logging] json, filter");
            println!();
        }
    }

    Ok(())
}
