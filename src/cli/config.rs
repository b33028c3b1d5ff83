use anyhow::{Result, anyhow};
use home::home_dir;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cli::FwScopeCli;
use crate::config::Config;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ConfigData {
    pub settings: BTreeMap<String, String>,
}

/// Persistent overrides kept in `~/.fwscope/config.json`.
pub struct ConfigStore {
    store_path: PathBuf,
}

impl ConfigStore {
    pub fn new() -> Result<Self> {
        let home = home_dir().ok_or_else(|| anyhow!("Could not find home directory"))?;
        Self::in_dir(&home.join(".fwscope"))
    }

    pub fn in_dir(dir: &Path) -> Result<Self> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }

        Ok(Self {
            store_path: dir.join("config.json"),
        })
    }

    pub fn load_config(&self) -> Result<ConfigData> {
        if !self.store_path.exists() {
            return Ok(ConfigData::default());
        }

        let content = fs::read_to_string(&self.store_path)?;
        let config: ConfigData = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save_config(&self, config: &ConfigData) -> Result<()> {
        let json = serde_json::to_string_pretty(config)?;
        fs::write(&self.store_path, json)?;
        Ok(())
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let config = self.load_config()?;
        Ok(config.settings.get(key).cloned())
    }

    /// Stores `key`, refusing keys or values the engine config would reject.
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        Config::default().apply_setting(key, value)?;

        let mut config = self.load_config()?;
        config.settings.insert(key.to_string(), value.to_string());
        self.save_config(&config)
    }

    /// Layers the stored settings over `config`.
    pub fn apply_to(&self, config: &mut Config) -> Result<()> {
        for (key, value) in &self.load_config()?.settings {
            config.apply_setting(key, value)?;
        }
        Ok(())
    }
}

#[derive(clap::Subcommand)]
pub enum ConfigCommands {
    /// Show one stored setting
    Get { key: String },
    /// Store a setting (work_root, extract_mode, privilege_helper, retention,
    /// tool_timeout_secs, max_scan_file_bytes, max_kernel_scan_files, tool.<name>)
    Set { key: String, value: String },
    /// Show stored settings and the effective configuration
    List,
}

impl FwScopeCli {
    pub fn handle_config_command(&mut self, command: ConfigCommands) -> Result<()> {
        match command {
            ConfigCommands::Get { key } => {
                if let Some(value) = self.config_store.get_setting(&key)? {
                    println!("{}: {}", key, value);
                } else {
                    println!("Configuration key '{}' not set", key);
                }
            }
            ConfigCommands::Set { key, value } => {
                self.config_store.set_setting(&key, &value)?;
                println!("✅ Set {} to: {}", key, value);
            }
            ConfigCommands::List => {
                let stored = self.config_store.load_config()?;
                if !stored.settings.is_empty() {
                    println!("📋 Stored settings:");
                    for (key, value) in &stored.settings {
                        println!("  {}: {}", key, value);
                    }
                    println!();
                }

                let config = self.engine_config()?;
                println!("⚙️  Effective configuration:");
                println!("  work_root: {}", config.work_root.display());
                println!("  extract_mode: {:?}", config.extract_mode);
                println!(
                    "  privilege_helper: {}",
                    config.privilege_helper.as_deref().unwrap_or("(none)")
                );
                println!("  retention: {:?}", config.retention);
                match config.tool_timeout_secs {
                    Some(secs) => println!("  tool_timeout_secs: {}", secs),
                    None => println!("  tool_timeout_secs: disabled"),
                }
                println!("  max_scan_file_bytes: {}", config.max_scan_file_bytes);
                println!("  max_kernel_scan_files: {}", config.max_kernel_scan_files);
                let mut tools: Vec<_> = config.tool_paths.iter().collect();
                tools.sort();
                for (name, path) in tools {
                    println!("  tool.{}: {}", name, path.display());
                }
            }
        }
        Ok(())
    }
}
