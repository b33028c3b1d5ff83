use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// How an image is turned into a browsable directory.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub enum ExtractMode {
    /// Loop-mount the formats the kernel can mount, unpack the rest.
    Auto,
    /// Only loop mounts.
    Mount,
    /// Only user-space unpackers, no privileges needed.
    Unpack,
}

impl std::str::FromStr for ExtractMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(ExtractMode::Auto),
            "mount" => Ok(ExtractMode::Mount),
            "unpack" | "extract" => Ok(ExtractMode::Unpack),
            _ => Err(anyhow::anyhow!("Invalid extract mode: {}", s)),
        }
    }
}

/// What happens to a working directory once its image is released.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub enum RetentionPolicy {
    Retain,
    Remove,
}

impl std::str::FromStr for RetentionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "retain" | "keep" => Ok(RetentionPolicy::Retain),
            "remove" | "delete" => Ok(RetentionPolicy::Remove),
            _ => Err(anyhow::anyhow!("Invalid retention policy: {}", s)),
        }
    }
}

/// External programs the extractors may run, by their lookup name.
pub const KNOWN_TOOLS: &[&str] = &[
    "unsquashfs",
    "jefferson",
    "unyaffs",
    "ubireader_extract_files",
    "cramfsck",
    "debugfs",
    "mount",
    "umount",
];

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub work_root: PathBuf,
    pub extract_mode: ExtractMode,
    pub privilege_helper: Option<String>,
    pub retention: RetentionPolicy,
    pub tool_timeout_secs: Option<u64>,
    pub max_scan_file_bytes: u64,
    pub max_kernel_scan_files: usize,
    pub tool_paths: HashMap<String, PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir().join("fwscope"),
            extract_mode: ExtractMode::Auto,
            privilege_helper: None,
            retention: RetentionPolicy::Retain,
            tool_timeout_secs: Some(600),
            max_scan_file_bytes: 8 * 1024 * 1024,
            max_kernel_scan_files: 20_000,
            tool_paths: HashMap::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key source; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(root) = lookup("FWSCOPE_WORK_ROOT") {
            config.work_root = PathBuf::from(root);
        }
        if let Some(mode) = lookup("FWSCOPE_EXTRACT_MODE") {
            config.extract_mode = mode.parse()?;
        }
        if let Some(helper) = lookup("FWSCOPE_PRIVILEGE_HELPER") {
            let helper = helper.trim();
            config.privilege_helper = (!helper.is_empty()).then(|| helper.to_string());
        }
        if let Some(retention) = lookup("FWSCOPE_RETENTION") {
            config.retention = retention.parse()?;
        }
        if let Some(timeout) = lookup("FWSCOPE_TOOL_TIMEOUT") {
            let secs: u64 = timeout
                .trim()
                .parse()
                .with_context(|| format!("FWSCOPE_TOOL_TIMEOUT is not a number: {}", timeout))?;
            config.tool_timeout_secs = (secs > 0).then_some(secs);
        }
        if let Some(bytes) = lookup("FWSCOPE_MAX_SCAN_BYTES") {
            config.max_scan_file_bytes = bytes
                .trim()
                .parse()
                .with_context(|| format!("FWSCOPE_MAX_SCAN_BYTES is not a number: {}", bytes))?;
        }
        if let Some(limit) = lookup("FWSCOPE_KERNEL_SCAN_LIMIT") {
            config.max_kernel_scan_files = limit
                .trim()
                .parse()
                .with_context(|| format!("FWSCOPE_KERNEL_SCAN_LIMIT is not a number: {}", limit))?;
        }

        for tool in KNOWN_TOOLS {
            let key = format!("FWSCOPE_TOOL_{}", tool.to_uppercase());
            if let Some(path) = lookup(&key) {
                config.tool_paths.insert(tool.to_string(), PathBuf::from(path));
            }
        }

        Ok(config)
    }

    /// Applies a single `key = value` override, as stored by the CLI config file.
    pub fn apply_setting(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "work_root" => self.work_root = PathBuf::from(value),
            "extract_mode" => self.extract_mode = value.parse()?,
            "privilege_helper" => {
                self.privilege_helper = (!value.is_empty()).then(|| value.to_string())
            }
            "retention" => self.retention = value.parse()?,
            "tool_timeout_secs" => {
                let secs: u64 = value.parse().context("tool_timeout_secs must be a number")?;
                self.tool_timeout_secs = (secs > 0).then_some(secs);
            }
            "max_scan_file_bytes" => {
                self.max_scan_file_bytes =
                    value.parse().context("max_scan_file_bytes must be a number")?
            }
            "max_kernel_scan_files" => {
                self.max_kernel_scan_files =
                    value.parse().context("max_kernel_scan_files must be a number")?
            }
            _ => match key.strip_prefix("tool.") {
                Some(tool) if KNOWN_TOOLS.contains(&tool) => {
                    self.tool_paths.insert(tool.to_string(), PathBuf::from(value));
                }
                _ => anyhow::bail!("Unknown configuration key: {}", key),
            },
        }
        Ok(())
    }
}
