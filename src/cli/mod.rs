use anyhow::Result;
use clap::Subcommand;

mod analyze;
mod config;
mod shell;

pub use config::{ConfigCommands, ConfigData, ConfigStore};
pub use shell::Session;

use crate::config::Config;

#[derive(Subcommand)]
pub enum Commands {
    /// Identify the filesystem type of a firmware image
    Identify { file: String },
    /// Mount or unpack an image and leave the result in place
    Extract { file: String },
    /// Print the directory tree of an image
    Tree { file: String },
    /// Find the Linux kernel version inside an image
    Kernel { file: String },
    /// Look for command-injection patterns inside an image
    Injections { file: String },
    /// Run every scan and print a combined report
    Analyze {
        file: String,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Interactive session over one image at a time
    Shell,
}

pub struct FwScopeCli {
    config_store: ConfigStore,
}

impl FwScopeCli {
    pub fn new() -> Result<Self> {
        Ok(Self {
            config_store: ConfigStore::new()?,
        })
    }

    /// Environment configuration with the stored overrides applied on top.
    pub fn engine_config(&self) -> Result<Config> {
        let mut config = Config::from_env()?;
        self.config_store.apply_to(&mut config)?;
        Ok(config)
    }

    pub async fn show_intro_and_help(&self) -> Result<()> {
        self.print_ascii_intro();
        self.print_help();
        Ok(())
    }

    pub async fn handle_command(&mut self, command: Commands) -> Result<()> {
        match command {
            Commands::Identify { file } => self.handle_identify_command(&file),
            Commands::Extract { file } => self.handle_extract_command(&file).await,
            Commands::Tree { file } => self.handle_tree_command(&file).await,
            Commands::Kernel { file } => self.handle_kernel_command(&file).await,
            Commands::Injections { file } => self.handle_injections_command(&file).await,
            Commands::Analyze { file, json } => self.handle_analyze_command(&file, json).await,
            Commands::Config { command } => self.handle_config_command(command),
            Commands::Shell => shell::run(self.engine_config()?).await,
        }
    }

    fn print_ascii_intro(&self) {
        println!(
            r#"
     __
    / _|_      _____  ___ ___  _ __   ___
   | |_\ \ /\ / / __|/ __/ _ \| '_ \ / _ \
   |  _|\ V  V /\__ \ (_| (_) | |_) |  __/
   |_|   \_/\_/ |___/\___\___/| .__/ \___|
                              |_|
    🔬 Firmware Image Analysis
        "#
        );
    }

    fn print_help(&self) {
        println!("Available Commands:");
        println!();
        println!("🔍 Analysis:");
        println!("  fwscope identify <image>     - Identify the filesystem type");
        println!("  fwscope extract <image>      - Mount or unpack and keep the result");
        println!("  fwscope tree <image>         - Print the extracted directory tree");
        println!("  fwscope kernel <image>       - Find the kernel version");
        println!("  fwscope injections <image>   - Find command injection candidates");
        println!("  fwscope analyze <image> [--json] - Run everything");
        println!("  fwscope shell                - Interactive session");
        println!();
        println!("⚙️  Configuration:");
        println!("  fwscope config get <key>       - Get a stored setting");
        println!("  fwscope config set <key> <val> - Store a setting");
        println!("  fwscope config list            - List stored and effective settings");
        println!();
        println!("💡 Tip: mounting needs root; 'fwscope config set extract_mode unpack' avoids it.");
    }
}
