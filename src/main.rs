use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fwscope::cli::{Commands, FwScopeCli};

#[derive(Parser)]
#[command(name = "fwscope")]
#[command(about = "Firmware image analysis: identify, extract and scan embedded filesystems")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // stdout carries command output; logs go to stderr
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fwscope=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut fwscope_cli = FwScopeCli::new()?;

    match cli.command {
        Some(command) => fwscope_cli.handle_command(command).await,
        None => fwscope_cli.show_intro_and_help().await,
    }
}
