//! relaymq – the broker daemon.
//
//  $ relaymq start --config relaymq.toml
//  $ relaymq check --config relaymq.toml
use relaymq::config::DEFAULT_CONFIG_PATH;
use relaymq::logging::init_logging;
use relaymq::{load_config, start_broker, Config};

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "relaymq", version, about = "RelayMQ message broker")]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the broker daemon.
    Start {
        /// Path to config TOML (env RELAYMQ_CONFIG overrides)
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: String,
    },
    /// Validate a configuration file and print the effective settings.
    Check {
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Command::Start { config } => {
            let cfg = load(config)?;
            init_logging(&cfg.logging)?;
            tracing::info!(bind_addr = %cfg.server.bind_addr, "starting relaymq");
            start_broker(cfg).await?;
        }
        Command::Check { config } => {
            let cfg = load(config)?;
            println!("{cfg:#?}");
        }
    }
    Ok(())
}

fn load(config: String) -> anyhow::Result<Config> {
    let cfg_path: String = std::env::var("RELAYMQ_CONFIG").unwrap_or(config);
    Ok(load_config(&cfg_path)?)
}
