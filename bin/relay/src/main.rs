//! BTP relay binary.

use std::{path::PathBuf, sync::Mutex};

use clap::Parser;
use eyre::Result;
use tracing_subscriber::EnvFilter;

mod config;
mod factory;

use config::Config;

#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(about = "BTP relay - forwards verifiable messages between chains")]
struct Args {
    /// Path to config file
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Parser, Debug)]
enum Command {
    /// Print the relay version
    Version,
    /// Write the effective configuration to a file
    Save { path: PathBuf },
    /// Run the relay
    Start,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.cmd {
        Command::Version => {
            println!("relay version {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Save { path } => {
            let cfg = Config::load(&args.config)?;
            cfg.save(&path)?;
            println!("saved configuration to {}", path.display());
            Ok(())
        }
        Command::Start => {
            let cfg = Config::load(&args.config)?;
            init_logging(&cfg)?;

            tracing::info!(
                direction = %cfg.direction,
                src = %cfg.src.address,
                dst = %cfg.dst.address,
                "starting relay"
            );
            let relay = factory::build_relay(&cfg)?;
            relay.run().await?;
            Ok(())
        }
    }
}

fn init_logging(cfg: &Config) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match &cfg.log.filename {
        Some(filename) => {
            let file = std::fs::File::create(filename)?;
            builder.with_writer(Mutex::new(file)).with_ansi(false).init();
        }
        None => builder.init(),
    }
    Ok(())
}
