#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tungo::{client, config, server};

#[derive(Parser)]
#[command(name = "tungo", about = "Reverse HTTP tunnel: public URLs for local services")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a public tunnel server (cluster member).
    Server {
        /// Path to server config file
        #[arg(short, long, default_value = "tungo-server.toml")]
        config: PathBuf,
    },
    /// Run a tunnel client exposing a local HTTP origin.
    Client {
        /// Path to client config file
        #[arg(short, long, default_value = "tungo-client.toml")]
        config: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match cli.command {
        Command::Server { config } => {
            let config = config::ServerConfig::load(&config)?;
            rt.block_on(server::bootstrap::run(config))
        }
        Command::Client { config } => {
            let config = config::ClientConfig::load(&config)?;
            rt.block_on(client::run(config))
        }
    }
}
