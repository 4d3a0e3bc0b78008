// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use latch::app;
use latch::config::Config;
use latch::store::factory::{FactoryData, FactoryStore, FileSector};

#[derive(Parser)]
#[command(name = "latch", version, about = "Machine-authorization terminal.")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    subcommand: Option<Commands>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Write the factory sector (gateway secret + terminal key).
    ProvisionFactory {
        /// Gateway master secret, 32 hex chars.
        #[arg(long)]
        master_secret: String,
        /// Fleet NTAG terminal key, 32 hex chars.
        #[arg(long)]
        terminal_key: String,
    },
    /// Erase the factory sector.
    ClearFactory,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli.config.validate() {
        eprintln!("error: {e}");
        std::process::exit(2);
    }
    init_tracing(&cli.config);

    match cli.subcommand {
        Some(Commands::ProvisionFactory { master_secret, terminal_key }) => {
            std::process::exit(provision_factory(&cli.config, &master_secret, &terminal_key));
        }
        Some(Commands::ClearFactory) => {
            let mut store = FactoryStore::new(FileSector::new(cli.config.factory_sector.clone()));
            match store.clear() {
                Ok(()) => println!("factory sector cleared"),
                Err(e) => {
                    eprintln!("error: {e}");
                    std::process::exit(1);
                }
            }
        }
        None => match app::run_terminal(cli.config).await {
            Ok(code) => std::process::exit(code),
            Err(e) => {
                error!("fatal: {e:#}");
                std::process::exit(1);
            }
        },
    }
}

fn provision_factory(config: &Config, master_secret: &str, terminal_key: &str) -> i32 {
    let (Ok(secret), Ok(key)) = (decode_key(master_secret), decode_key(terminal_key)) else {
        eprintln!("error: keys must be exactly 32 hex characters");
        return 2;
    };
    let mut store = FactoryStore::new(FileSector::new(config.factory_sector.clone()));
    let data = FactoryData { master_secret: secret, terminal_key: ntag424::Key::new(key, 1) };
    match store.provision(&data) {
        Ok(()) => {
            println!("factory data written to {}", config.factory_sector.display());
            0
        }
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    }
}

fn decode_key(hex_str: &str) -> Result<[u8; 16], ()> {
    hex::decode(hex_str).map_err(|_| ())?.try_into().map_err(|_| ())
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if config.log_format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
