//! Command-line interface that follows the header chain through a pool of Electrum servers.

use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use std::sync::Arc;

use clap::{Arg, ArgAction, ArgMatches, Command};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

use electrum_spv::chain::{ChainRegistry, NetworkParams};
use electrum_spv::network::{ConnectionPool, NetworkEvent, ServerAddr, TcpConnector, TimeoutLevel};
use electrum_spv::{ClientConfig, LevelFilter, LogFileConfig, LoggingConfig, Network, SpvError};

fn cli() -> Command {
    Command::new("electrum-spv")
        .version(electrum_spv::VERSION)
        .about("SPV header synchronization against Electrum servers")
        .arg(
            Arg::new("network")
                .short('n')
                .long("network")
                .value_name("NETWORK")
                .help("Network to follow")
                .value_parser(["mainnet", "testnet", "signet", "regtest"])
                .default_value("mainnet"),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .help("Directory for certificates and headers")
                .default_value("./electrum-spv-data"),
        )
        .arg(
            Arg::new("server")
                .short('s')
                .long("server")
                .value_name("HOST:PORT[:t|s]")
                .help("Candidate server (can be used multiple times)")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("main-server")
                .long("main-server")
                .value_name("HOST:PORT[:t|s]")
                .help("Server to route wallet queries through"),
        )
        .arg(
            Arg::new("fingerprint")
                .long("fingerprint")
                .value_name("SHA256")
                .help("Expected certificate fingerprint of the main server"),
        )
        .arg(
            Arg::new("oneserver")
                .long("oneserver")
                .help("Only connect to the main server")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("timeout-level")
                .long("timeout-level")
                .value_name("LEVEL")
                .help("Request timeout tier")
                .value_parser(["normal", "relaxed", "most-relaxed"])
                .default_value("normal"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-dir")
                .long("log-dir")
                .value_name("DIR")
                .help("Write logs to DIR/run.log instead of the console"),
        )
        .arg(
            Arg::new("debug-rpc")
                .long("debug-rpc")
                .help("Log every JSON-RPC line at debug level")
                .action(ArgAction::SetTrue),
        )
}

fn parse_server(value: &str) -> Result<ServerAddr, SpvError> {
    ServerAddr::from_str_with_inference(value)
        .ok_or_else(|| SpvError::Config(format!("invalid server address '{}'", value)))
}

fn build_config(matches: &ArgMatches) -> Result<ClientConfig, SpvError> {
    let network = match matches.get_one::<String>("network").map(String::as_str) {
        Some("testnet") => Network::Testnet,
        Some("signet") => Network::Signet,
        Some("regtest") => Network::Regtest,
        _ => Network::Bitcoin,
    };
    let timeout_level = matches
        .get_one::<String>("timeout-level")
        .map(|level| TimeoutLevel::from_str(level))
        .transpose()
        .map_err(|e| SpvError::Config(e.to_string()))?
        .unwrap_or_default();

    let mut config = ClientConfig::new(network)
        .with_timeout_level(timeout_level)
        .with_one_server(matches.get_flag("oneserver"))
        .with_debug_rpc(matches.get_flag("debug-rpc"));
    if let Some(dir) = matches.get_one::<String>("data-dir") {
        config = config.with_data_dir(PathBuf::from(dir));
    }
    if let Some(servers) = matches.get_many::<String>("server") {
        for server in servers {
            config.add_server(parse_server(server)?);
        }
    }
    if let Some(main) = matches.get_one::<String>("main-server") {
        config = config.with_main_server(parse_server(main)?);
    }
    if let Some(fingerprint) = matches.get_one::<String>("fingerprint") {
        config = config.with_server_fingerprint(fingerprint.clone());
    }

    config.validate().map_err(SpvError::Config)?;
    Ok(config)
}

async fn run(matches: ArgMatches) -> Result<(), SpvError> {
    let level = matches
        .get_one::<String>("log-level")
        .and_then(|level| LevelFilter::from_str(level).ok())
        .unwrap_or(LevelFilter::INFO);
    let _logging = electrum_spv::init_logging(LoggingConfig {
        level: Some(level),
        console: !matches.contains_id("log-dir"),
        file: matches.get_one::<String>("log-dir").map(|dir| LogFileConfig {
            log_dir: PathBuf::from(dir),
            max_archives: 20,
        }),
    })?;

    let config = build_config(&matches)?;
    tracing::info!("electrum-spv {} on {}", electrum_spv::VERSION, config.network);

    let params = NetworkParams::new(config.network);
    let registry = if config.persist_headers {
        ChainRegistry::load(params, &config.headers_dir()).await?
    } else {
        ChainRegistry::new(params)
    };
    let (_, height) = registry.best_chain().await;
    tracing::info!("local chain height {}", height);

    let pool = ConnectionPool::new(config, Arc::new(registry), Arc::new(TcpConnector::new()));
    let mut events = pool.subscribe();
    pool.start().await?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(NetworkEvent::BlockchainUpdated { best_height, .. }) => {
                    tracing::info!("best chain height {}", best_height);
                }
                Ok(event) => tracing::debug!("{}", event.description()),
                Err(RecvError::Lagged(skipped)) => tracing::debug!("missed {} network events", skipped),
                Err(RecvError::Closed) => break,
            },
            _ = signal::ctrl_c() => {
                tracing::info!("received shutdown signal");
                break;
            }
        }
    }

    pool.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    let matches = cli().get_matches();
    if let Err(e) = run(matches).await {
        eprintln!("electrum-spv: {}", e);
        process::exit(1);
    }
}
