use anyhow::{Context, Result};
use clap::Parser;
use futures_util::StreamExt;
use log::{error, info, warn};
use std::path::PathBuf;
use url::Url;

use brokerlink::{
    BrokerConfig, ConnectionManager, ConnectionState, Event, MultiplierDirection,
    RequestCorrelator, Topic, TradingDesk,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file (camelCase keys)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WebSocket endpoint, overrides the config file
    #[arg(long)]
    endpoint: Option<Url>,

    /// API token used to authorize the session
    #[arg(long)]
    token: Option<String>,

    /// Comma-separated list of symbols to stream ticks for
    #[arg(short, long, default_value = "R_100")]
    symbols: String,

    /// Request one multiplier quote (stake 10, x100) per symbol after connecting
    #[arg(long)]
    quote: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => BrokerConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => BrokerConfig::default(),
    };
    config = config
        .with_env_overrides()
        .context("Invalid environment override")?;
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }
    if let Some(token) = args.token {
        config.auth_token = Some(token);
    }

    let symbols: Vec<String> = args
        .symbols
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    info!("Starting brokerlink tail");
    info!("Endpoint: {}", config.endpoint);
    info!("Symbols: {}", symbols.join(","));

    let manager =
        ConnectionManager::websocket(config).context("Failed to start connection manager")?;

    let _balance = manager.subscribe(Topic::Balance, |event: &Event| {
        if let Event::Balance(balance) = event {
            info!("Balance: {} {}", balance.balance, balance.currency);
        }
    });
    let _errors = manager.subscribe(Topic::Error, |event: &Event| {
        if let Event::Error(err) = event {
            error!("Error topic: {:?}", err);
        }
    });
    let mut ticks = manager.subscribe_stream(Topic::Tick);

    let mut states = manager.state_changes();
    manager.connect();

    if args.quote {
        let desk = TradingDesk::new(RequestCorrelator::new(manager.clone()));
        for symbol in &symbols {
            match desk
                .multiplier_proposal(symbol, MultiplierDirection::Up, 10.0, 100.0)
                .await
            {
                Ok(quote) => info!(
                    "Quote {} {}: ask {} payout {}",
                    quote.symbol, quote.trade_type, quote.ask_price, quote.payout
                ),
                Err(e) => warn!("Quote for {} failed: {}", symbol, e),
            }
        }
    }

    // Tick streams are per link.
    let mut was_connected = false;
    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                if link_came_up(&mut was_connected, state) {
                    for symbol in &symbols {
                        manager.subscribe_ticks(symbol);
                    }
                }
            }
            event = ticks.next() => match event {
                Some(Event::Tick(tick)) => info!("{} {} @ {:?}", tick.symbol, tick.quote, tick.epoch),
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; shutting down");
                break;
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}

/// True on the first connected state after a disconnected one.
fn link_came_up(was_connected: &mut bool, state: ConnectionState) -> bool {
    let connected = state.is_connected();
    let came_up = connected && !*was_connected;
    *was_connected = connected;
    came_up
}
