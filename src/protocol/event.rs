//! Inbound events and the topics they publish on.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{lenient, CorrelationId};

/// Channel over which classified inbound frames fan out to listeners.
///
/// Coarse topics and the per-symbol tick topic keep independent listener
/// sets: a tick publishes on [`Topic::Tick`] and on `Topic::TickSymbol(symbol)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    Authorize,
    AuthorizeError,
    Balance,
    Tick,
    TickSymbol(String),
    ActiveSymbols,
    Proposal,
    Buy,
    Sell,
    ProposalOpenContract,
    History,
    Candles,
    Ohlc,
    Error,
}

impl Topic {
    pub fn tick(symbol: impl Into<String>) -> Self {
        Topic::TickSymbol(symbol.into())
    }

    fn static_name(&self) -> &'static str {
        match self {
            Topic::Authorize => "authorize",
            Topic::AuthorizeError => "authorize_error",
            Topic::Balance => "balance",
            Topic::Tick | Topic::TickSymbol(_) => "tick",
            Topic::ActiveSymbols => "active_symbols",
            Topic::Proposal => "proposal",
            Topic::Buy => "buy",
            Topic::Sell => "sell",
            Topic::ProposalOpenContract => "proposal_open_contract",
            Topic::History => "history",
            Topic::Candles => "candles",
            Topic::Ohlc => "ohlc",
            Topic::Error => "error",
        }
    }
}

/// Wire-level name used in logs and config (`tick:R_100`).
impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::TickSymbol(symbol) => write!(f, "tick:{symbol}"),
            other => f.write_str(other.static_name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownTopic(pub String);

impl fmt::Display for UnknownTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown topic: {}", self.0)
    }
}

impl std::error::Error for UnknownTopic {}

impl FromStr for Topic {
    type Err = UnknownTopic;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(symbol) = s.strip_prefix("tick:") {
            if symbol.is_empty() {
                return Err(UnknownTopic(s.to_string()));
            }
            return Ok(Topic::TickSymbol(symbol.to_string()));
        }
        let topic = match s {
            "authorize" => Topic::Authorize,
            "authorize_error" => Topic::AuthorizeError,
            "balance" => Topic::Balance,
            "tick" => Topic::Tick,
            "active_symbols" => Topic::ActiveSymbols,
            "proposal" => Topic::Proposal,
            "buy" => Topic::Buy,
            "sell" => Topic::Sell,
            "proposal_open_contract" => Topic::ProposalOpenContract,
            "history" => Topic::History,
            "candles" => Topic::Candles,
            "ohlc" => Topic::Ohlc,
            "error" => Topic::Error,
            other => return Err(UnknownTopic(other.to_string())),
        };
        Ok(topic)
    }
}

/// Error object the remote attaches to a failed reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub message: String,
}

impl ApiError {
    pub const MALFORMED_REPLY: &'static str = "MalformedReply";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

/// Payload published on [`Topic::Error`].
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorEvent {
    /// Remote error not tied to a correlated request.
    Protocol(ApiError),
    /// Automatic reconnection gave up; only an explicit `connect()` resumes.
    ReconnectExhausted { attempts: u32 },
    /// Queued frames discarded because the outbound queue overflowed or
    /// they outlived the pending-frame TTL.
    FramesDropped { count: usize },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Authorization {
    pub loginid: String,
    #[serde(default)]
    pub currency: String,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub balance: Option<f64>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub fullname: Option<String>,
    #[serde(default, deserialize_with = "lenient::bool")]
    pub is_virtual: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Balance {
    #[serde(deserialize_with = "lenient::f64")]
    pub balance: f64,
    pub currency: String,
    #[serde(default)]
    pub loginid: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Tick {
    pub symbol: String,
    #[serde(deserialize_with = "lenient::f64")]
    pub quote: f64,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub ask: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub bid: Option<f64>,
    #[serde(default)]
    pub epoch: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MarketSymbol {
    pub symbol: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub market: String,
    #[serde(default)]
    pub submarket: String,
    #[serde(default, deserialize_with = "lenient::bool")]
    pub is_trading_suspended: bool,
    #[serde(default, deserialize_with = "lenient::bool")]
    pub exchange_is_open: bool,
}

/// Price quote.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Proposal {
    #[serde(alias = "proposal_id", deserialize_with = "lenient::string")]
    pub id: String,
    #[serde(deserialize_with = "lenient::f64")]
    pub ask_price: f64,
    #[serde(deserialize_with = "lenient::f64")]
    pub payout: f64,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub spot: Option<f64>,
    #[serde(default)]
    pub display_value: Option<String>,
    #[serde(default)]
    pub longcode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BuyReceipt {
    pub contract_id: u64,
    #[serde(deserialize_with = "lenient::f64")]
    pub buy_price: f64,
    #[serde(deserialize_with = "lenient::f64")]
    pub payout: f64,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub start_spot: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub balance_after: Option<f64>,
    #[serde(default)]
    pub purchase_time: Option<u64>,
    #[serde(default)]
    pub transaction_id: Option<u64>,
    #[serde(default)]
    pub longcode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SaleReceipt {
    #[serde(deserialize_with = "lenient::f64")]
    pub sold_for: f64,
    #[serde(default)]
    pub contract_id: Option<u64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub balance_after: Option<f64>,
    #[serde(default)]
    pub transaction_id: Option<u64>,
}

/// Running state of a purchased contract.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OpenContract {
    pub contract_id: u64,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub bid_price: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub buy_price: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub current_spot: Option<f64>,
    #[serde(default, deserialize_with = "lenient::opt_f64")]
    pub profit: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient::bool")]
    pub is_sold: bool,
}

impl OpenContract {
    /// True once the contract can no longer change.
    pub fn is_settled(&self) -> bool {
        self.is_sold
            || matches!(
                self.status.as_deref(),
                Some("sold") | Some("won") | Some("lost")
            )
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct History {
    #[serde(default)]
    pub prices: Vec<f64>,
    #[serde(default)]
    pub times: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Candle {
    pub epoch: u64,
    #[serde(deserialize_with = "lenient::f64")]
    pub open: f64,
    #[serde(deserialize_with = "lenient::f64")]
    pub high: f64,
    #[serde(deserialize_with = "lenient::f64")]
    pub low: f64,
    #[serde(deserialize_with = "lenient::f64")]
    pub close: f64,
}

/// Streaming candle update.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Ohlc {
    pub symbol: String,
    pub epoch: u64,
    #[serde(default)]
    pub open_time: Option<u64>,
    #[serde(default)]
    pub granularity: Option<u32>,
    #[serde(deserialize_with = "lenient::f64")]
    pub open: f64,
    #[serde(deserialize_with = "lenient::f64")]
    pub high: f64,
    #[serde(deserialize_with = "lenient::f64")]
    pub low: f64,
    #[serde(deserialize_with = "lenient::f64")]
    pub close: f64,
}

/// Reply to a request-style command.
///
/// Protocol errors ride in `body` so listeners decide how to react.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply<T> {
    /// Validated correlation token echoed by the remote.
    pub req_id: Option<CorrelationId>,
    /// Request as echoed by the remote.
    pub echo_req: Value,
    /// Stream id when the request opened a subscription.
    pub subscription_id: Option<String>,
    pub body: Result<T, ApiError>,
}

impl<T> Reply<T> {
    pub fn is_error(&self) -> bool {
        self.body.is_err()
    }
}

/// One classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Authorized(Authorization),
    AuthorizationFailed(ApiError),
    Balance(Balance),
    Tick(Tick),
    ActiveSymbols(Vec<MarketSymbol>),
    Proposal(Reply<Proposal>),
    Buy(Reply<BuyReceipt>),
    Sell(Reply<SaleReceipt>),
    OpenContract(Reply<OpenContract>),
    History { symbol: Option<String>, history: History },
    Candles { symbol: Option<String>, candles: Vec<Candle> },
    Ohlc(Ohlc),
    Error(ErrorEvent),
}

impl Event {
    /// Topics this event publishes on, in publish order.
    pub fn topics(&self) -> Vec<Topic> {
        match self {
            Event::Authorized(_) => vec![Topic::Authorize],
            Event::AuthorizationFailed(_) => vec![Topic::AuthorizeError],
            Event::Balance(_) => vec![Topic::Balance],
            Event::Tick(tick) => vec![Topic::Tick, Topic::tick(tick.symbol.as_str())],
            Event::ActiveSymbols(_) => vec![Topic::ActiveSymbols],
            Event::Proposal(_) => vec![Topic::Proposal],
            Event::Buy(_) => vec![Topic::Buy],
            Event::Sell(_) => vec![Topic::Sell],
            Event::OpenContract(_) => vec![Topic::ProposalOpenContract],
            Event::History { .. } => vec![Topic::History],
            Event::Candles { .. } => vec![Topic::Candles],
            Event::Ohlc(_) => vec![Topic::Ohlc],
            Event::Error(_) => vec![Topic::Error],
        }
    }

    /// Correlation token of a reply event.
    pub fn req_id(&self) -> Option<CorrelationId> {
        match self {
            Event::Proposal(reply) => reply.req_id,
            Event::Buy(reply) => reply.req_id,
            Event::Sell(reply) => reply.req_id,
            Event::OpenContract(reply) => reply.req_id,
            _ => None,
        }
    }

    /// Remote error carried by a reply event.
    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            Event::AuthorizationFailed(err) => Some(err),
            Event::Proposal(Reply { body: Err(err), .. })
            | Event::Buy(Reply { body: Err(err), .. })
            | Event::Sell(Reply { body: Err(err), .. })
            | Event::OpenContract(Reply { body: Err(err), .. })
            | Event::Error(ErrorEvent::Protocol(err)) => Some(err),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names_round_trip() {
        for name in [
            "authorize",
            "authorize_error",
            "balance",
            "tick",
            "tick:R_100",
            "active_symbols",
            "proposal",
            "buy",
            "sell",
            "proposal_open_contract",
            "history",
            "candles",
            "ohlc",
            "error",
        ] {
            let topic: Topic = name.parse().unwrap();
            assert_eq!(topic.to_string(), name);
            assert_eq!(format!("{topic}").parse::<Topic>().unwrap(), topic);
        }
        assert!("tick:".parse::<Topic>().is_err());
        assert!("balanse".parse::<Topic>().is_err());
    }

    #[test]
    fn test_tick_publishes_on_both_topics() {
        let event = Event::Tick(Tick {
            symbol: "R_100".into(),
            quote: 1.0,
            ask: None,
            bid: None,
            epoch: None,
        });
        assert_eq!(
            event.topics(),
            vec![Topic::Tick, Topic::TickSymbol("R_100".into())]
        );
    }

    #[test]
    fn test_open_contract_settlement() {
        let mut contract = OpenContract {
            contract_id: 1,
            bid_price: None,
            buy_price: None,
            current_spot: None,
            profit: None,
            status: Some("open".into()),
            is_sold: false,
        };
        assert!(!contract.is_settled());
        contract.status = Some("lost".into());
        assert!(contract.is_settled());
    }
}
