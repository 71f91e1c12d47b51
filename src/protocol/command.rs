//! Outbound commands.
//!
//! A [`Command`] is the plain key-value object the remote expects. The
//! connection layer treats it as opaque; the constructors here only exist so
//! callers do not hand-assemble field names.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::CorrelationId;

/// Field the remote echoes back verbatim on the reply.
pub const REQ_ID_FIELD: &str = "req_id";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Command(Map<String, Value>);

impl Command {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an arbitrary JSON object. Returns `None` for non-objects.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    fn with_opt<V: Into<Value>>(self, key: &str, value: Option<V>) -> Self {
        match value {
            Some(v) => self.with(key, v),
            None => self,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }

    /// Stamps the correlation token, replacing any caller-supplied one.
    pub fn with_req_id(mut self, id: CorrelationId) -> Self {
        self.0.insert(REQ_ID_FIELD.to_string(), Value::from(id.get()));
        self
    }

    pub fn req_id(&self) -> Option<CorrelationId> {
        self.0.get(REQ_ID_FIELD).and_then(CorrelationId::from_json)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.0)
    }

    /// True for the keep-alive frame.
    pub fn is_keepalive(&self) -> bool {
        self.0.len() == 1 && self.0.contains_key("ping")
    }

    // --- Constructors ---

    pub fn authorize(token: &str) -> Self {
        Self::new().with("authorize", token)
    }

    pub fn ping() -> Self {
        Self::new().with("ping", 1)
    }

    pub fn balance(subscribe: bool) -> Self {
        Self::new()
            .with("balance", 1)
            .with("subscribe", u8::from(subscribe))
    }

    pub fn active_symbols() -> Self {
        Self::new()
            .with("active_symbols", "brief")
            .with("product_type", "basic")
    }

    pub fn ticks(symbol: &str) -> Self {
        Self::new().with("ticks", symbol).with("subscribe", 1)
    }

    /// Cancels every stream of one kind (`"ticks"`, `"proposal"`, ...).
    pub fn forget_all(kind: &str) -> Self {
        Self::new().with("forget_all", kind)
    }

    pub fn forget(subscription_id: &str) -> Self {
        Self::new().with("forget", subscription_id)
    }

    pub fn account_status() -> Self {
        Self::new().with("get_account_status", 1)
    }

    pub fn ticks_history(request: &TicksHistory) -> Self {
        let cmd = Self::new()
            .with("ticks_history", request.symbol.as_str())
            .with("count", request.count)
            .with("end", "latest")
            .with("subscribe", u8::from(request.subscribe));
        match request.style {
            HistoryStyle::Ticks => cmd.with("style", "ticks"),
            HistoryStyle::Candles { granularity } => cmd
                .with("style", "candles")
                .with("granularity", granularity),
        }
    }

    pub fn proposal(request: &ProposalRequest) -> Self {
        Self::new()
            .with("proposal", 1)
            .with("amount", request.amount)
            .with("basis", request.basis.as_str())
            .with("contract_type", request.contract_type.as_str())
            .with("currency", request.currency.as_str())
            .with("symbol", request.symbol.as_str())
            .with_opt("duration", request.duration)
            .with_opt("duration_unit", request.duration_unit.as_deref())
            .with_opt("multiplier", request.multiplier)
            .with_opt("growth_rate", request.growth_rate)
    }

    pub fn buy(proposal_id: &str, price: f64) -> Self {
        Self::new().with("buy", proposal_id).with("price", price)
    }

    /// `price: 0` sells at market.
    pub fn sell(contract_id: u64, price: f64) -> Self {
        Self::new().with("sell", contract_id).with("price", price)
    }

    pub fn open_contract(contract_id: u64, subscribe: bool) -> Self {
        Self::new()
            .with("proposal_open_contract", 1)
            .with("contract_id", contract_id)
            .with("subscribe", u8::from(subscribe))
    }
}

/// Price quote parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposalRequest {
    pub symbol: String,
    pub contract_type: String,
    pub amount: f64,
    pub basis: String,
    pub currency: String,
    pub duration: Option<u32>,
    pub duration_unit: Option<String>,
    pub multiplier: Option<f64>,
    /// Fraction, e.g. `0.03` for 3 %.
    pub growth_rate: Option<f64>,
}

impl ProposalRequest {
    /// Stake-based quote in USD with no duration (open-ended contracts).
    pub fn stake(symbol: impl Into<String>, contract_type: impl Into<String>, amount: f64) -> Self {
        Self {
            symbol: symbol.into(),
            contract_type: contract_type.into(),
            amount,
            basis: "stake".into(),
            currency: "USD".into(),
            duration: None,
            duration_unit: None,
            multiplier: None,
            growth_rate: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryStyle {
    Ticks,
    Candles { granularity: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicksHistory {
    pub symbol: String,
    pub count: u32,
    pub style: HistoryStyle,
    pub subscribe: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_constructors_match_wire_shape() {
        assert_eq!(
            Command::authorize("tok").into_value(),
            json!({"authorize": "tok"})
        );
        assert_eq!(
            Command::balance(true).into_value(),
            json!({"balance": 1, "subscribe": 1})
        );
        assert_eq!(
            Command::buy("abc-123", 10.5).into_value(),
            json!({"buy": "abc-123", "price": 10.5})
        );
        assert!(Command::ping().is_keepalive());
        assert!(!Command::ticks("R_100").is_keepalive());
    }

    #[test]
    fn test_proposal_skips_absent_fields() {
        let mut req = ProposalRequest::stake("R_100", "MULTUP", 10.0);
        req.multiplier = Some(100.0);
        let value = Command::proposal(&req).into_value();
        assert_eq!(
            value,
            json!({
                "proposal": 1,
                "amount": 10.0,
                "basis": "stake",
                "contract_type": "MULTUP",
                "currency": "USD",
                "symbol": "R_100",
                "multiplier": 100.0,
            })
        );
    }

    #[test]
    fn test_req_id_is_overwritten() {
        let id = CorrelationId::next();
        let cmd = Command::new().with("proposal", 1).with("req_id", "spoofed");
        let cmd = cmd.with_req_id(id);
        assert_eq!(cmd.req_id(), Some(id));
    }

    #[test]
    fn test_candle_history_shape() {
        let cmd = Command::ticks_history(&TicksHistory {
            symbol: "R_50".into(),
            count: 1000,
            style: HistoryStyle::Candles { granularity: 60 },
            subscribe: true,
        });
        assert_eq!(
            cmd.into_value(),
            json!({
                "ticks_history": "R_50",
                "count": 1000,
                "end": "latest",
                "style": "candles",
                "granularity": 60,
                "subscribe": 1,
            })
        );
    }
}
