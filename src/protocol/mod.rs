//! Wire protocol of the brokerage API.
//!
//! Outbound frames are [`Command`] objects; inbound text frames are decoded by
//! [`decode_frame`] into an [`Inbound`] classification carrying a typed
//! [`Event`] and the [`Topic`]s it publishes on.

use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

mod command;
mod decode;
mod event;
pub mod lenient;

pub use command::{Command, HistoryStyle, ProposalRequest, TicksHistory, REQ_ID_FIELD};
pub use decode::{classify, decode_frame, DecodeError, Inbound};
pub use event::{
    ApiError, Authorization, Balance, BuyReceipt, Candle, ErrorEvent, Event, History,
    MarketSymbol, Ohlc, OpenContract, Proposal, Reply, SaleReceipt, Tick, Topic, UnknownTopic,
};

/// Largest integer a JSON number carries without loss in every client.
const MAX_SAFE_ID: u64 = (1 << 53) - 1;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Token attached to a request as `req_id` and echoed on its reply.
///
/// Ids are generated locally and are unique for the life of the process.
/// Inbound ids are only trusted when they have the shape we generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(NonZeroU64);

impl CorrelationId {
    pub fn next() -> Self {
        loop {
            let raw = NEXT_ID.fetch_add(1, Ordering::Relaxed);
            if raw > MAX_SAFE_ID {
                // wrap well before the JSON precision limit
                let _ = NEXT_ID.compare_exchange(raw + 1, 1, Ordering::Relaxed, Ordering::Relaxed);
                continue;
            }
            if let Some(id) = NonZeroU64::new(raw) {
                return Self(id);
            }
        }
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }

    pub fn from_raw(raw: u64) -> Option<Self> {
        if raw > MAX_SAFE_ID {
            return None;
        }
        NonZeroU64::new(raw).map(Self)
    }

    /// Accepts positive JSON integers only; strings, floats and negatives are rejected.
    pub fn from_json(value: &Value) -> Option<Self> {
        value.as_u64().and_then(Self::from_raw)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_are_unique_and_positive() {
        let a = CorrelationId::next();
        let b = CorrelationId::next();
        assert_ne!(a, b);
        assert!(a.get() > 0 && b.get() > 0);
    }

    #[test]
    fn test_from_json_rejects_foreign_shapes() {
        assert_eq!(CorrelationId::from_json(&json!(5)).map(CorrelationId::get), Some(5));
        assert!(CorrelationId::from_json(&json!(0)).is_none());
        assert!(CorrelationId::from_json(&json!(-3)).is_none());
        assert!(CorrelationId::from_json(&json!(1.5)).is_none());
        assert!(CorrelationId::from_json(&json!("5")).is_none());
        assert!(CorrelationId::from_json(&json!(u64::MAX)).is_none());
        assert!(CorrelationId::from_json(&Value::Null).is_none());
    }
}
