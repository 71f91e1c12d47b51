//! Real-time brokerage connection broker.
//!
//! One persistent WebSocket link multiplexes every logical stream the client
//! needs (balance, ticks, quotes, contract updates). The crate is layered
//! leaves-first:
//!
//! - [`transport`]: the socket boundary ([`WsTransport`], [`MemoryTransport`]).
//! - [`connection`]: [`ConnectionManager`] owns the link, authorizes,
//!   heartbeats, reconnects and fans inbound frames out by [`Topic`].
//! - [`correlator`]: [`RequestCorrelator`] turns reply topics into awaitable
//!   requests with timeout and supersession.
//! - [`trading`]: [`TradingDesk`] quotes, buys, sells and tracks positions.

pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod protocol;
pub mod trading;
pub mod transport;

pub use config::{Backoff, BrokerConfig};
pub use connection::{ConnectionManager, ConnectionState, Subscription, TopicStream};
pub use correlator::{GroupKey, PendingReply, RequestCorrelator, RequestError};
pub use error::{Error, Result, TransportError};
pub use protocol::{Command, CorrelationId, ErrorEvent, Event, Topic};
pub use trading::{BuyOrder, MultiplierDirection, OpenPosition, TradeProposal, TradingDesk};
pub use transport::{Link, MemoryTransport, Transport};
#[cfg(feature = "websocket")]
pub use transport::WsTransport;
