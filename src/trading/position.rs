//! Purchased contracts and their running state.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::watch;

use crate::protocol::OpenContract;

/// Contract families the desk can quote and buy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TradeType {
    MultUp,
    MultDown,
    Accumulator,
}

impl TradeType {
    /// `contract_type` value on the wire.
    pub fn contract_type(self) -> &'static str {
        match self {
            TradeType::MultUp => "MULTUP",
            TradeType::MultDown => "MULTDOWN",
            TradeType::Accumulator => "ACCU",
        }
    }
}

impl fmt::Display for TradeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.contract_type())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Won,
    Lost,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenPosition {
    pub contract_id: u64,
    pub trade_type: TradeType,
    pub symbol: String,
    pub display_name: String,
    pub currency: String,
    pub buy_price: f64,
    /// Latest bid, or the sale price once sold.
    pub current_price: f64,
    pub entry_spot: f64,
    pub current_spot: f64,
    pub profit: f64,
    pub payout: f64,
    pub multiplier: Option<f64>,
    pub growth_rate: Option<f64>,
    pub status: PositionStatus,
    /// Epoch seconds.
    pub purchase_time: u64,
}

impl OpenPosition {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Folds a contract update in. Returns true once the contract has settled.
    pub fn apply_update(&mut self, update: &OpenContract) -> bool {
        if let Some(bid) = update.bid_price.filter(|v| *v != 0.0) {
            self.current_price = bid;
        }
        if let Some(spot) = update.current_spot.filter(|v| *v != 0.0) {
            self.current_spot = spot;
        }
        self.profit = update.profit.unwrap_or(0.0);

        if update.is_settled() {
            self.status = if update.is_sold && self.profit > 0.0 {
                PositionStatus::Won
            } else {
                PositionStatus::Lost
            };
            return true;
        }
        false
    }

    pub fn apply_sale(&mut self, sold_for: f64) {
        self.status = if sold_for > self.buy_price {
            PositionStatus::Won
        } else {
            PositionStatus::Lost
        };
        self.current_price = sold_for;
        self.profit = sold_for - self.buy_price;
    }
}

/// Every position bought through the desk, keyed by contract id.
///
/// Changes are pushed to a `watch` channel carrying the open positions.
#[derive(Debug)]
pub struct PositionBook {
    positions: Mutex<BTreeMap<u64, OpenPosition>>,
    open_tx: watch::Sender<Vec<OpenPosition>>,
}

impl Default for PositionBook {
    fn default() -> Self {
        let (open_tx, _) = watch::channel(Vec::new());
        Self {
            positions: Mutex::new(BTreeMap::new()),
            open_tx,
        }
    }
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, OpenPosition>> {
        self.positions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, positions: &BTreeMap<u64, OpenPosition>) {
        let open = positions.values().filter(|p| p.is_open()).cloned().collect();
        self.open_tx.send_replace(open);
    }

    pub fn insert(&self, position: OpenPosition) {
        let mut positions = self.lock();
        positions.insert(position.contract_id, position);
        self.publish(&positions);
    }

    /// Applies a contract update. Returns `Some(settled)` if the contract is known.
    pub fn apply_update(&self, update: &OpenContract) -> Option<bool> {
        let mut positions = self.lock();
        let position = positions.get_mut(&update.contract_id)?;
        let settled = position.apply_update(update);
        self.publish(&positions);
        Some(settled)
    }

    pub fn apply_sale(&self, contract_id: u64, sold_for: f64) -> Option<OpenPosition> {
        let mut positions = self.lock();
        let position = positions.get_mut(&contract_id)?;
        position.apply_sale(sold_for);
        let snapshot = position.clone();
        self.publish(&positions);
        Some(snapshot)
    }

    pub fn get(&self, contract_id: u64) -> Option<OpenPosition> {
        self.lock().get(&contract_id).cloned()
    }

    pub fn open(&self) -> Vec<OpenPosition> {
        self.lock().values().filter(|p| p.is_open()).cloned().collect()
    }

    pub fn all(&self) -> Vec<OpenPosition> {
        self.lock().values().cloned().collect()
    }

    pub fn watch(&self) -> watch::Receiver<Vec<OpenPosition>> {
        self.open_tx.subscribe()
    }
}
