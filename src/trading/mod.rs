//! Quotes, purchases and position tracking.
//!
//! The [`TradingDesk`] drives the request correlator for the two open-ended
//! contract families the client trades (multipliers and accumulators), buys
//! a quoted contract, and follows it through `proposal_open_contract`
//! updates until it settles.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{info, warn};
use tokio::sync::watch;

use crate::connection::Subscription;
use crate::correlator::{GroupKey, RequestCorrelator, RequestError};
use crate::protocol::{
    BuyReceipt, Command, Event, OpenContract, Proposal, ProposalRequest, Reply, SaleReceipt, Topic,
};

mod position;

pub use position::{OpenPosition, PositionBook, PositionStatus, TradeType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiplierDirection {
    Up,
    Down,
}

impl MultiplierDirection {
    pub fn trade_type(self) -> TradeType {
        match self {
            MultiplierDirection::Up => TradeType::MultUp,
            MultiplierDirection::Down => TradeType::MultDown,
        }
    }
}

/// A quote the desk can buy.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeProposal {
    pub proposal_id: String,
    pub trade_type: TradeType,
    pub symbol: String,
    pub ask_price: f64,
    pub payout: f64,
    pub spot: Option<f64>,
    pub display_value: Option<String>,
    pub multiplier: Option<f64>,
    /// Fraction, e.g. `0.03`.
    pub growth_rate: Option<f64>,
}

/// Purchase parameters for [`TradingDesk::buy_contract`].
#[derive(Debug, Clone, PartialEq)]
pub struct BuyOrder {
    /// Maximum price accepted.
    pub price: f64,
    /// Human-readable symbol name stored on the position.
    pub display_name: String,
}

impl BuyOrder {
    /// Buys at the quoted ask price.
    pub fn at_ask(proposal: &TradeProposal) -> Self {
        Self {
            price: proposal.ask_price,
            display_name: proposal.symbol.clone(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }
}

type Watchers = Mutex<HashMap<u64, Subscription>>;

pub struct TradingDesk {
    correlator: RequestCorrelator,
    book: Arc<PositionBook>,
    watchers: Arc<Watchers>,
    proposal_keys: Mutex<BTreeSet<GroupKey>>,
}

impl TradingDesk {
    pub fn new(correlator: RequestCorrelator) -> Self {
        Self {
            correlator,
            book: Arc::new(PositionBook::new()),
            watchers: Arc::new(Mutex::new(HashMap::new())),
            proposal_keys: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn correlator(&self) -> &RequestCorrelator {
        &self.correlator
    }

    fn timeout(&self) -> Duration {
        self.correlator.default_timeout()
    }

    /// Quotes a multiplier contract. Supersedes any pending quote for the
    /// same symbol and direction.
    pub async fn multiplier_proposal(
        &self,
        symbol: &str,
        direction: MultiplierDirection,
        stake: f64,
        multiplier: f64,
    ) -> Result<TradeProposal, RequestError> {
        let trade_type = direction.trade_type();
        let mut request = ProposalRequest::stake(symbol, trade_type.contract_type(), stake);
        request.multiplier = Some(multiplier);
        self.proposal(trade_type, request).await
    }

    /// Quotes an accumulator. `growth_rate_percent` is e.g. `3.0` for 3 %.
    pub async fn accumulator_proposal(
        &self,
        symbol: &str,
        stake: f64,
        growth_rate_percent: f64,
    ) -> Result<TradeProposal, RequestError> {
        let trade_type = TradeType::Accumulator;
        let mut request = ProposalRequest::stake(symbol, trade_type.contract_type(), stake);
        request.growth_rate = Some(growth_rate_percent / 100.0);
        self.proposal(trade_type, request).await
    }

    async fn proposal(
        &self,
        trade_type: TradeType,
        request: ProposalRequest,
    ) -> Result<TradeProposal, RequestError> {
        let key = GroupKey::new(format!("{}_{}", request.symbol, trade_type.contract_type()));
        self.keys().insert(key.clone());

        let pending = self.correlator.request(
            key.clone(),
            Topic::Proposal,
            Command::proposal(&request),
            self.timeout(),
        );
        let id = pending.id();
        let outcome = pending.await;
        // a superseding quote owns the key now
        if !matches!(outcome, Err(RequestError::Superseded)) && !self.correlator.is_pending(&key) {
            self.keys().remove(&key);
        }

        let quote: Proposal = body(outcome?, Topic::Proposal, |e| match e {
            Event::Proposal(reply) => Some(reply),
            _ => None,
        })?;
        info!(
            "Quote {} for {} {}: ask {} payout {}",
            id, request.symbol, trade_type, quote.ask_price, quote.payout
        );
        Ok(TradeProposal {
            proposal_id: quote.id,
            trade_type,
            symbol: request.symbol,
            ask_price: quote.ask_price,
            payout: quote.payout,
            spot: quote.spot,
            display_value: quote.display_value,
            multiplier: request.multiplier,
            growth_rate: request.growth_rate,
        })
    }

    /// Buys a quoted contract, records it and starts following its updates.
    pub async fn buy_contract(
        &self,
        proposal: &TradeProposal,
        order: BuyOrder,
    ) -> Result<OpenPosition, RequestError> {
        let outcome = self
            .correlator
            .execute_dependent_action(
                Topic::Buy,
                Command::buy(&proposal.proposal_id, order.price),
                self.timeout(),
            )
            .await;
        let receipt: BuyReceipt = body(outcome?, Topic::Buy, |e| match e {
            Event::Buy(reply) => Some(reply),
            _ => None,
        })?;

        let entry_spot = receipt.start_spot.unwrap_or(order.price);
        let position = OpenPosition {
            contract_id: receipt.contract_id,
            trade_type: proposal.trade_type,
            symbol: proposal.symbol.clone(),
            display_name: order.display_name,
            currency: "USD".into(),
            buy_price: receipt.buy_price,
            current_price: receipt.buy_price,
            entry_spot,
            current_spot: entry_spot,
            profit: 0.0,
            payout: receipt.payout,
            multiplier: proposal.multiplier,
            growth_rate: proposal.growth_rate,
            status: PositionStatus::Open,
            purchase_time: receipt.purchase_time.unwrap_or_else(now_secs),
        };
        info!(
            "Bought contract {} ({} {}) for {}",
            position.contract_id, position.trade_type, position.symbol, position.buy_price
        );
        self.book.insert(position.clone());
        self.follow(position.contract_id);
        Ok(position)
    }

    /// Subscribes to updates for one contract until it settles.
    fn follow(&self, contract_id: u64) {
        let book = Arc::downgrade(&self.book);
        let watchers = Arc::downgrade(&self.watchers);
        let subscription = self.correlator.connection().subscribe(
            Topic::ProposalOpenContract,
            move |event: &Event| {
                let Event::OpenContract(reply) = event else { return };
                let update = match &reply.body {
                    Ok(update) if update.contract_id == contract_id => update,
                    Ok(_) => return,
                    Err(err) => {
                        warn!("Contract update error: {}", err);
                        return;
                    }
                };
                on_update(&book, &watchers, update);
            },
        );
        lock(&self.watchers).insert(contract_id, subscription);
        self.correlator
            .connection()
            .send(Command::open_contract(contract_id, true));
    }

    /// Sells at market. The position settles as won if sold above its buy price.
    pub async fn sell_position(&self, contract_id: u64) -> Result<SaleReceipt, RequestError> {
        let outcome = self
            .correlator
            .execute_dependent_action(Topic::Sell, Command::sell(contract_id, 0.0), self.timeout())
            .await;
        let receipt: SaleReceipt = body(outcome?, Topic::Sell, |e| match e {
            Event::Sell(reply) => Some(reply),
            _ => None,
        })?;

        if let Some(position) = self.book.apply_sale(contract_id, receipt.sold_for) {
            info!(
                "Sold contract {} for {} ({:?})",
                contract_id, receipt.sold_for, position.status
            );
        }
        unfollow(&self.watchers, contract_id);
        Ok(receipt)
    }

    pub fn open_positions(&self) -> Vec<OpenPosition> {
        self.book.open()
    }

    pub fn position(&self, contract_id: u64) -> Option<OpenPosition> {
        self.book.get(contract_id)
    }

    /// Open positions, pushed on every change.
    pub fn watch_positions(&self) -> watch::Receiver<Vec<OpenPosition>> {
        self.book.watch()
    }

    /// Abandons every pending quote. Returns how many were cancelled.
    pub fn clear_proposals(&self) -> usize {
        let keys = std::mem::take(&mut *self.keys());
        keys.iter().filter(|key| self.correlator.cancel(key)).count()
    }

    /// Contracts still being followed.
    pub fn followed_contracts(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = lock(&self.watchers).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn keys(&self) -> MutexGuard<'_, BTreeSet<GroupKey>> {
        self.proposal_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TradingDesk {
    fn drop(&mut self) {
        for (_, subscription) in lock(&self.watchers).drain() {
            subscription.unsubscribe();
        }
    }
}

fn lock(watchers: &Watchers) -> MutexGuard<'_, HashMap<u64, Subscription>> {
    watchers.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unfollow(watchers: &Watchers, contract_id: u64) {
    let subscription = lock(watchers).remove(&contract_id);
    if let Some(subscription) = subscription {
        subscription.unsubscribe();
    }
}

fn on_update(book: &Weak<PositionBook>, watchers: &Weak<Watchers>, update: &OpenContract) {
    let Some(book) = book.upgrade() else { return };
    if book.apply_update(update) == Some(true) {
        info!("Contract {} settled", update.contract_id);
        if let Some(watchers) = watchers.upgrade() {
            unfollow(&watchers, update.contract_id);
        }
    }
}

/// Extracts the success body of the expected reply kind.
fn body<T>(
    event: Event,
    expected: Topic,
    pick: impl FnOnce(Event) -> Option<Reply<T>>,
) -> Result<T, RequestError> {
    match pick(event) {
        Some(reply) => reply.body.map_err(RequestError::Api),
        None => Err(RequestError::UnexpectedReply(expected)),
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
