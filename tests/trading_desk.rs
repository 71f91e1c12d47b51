mod support;

use brokerlink::protocol::Topic;
use brokerlink::trading::{PositionStatus, TradeType};
use brokerlink::transport::MemoryPeer;
use brokerlink::{
    BuyOrder, MultiplierDirection, OpenPosition, RequestCorrelator, RequestError, TradeProposal,
    TradingDesk,
};
use serde_json::json;

use support::*;

fn quoted(id: &str, ask_price: f64) -> TradeProposal {
    TradeProposal {
        proposal_id: id.into(),
        trade_type: TradeType::MultUp,
        symbol: "R_100".into(),
        ask_price,
        payout: 0.0,
        spot: Some(1234.5),
        display_value: None,
        multiplier: Some(100.0),
        growth_rate: None,
    }
}

/// Buys `proposal` as contract `contract_id` and consumes the follow-up subscription.
async fn buy(
    desk: &TradingDesk,
    peer: &mut MemoryPeer,
    proposal: &TradeProposal,
    contract_id: u64,
) -> OpenPosition {
    let order = BuyOrder::at_ask(proposal).with_display_name("Volatility 100 Index");
    let (position, _) = tokio::join!(desk.buy_contract(proposal, order), async {
        let frame = peer.recv().await.expect("buy frame");
        assert_eq!(frame["buy"], json!(proposal.proposal_id));
        assert_eq!(frame["price"].as_f64(), Some(proposal.ask_price));
        peer.send(reply(
            "buy",
            req_id(&frame),
            json!({
                "contract_id": contract_id,
                "buy_price": proposal.ask_price,
                "payout": 0,
                "start_spot": "1234.50",
                "purchase_time": 1700000000,
                "balance_after": 9990
            }),
        ));
    });
    let position = position.expect("purchase");
    assert_eq!(
        peer.recv().await,
        Some(json!({"proposal_open_contract": 1, "contract_id": contract_id, "subscribe": 1}))
    );
    position
}

fn update(contract_id: u64, body: serde_json::Value) -> serde_json::Value {
    let mut body = body;
    body["contract_id"] = json!(contract_id);
    json!({
        "msg_type": "proposal_open_contract",
        "echo_req": {"proposal_open_contract": 1, "contract_id": contract_id},
        "proposal_open_contract": body,
        "subscription": {"id": format!("poc-{contract_id}")}
    })
}

#[tokio::test(start_paused = true)]
async fn multiplier_quote_request_and_result() {
    let (manager, _server, mut peer) = connected().await;
    let desk = TradingDesk::new(RequestCorrelator::new(manager));

    let (quote, frame) = tokio::join!(
        desk.multiplier_proposal("R_100", MultiplierDirection::Up, 10.0, 100.0),
        async {
            let frame = peer.recv().await.expect("proposal frame");
            peer.send(reply("proposal", req_id(&frame), proposal_body("q-1")));
            frame
        }
    );

    assert_eq!(frame["proposal"], json!(1));
    assert_eq!(frame["contract_type"], json!("MULTUP"));
    assert_eq!(frame["symbol"], json!("R_100"));
    assert_eq!(frame["basis"], json!("stake"));
    assert_eq!(frame["currency"], json!("USD"));
    assert_eq!(frame["amount"].as_f64(), Some(10.0));
    assert_eq!(frame["multiplier"].as_f64(), Some(100.0));
    assert!(frame.get("subscribe").is_none());

    let quote = quote.expect("quote");
    assert_eq!(quote.proposal_id, "q-1");
    assert_eq!(quote.trade_type, TradeType::MultUp);
    assert_eq!(quote.ask_price, 10.0);
    assert_eq!(quote.payout, 19.5);
    assert_eq!(quote.multiplier, Some(100.0));
    assert_eq!(desk.clear_proposals(), 0);
}

#[tokio::test(start_paused = true)]
async fn accumulator_quote_sends_growth_rate_as_fraction() {
    let (manager, _server, mut peer) = connected().await;
    let desk = TradingDesk::new(RequestCorrelator::new(manager));

    let (quote, frame) = tokio::join!(desk.accumulator_proposal("R_50", 10.0, 3.0), async {
        let frame = peer.recv().await.expect("proposal frame");
        peer.send(reply("proposal", req_id(&frame), proposal_body("acc-1")));
        frame
    });

    assert_eq!(frame["contract_type"], json!("ACCU"));
    assert_eq!(frame["growth_rate"].as_f64(), Some(0.03));
    assert!(frame.get("multiplier").is_none());
    let quote = quote.expect("quote");
    assert_eq!(quote.trade_type, TradeType::Accumulator);
    assert_eq!(quote.growth_rate, Some(0.03));
}

#[tokio::test(start_paused = true)]
async fn newer_quote_for_same_symbol_supersedes() {
    let (manager, _server, mut peer) = connected().await;
    let desk = TradingDesk::new(RequestCorrelator::new(manager));

    let (older, newer, _) = tokio::join!(
        desk.multiplier_proposal("R_100", MultiplierDirection::Down, 10.0, 100.0),
        desk.multiplier_proposal("R_100", MultiplierDirection::Down, 20.0, 100.0),
        async {
            let first = peer.recv().await.expect("first quote");
            let second = peer.recv().await.expect("second quote");
            peer.send(reply("proposal", req_id(&first), proposal_body("old")));
            peer.send(reply("proposal", req_id(&second), proposal_body("new")));
        }
    );

    assert_eq!(older, Err(RequestError::Superseded));
    assert_eq!(newer.expect("newer quote").proposal_id, "new");
    assert!(desk.correlator().in_flight().is_empty());
}

#[tokio::test(start_paused = true)]
async fn clearing_proposals_cancels_pending_quotes() {
    let (manager, _server, mut peer) = connected().await;
    let desk = TradingDesk::new(RequestCorrelator::new(manager));

    let (quote, cleared) = tokio::join!(
        desk.multiplier_proposal("R_75", MultiplierDirection::Up, 5.0, 50.0),
        async {
            peer.recv().await.expect("quote frame");
            desk.clear_proposals()
        }
    );
    assert_eq!(cleared, 1);
    assert_eq!(quote, Err(RequestError::Cancelled));
}

#[tokio::test(start_paused = true)]
async fn bought_contract_is_followed_until_it_settles() {
    let (manager, _server, mut peer) = connected().await;
    let desk = TradingDesk::new(RequestCorrelator::new(manager.clone()));

    let position = buy(&desk, &mut peer, &quoted("q-7", 10.0), 555).await;
    assert_eq!(position.contract_id, 555);
    assert_eq!(position.status, PositionStatus::Open);
    assert_eq!(position.display_name, "Volatility 100 Index");
    assert_eq!(position.entry_spot, 1234.5);
    assert_eq!(position.purchase_time, 1700000000);
    assert_eq!(desk.followed_contracts(), vec![555]);

    let mut open = desk.watch_positions();
    assert_eq!(open.borrow().len(), 1);

    // updates for other contracts are ignored
    peer.send(update(999, json!({"bid_price": 50.0, "profit": 40.0})));
    peer.send(update(
        555,
        json!({"bid_price": "11.20", "current_spot": 1240.0, "profit": 1.2, "is_sold": 0, "status": "open"}),
    ));
    open.changed().await.expect("position update");
    let live = desk.position(555).expect("position");
    assert_eq!(live.current_price, 11.2);
    assert_eq!(live.current_spot, 1240.0);
    assert_eq!(live.profit, 1.2);
    assert!(live.is_open());

    // a zero bid keeps the last known price
    peer.send(update(555, json!({"bid_price": 0, "profit": 1.0})));
    open.changed().await.expect("position update");
    assert_eq!(desk.position(555).expect("position").current_price, 11.2);

    peer.send(update(
        555,
        json!({"bid_price": 12.0, "profit": 2.0, "is_sold": 1, "status": "sold"}),
    ));
    open.changed().await.expect("settlement");
    assert!(open.borrow().is_empty());
    assert_eq!(desk.position(555).expect("position").status, PositionStatus::Won);
    assert!(desk.followed_contracts().is_empty());
    assert_eq!(
        manager.registry().listener_count(&Topic::ProposalOpenContract),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn expired_contract_without_profit_is_lost() {
    let (manager, _server, mut peer) = connected().await;
    let desk = TradingDesk::new(RequestCorrelator::new(manager));
    buy(&desk, &mut peer, &quoted("q-8", 10.0), 556).await;

    let mut open = desk.watch_positions();
    peer.send(update(556, json!({"profit": -10.0, "is_sold": 0, "status": "lost"})));
    open.changed().await.expect("settlement");
    assert_eq!(desk.position(556).expect("position").status, PositionStatus::Lost);
    assert!(desk.open_positions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn selling_at_market_settles_the_position() {
    let (manager, _server, mut peer) = connected().await;
    let desk = TradingDesk::new(RequestCorrelator::new(manager.clone()));
    buy(&desk, &mut peer, &quoted("q-1", 10.0), 701).await;
    buy(&desk, &mut peer, &quoted("q-2", 10.0), 702).await;

    let (receipt, _) = tokio::join!(desk.sell_position(701), async {
        let frame = peer.recv().await.expect("sell frame");
        assert_eq!(frame["sell"], json!(701));
        assert_eq!(frame["price"].as_f64(), Some(0.0));
        peer.send(reply(
            "sell",
            req_id(&frame),
            json!({"sold_for": "12.50", "contract_id": 701, "balance_after": 10002.5}),
        ));
    });
    assert_eq!(receipt.expect("sale").sold_for, 12.5);
    let sold = desk.position(701).expect("position");
    assert_eq!(sold.status, PositionStatus::Won);
    assert_eq!(sold.current_price, 12.5);
    assert_eq!(sold.profit, 2.5);

    let (receipt, _) = tokio::join!(desk.sell_position(702), async {
        let frame = peer.recv().await.expect("sell frame");
        peer.send(reply("sell", req_id(&frame), json!({"sold_for": 9.0})));
    });
    receipt.expect("sale");
    assert_eq!(desk.position(702).expect("position").status, PositionStatus::Lost);

    assert!(desk.open_positions().is_empty());
    assert!(desk.followed_contracts().is_empty());
    assert_eq!(
        manager.registry().listener_count(&Topic::ProposalOpenContract),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_purchase_records_nothing() {
    let (manager, _server, mut peer) = connected().await;
    let desk = TradingDesk::new(RequestCorrelator::new(manager));
    let proposal = quoted("q-stale", 10.0);

    let (outcome, _) = tokio::join!(
        desk.buy_contract(&proposal, BuyOrder::at_ask(&proposal)),
        async {
            let frame = peer.recv().await.expect("buy frame");
            peer.send(error_reply("buy", req_id(&frame), "InvalidContractProposal"));
        }
    );

    match outcome {
        Err(RequestError::Api(err)) => assert_eq!(err.code, "InvalidContractProposal"),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(desk.open_positions().is_empty());
    assert!(desk.followed_contracts().is_empty());
    assert_silent(&mut peer, std::time::Duration::from_secs(1)).await;
}
