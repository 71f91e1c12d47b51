#![allow(dead_code)]

use std::time::Duration;

use brokerlink::transport::{MemoryPeer, MemoryServer};
use brokerlink::{BrokerConfig, ConnectionManager, ConnectionState, MemoryTransport};
use serde_json::{json, Value};
use url::Url;

pub const TOKEN: &str = "a1-test-token";

pub fn config() -> BrokerConfig {
    BrokerConfig::new(Url::parse("memory://broker").expect("url"))
}

pub fn authorized_config() -> BrokerConfig {
    config().with_auth_token(TOKEN)
}

pub fn start(config: BrokerConfig) -> (ConnectionManager, MemoryServer) {
    let (transport, server) = MemoryTransport::pair();
    let manager = ConnectionManager::new(config, transport).expect("manager");
    (manager, server)
}

pub async fn wait_state<F>(manager: &ConnectionManager, pred: F) -> ConnectionState
where
    F: Fn(&ConnectionState) -> bool,
{
    let mut rx = manager.state_changes();
    loop {
        let state = *rx.borrow_and_update();
        if pred(&state) {
            return state;
        }
        rx.changed().await.expect("state channel");
    }
}

pub fn authorize_ok() -> Value {
    json!({
        "msg_type": "authorize",
        "echo_req": {"authorize": "<not shown>"},
        "authorize": {
            "loginid": "VRTC1",
            "currency": "USD",
            "balance": 100.5,
            "is_virtual": 1
        }
    })
}

pub fn balance_frame(amount: f64) -> Value {
    json!({
        "msg_type": "balance",
        "echo_req": {"balance": 1, "subscribe": 1},
        "balance": {"balance": amount, "currency": "USD", "loginid": "VRTC1"},
        "subscription": {"id": "sub-balance"}
    })
}

/// Reply frame of kind `msg_type` echoing `req_id`.
pub fn reply(msg_type: &str, req_id: u64, body: Value) -> Value {
    let mut frame = json!({
        "msg_type": msg_type,
        "req_id": req_id,
        "echo_req": {"req_id": req_id},
    });
    frame[msg_type] = body;
    frame
}

pub fn error_reply(msg_type: &str, req_id: u64, code: &str) -> Value {
    json!({
        "msg_type": msg_type,
        "req_id": req_id,
        "echo_req": {"req_id": req_id},
        "error": {"code": code, "message": "rejected"}
    })
}

pub fn proposal_body(id: &str) -> Value {
    json!({
        "id": id,
        "ask_price": 10,
        "payout": "19.50",
        "spot": 1234.56,
        "display_value": "10.00",
        "longcode": "Win payout if ..."
    })
}

pub fn req_id(frame: &Value) -> u64 {
    frame["req_id"].as_u64().expect("frame carries req_id")
}

/// Accepts the next connection and completes authorization.
pub async fn accept_authorized(server: &mut MemoryServer) -> MemoryPeer {
    let mut peer = server.accept().await.expect("connection");
    assert_eq!(peer.recv().await, Some(json!({"authorize": TOKEN})));
    assert!(peer.send(authorize_ok()));
    assert_eq!(peer.recv().await, Some(json!({"balance": 1, "subscribe": 1})));
    peer
}

/// Manager without a token, connected and open.
pub async fn connected() -> (ConnectionManager, MemoryServer, MemoryPeer) {
    let (manager, mut server) = start(config());
    manager.connect();
    let peer = server.accept().await.expect("connection");
    wait_state(&manager, |s| *s == ConnectionState::Open).await;
    (manager, server, peer)
}

/// Asserts nothing but keep-alives arrives within `window`.
pub async fn assert_silent(peer: &mut MemoryPeer, window: Duration) {
    let next = tokio::time::timeout(window, peer.recv()).await;
    assert!(next.is_err(), "unexpected frame: {:?}", next);
}
