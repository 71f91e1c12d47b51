use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use super::event::{ApiError, Candle, ErrorEvent, Event, History, Ohlc, Reply};
use super::{CorrelationId, REQ_ID_FIELD};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid json: {0}")]
    Json(String),
    #[error("frame is not a json object")]
    NotAnObject,
    #[error("malformed {msg_type} payload: {source}")]
    Payload {
        msg_type: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Result of classifying one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(Event),
    /// Reply to a keep-alive; answered, never published.
    HeartbeatEcho,
    /// Recognised shape with no topic (e.g. `forget` acks).
    Ignored { msg_type: String },
}

/// Parses a text frame and classifies it by its `msg_type` discriminator.
pub fn decode_frame(text: &str) -> Result<Inbound, DecodeError> {
    let mut bytes = text.as_bytes().to_vec();
    let value: Value =
        simd_json::from_slice(&mut bytes).map_err(|e| DecodeError::Json(e.to_string()))?;
    classify(value)
}

pub fn classify(value: Value) -> Result<Inbound, DecodeError> {
    let Value::Object(mut frame) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let msg_type = frame
        .get("msg_type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let error = frame.remove("error").map(parse_api_error);
    let echo_req = frame.remove("echo_req").unwrap_or(Value::Null);
    let req_id = correlation_id(frame.get(REQ_ID_FIELD), &echo_req);
    let subscription_id = frame
        .get("subscription")
        .and_then(|s| s.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let body = frame.remove(msg_type.as_str()).unwrap_or(Value::Null);

    let event = match msg_type.as_str() {
        "ping" => return Ok(Inbound::HeartbeatEcho),
        "authorize" => match error {
            Some(err) => Event::AuthorizationFailed(err),
            None => Event::Authorized(payload(&msg_type, body)?),
        },
        "proposal" => Event::Proposal(reply(req_id, echo_req, subscription_id, error, body)),
        "buy" => Event::Buy(reply(req_id, echo_req, subscription_id, error, body)),
        "sell" => Event::Sell(reply(req_id, echo_req, subscription_id, error, body)),
        "proposal_open_contract" => {
            Event::OpenContract(reply(req_id, echo_req, subscription_id, error, body))
        }
        // Non-reply kinds carrying an error go to the generic error topic.
        _ => match error {
            Some(err) => Event::Error(ErrorEvent::Protocol(err)),
            None => match stream_event(&msg_type, &echo_req, body)? {
                Some(event) => event,
                None => return Ok(Inbound::Ignored { msg_type }),
            },
        },
    };
    Ok(Inbound::Event(event))
}

fn stream_event(msg_type: &str, echo_req: &Value, mut body: Value) -> Result<Option<Event>, DecodeError> {
    let event = match msg_type {
        "balance" => Event::Balance(payload(msg_type, body)?),
        "tick" => Event::Tick(payload(msg_type, body)?),
        "active_symbols" => Event::ActiveSymbols(payload(msg_type, body)?),
        "history" => Event::History {
            symbol: history_symbol(echo_req),
            history: payload::<History>(msg_type, body)?,
        },
        "candles" => Event::Candles {
            symbol: history_symbol(echo_req),
            candles: payload::<Vec<Candle>>(msg_type, body)?,
        },
        "ohlc" => {
            // Streamed candles may omit the symbol the request already named.
            if let (Some(obj), Some(symbol)) = (body.as_object_mut(), history_symbol(echo_req)) {
                obj.entry("symbol").or_insert(Value::String(symbol));
            }
            Event::Ohlc(payload::<Ohlc>(msg_type, body)?)
        }
        _ => return Ok(None),
    };
    Ok(Some(event))
}

fn payload<T: DeserializeOwned>(msg_type: &str, body: Value) -> Result<T, DecodeError> {
    serde_json::from_value(body).map_err(|source| DecodeError::Payload {
        msg_type: msg_type.to_string(),
        source,
    })
}

fn reply<T: DeserializeOwned>(
    req_id: Option<CorrelationId>,
    echo_req: Value,
    subscription_id: Option<String>,
    error: Option<ApiError>,
    body: Value,
) -> Reply<T> {
    let body = match error {
        Some(err) => Err(err),
        None => serde_json::from_value(body)
            .map_err(|e| ApiError::new(ApiError::MALFORMED_REPLY, e.to_string())),
    };
    Reply {
        req_id,
        echo_req,
        subscription_id,
        body,
    }
}

fn parse_api_error(value: Value) -> ApiError {
    match value {
        Value::String(message) => ApiError::new("Unknown", message),
        other => serde_json::from_value(other.clone())
            .unwrap_or_else(|_| ApiError::new("Unknown", other.to_string())),
    }
}

/// Accepts the echoed token only if it is well-formed and, when the echoed
/// request repeats it, both copies agree.
fn correlation_id(top_level: Option<&Value>, echo_req: &Value) -> Option<CorrelationId> {
    let echoed = echo_req.get(REQ_ID_FIELD);
    match (top_level, echoed) {
        (Some(top), Some(echo)) => {
            let id = CorrelationId::from_json(top)?;
            (CorrelationId::from_json(echo)? == id).then_some(id)
        }
        (Some(top), None) => CorrelationId::from_json(top),
        (None, Some(echo)) => CorrelationId::from_json(echo),
        (None, None) => None,
    }
}

fn history_symbol(echo_req: &Value) -> Option<String> {
    echo_req
        .get("ticks_history")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::event::Balance;
    use crate::protocol::Topic;
    use serde_json::json;

    fn event(value: Value) -> Event {
        match classify(value).unwrap() {
            Inbound::Event(event) => event,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn test_balance_string_amount() {
        let ev = event(json!({
            "msg_type": "balance",
            "balance": {"balance": "100.50", "currency": "USD", "loginid": "VRTC1"},
            "echo_req": {"balance": 1, "subscribe": 1}
        }));
        assert_eq!(
            ev,
            Event::Balance(Balance {
                balance: 100.5,
                currency: "USD".into(),
                loginid: "VRTC1".into(),
            })
        );
    }

    #[test]
    fn test_authorize_error_is_classified() {
        let ev = event(json!({
            "msg_type": "authorize",
            "error": {"code": "InvalidToken", "message": "The token is invalid."},
            "echo_req": {"authorize": "<not shown>"}
        }));
        assert_eq!(
            ev,
            Event::AuthorizationFailed(ApiError::new("InvalidToken", "The token is invalid."))
        );
        assert_eq!(ev.topics(), vec![Topic::AuthorizeError]);
    }

    #[test]
    fn test_proposal_with_matching_req_id() {
        let ev = event(json!({
            "msg_type": "proposal",
            "req_id": 42,
            "echo_req": {"proposal": 1, "req_id": 42},
            "proposal": {"id": "p-1", "ask_price": 10, "payout": "19.5", "spot": 1234.5}
        }));
        let Event::Proposal(reply) = ev else { panic!("not a proposal") };
        assert_eq!(reply.req_id.map(CorrelationId::get), Some(42));
        let proposal = reply.body.unwrap();
        assert_eq!(proposal.id, "p-1");
        assert_eq!(proposal.payout, 19.5);
    }

    #[test]
    fn test_disagreeing_req_ids_are_dropped() {
        let ev = event(json!({
            "msg_type": "proposal",
            "req_id": 42,
            "echo_req": {"req_id": 43},
            "proposal": {"id": "p-1", "ask_price": 10, "payout": 20}
        }));
        assert_eq!(ev.req_id(), None);

        let ev = event(json!({
            "msg_type": "buy",
            "req_id": "42",
            "buy": {"contract_id": 1, "buy_price": 10, "payout": 20}
        }));
        assert_eq!(ev.req_id(), None);
    }

    #[test]
    fn test_reply_missing_fields_becomes_api_error() {
        let ev = event(json!({
            "msg_type": "proposal",
            "req_id": 7,
            "proposal": {"ask_price": 10}
        }));
        let err = ev.api_error().cloned().unwrap();
        assert_eq!(err.code, ApiError::MALFORMED_REPLY);
        assert_eq!(ev.req_id().map(CorrelationId::get), Some(7));
    }

    #[test]
    fn test_ping_and_unknown_frames() {
        assert_eq!(
            classify(json!({"msg_type": "ping", "ping": "pong"})).unwrap(),
            Inbound::HeartbeatEcho
        );
        assert_eq!(
            classify(json!({"msg_type": "forget_all", "forget_all": []})).unwrap(),
            Inbound::Ignored {
                msg_type: "forget_all".into()
            }
        );
        let ev = event(json!({
            "msg_type": "get_account_status",
            "error": {"code": "AuthorizationRequired", "message": "Please log in."}
        }));
        assert_eq!(ev.topics(), vec![Topic::Error]);
    }

    #[test]
    fn test_tick_error_goes_to_error_topic() {
        let ev = event(json!({
            "msg_type": "tick",
            "error": {"code": "MarketIsClosed", "message": "closed"},
            "echo_req": {"ticks": "frxEURUSD"}
        }));
        assert_eq!(
            ev,
            Event::Error(ErrorEvent::Protocol(ApiError::new("MarketIsClosed", "closed")))
        );
    }

    #[test]
    fn test_history_and_ohlc_pick_symbol_from_echo() {
        let ev = event(json!({
            "msg_type": "history",
            "echo_req": {"ticks_history": "R_50", "style": "ticks"},
            "history": {"prices": [1.5, 2.5], "times": [10, 11]}
        }));
        let Event::History { symbol, history } = ev else { panic!("not history") };
        assert_eq!(symbol.as_deref(), Some("R_50"));
        assert_eq!(history.prices, vec![1.5, 2.5]);

        let ev = event(json!({
            "msg_type": "ohlc",
            "echo_req": {"ticks_history": "R_50", "style": "candles"},
            "ohlc": {"epoch": 60, "open": "1.0", "high": "2.0", "low": "0.5", "close": "1.5", "granularity": 60}
        }));
        let Event::Ohlc(ohlc) = ev else { panic!("not ohlc") };
        assert_eq!(ohlc.symbol, "R_50");
        assert_eq!(ohlc.high, 2.0);
    }

    #[test]
    fn test_text_decoding() {
        let inbound = decode_frame(
            r#"{"msg_type":"tick","tick":{"symbol":"R_100","quote":123.45,"epoch":1}}"#,
        )
        .unwrap();
        let Inbound::Event(ev) = inbound else { panic!("not an event") };
        assert_eq!(ev.topics().len(), 2);

        assert!(matches!(decode_frame("not json"), Err(DecodeError::Json(_))));
        assert!(matches!(decode_frame("[1,2]"), Err(DecodeError::NotAnObject)));
        assert!(matches!(
            decode_frame(r#"{"msg_type":"tick","tick":{"quote":1}}"#),
            Err(DecodeError::Payload { .. })
        ));
    }
}
