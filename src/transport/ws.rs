use futures_util::future::{self, BoxFuture};
use futures_util::{SinkExt, StreamExt};
use log::info;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

use super::{Link, Transport};
use crate::error::TransportError;

/// WebSocket transport over tokio-tungstenite.
///
/// Protocol-level pings are answered by tungstenite itself; only text frames
/// (and UTF-8 binary frames) are surfaced.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for WsTransport {
    fn connect(&self, endpoint: &Url) -> BoxFuture<'static, Result<Link, TransportError>> {
        let url = endpoint.as_str().to_owned();
        Box::pin(async move {
            info!("Connecting to {}", url);
            let (ws_stream, _) = connect_async(url).await.map_err(|e| match e {
                WsError::Io(io) => TransportError::Refused(io.to_string()),
                WsError::Http(resp) => TransportError::Refused(format!("http {}", resp.status())),
                other => TransportError::from(other),
            })?;

            let (sink, stream) = ws_stream.split();
            let sink = sink
                .sink_map_err(TransportError::from)
                .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text))));
            let stream = stream.filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Binary(bytes)) => String::from_utf8(bytes).ok().map(Ok),
                    Ok(Message::Close(_)) => Some(Err(TransportError::Closed)),
                    Ok(_) => None,
                    Err(e) => Some(Err(TransportError::from(e))),
                })
            });
            Ok(Link::new(sink, stream))
        })
    }
}
