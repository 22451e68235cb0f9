//! The `Transport` capability contract (spec.md §1: "raw secure-socket
//! transport and JSON parsing") plus a `tokio-tungstenite`-backed
//! implementation. `RelayConnection` is generic over `Transport` so tests
//! can drive it with an in-memory fake. Grounded on the per-relay task
//! pattern in the pack's overlord/minion reference sources, which is the
//! only place in the whole retrieval pack that hand-rolls a relay socket
//! instead of delegating to an SDK client.

use crate::error::TransportError;
use crate::model::{Event, EventId, Filter};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// A frame from the relay, tagged by its first wire-array element (§6).
#[derive(Debug, Clone)]
pub enum Frame {
    Event { sub_id: String, event: Box<Event> },
    Eose { sub_id: String },
    Closed { sub_id: String, reason: String },
    Ok { event_id: EventId, accepted: bool, message: String },
    Notice { message: String },
}

/// An outbound request queued to a relay.
#[derive(Debug, Clone)]
pub enum ClientRequest {
    Publish(Event),
    Req { sub_id: String, filters: Vec<Filter> },
    Close { sub_id: String },
}

impl ClientRequest {
    fn to_wire_json(&self) -> Result<String, TransportError> {
        let value = match self {
            ClientRequest::Publish(event) => {
                let event_json = serde_json::to_value(event)
                    .map_err(|e| TransportError::SendFailed(e.to_string()))?;
                Value::Array(vec![Value::String("EVENT".into()), event_json])
            }
            ClientRequest::Req { sub_id, filters } => {
                let mut arr = vec![Value::String("REQ".into()), Value::String(sub_id.clone())];
                for filter in filters {
                    arr.push(
                        serde_json::to_value(filter)
                            .map_err(|e| TransportError::SendFailed(e.to_string()))?,
                    );
                }
                Value::Array(arr)
            }
            ClientRequest::Close { sub_id } => Value::Array(vec![
                Value::String("CLOSE".into()),
                Value::String(sub_id.clone()),
            ]),
        };
        Ok(value.to_string())
    }
}

fn parse_frame(text: &str) -> Result<Frame, TransportError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| TransportError::ProtocolParse(e.to_string()))?;
    let arr = value
        .as_array()
        .ok_or_else(|| TransportError::ProtocolParse("frame is not a JSON array".into()))?;
    let tag = arr
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| TransportError::ProtocolParse("frame missing tag".into()))?;

    let str_at = |i: usize| -> Result<String, TransportError> {
        arr.get(i)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| TransportError::ProtocolParse(format!("frame missing field {i}")))
    };

    match tag {
        "EVENT" => {
            let sub_id = str_at(1)?;
            let event: Event = serde_json::from_value(arr.get(2).cloned().unwrap_or(Value::Null))
                .map_err(|e| TransportError::ProtocolParse(e.to_string()))?;
            Ok(Frame::Event {
                sub_id,
                event: Box::new(event),
            })
        }
        "EOSE" => Ok(Frame::Eose { sub_id: str_at(1)? }),
        "CLOSED" => Ok(Frame::Closed {
            sub_id: str_at(1)?,
            reason: str_at(2).unwrap_or_default(),
        }),
        "OK" => {
            let event_id = EventId::from_hex(&str_at(1)?)
                .map_err(|e| TransportError::ProtocolParse(e.to_string()))?;
            let accepted = arr.get(2).and_then(Value::as_bool).unwrap_or(false);
            Ok(Frame::Ok {
                event_id,
                accepted,
                message: str_at(3).unwrap_or_default(),
            })
        }
        "NOTICE" => Ok(Frame::Notice {
            message: str_at(1).unwrap_or_default(),
        }),
        other => Err(TransportError::ProtocolParse(format!("unknown frame tag {other}"))),
    }
}

/// The boundary `RelayConnection` drives. A single value owns both
/// directions of the socket; callers interleave `send`/`next_frame` calls
/// themselves (typically from within a `tokio::select!`).
pub trait Transport: Send + Sized + 'static {
    fn connect(url: String, timeout: Duration) -> impl Future<Output = Result<Self, TransportError>> + Send;
    fn send(&mut self, request: &ClientRequest) -> impl Future<Output = Result<(), TransportError>> + Send;
    fn next_frame(&mut self) -> impl Future<Output = Result<Frame, TransportError>> + Send;
    fn close(self) -> impl Future<Output = ()> + Send;
}

pub struct TungsteniteTransport {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Transport for TungsteniteTransport {
    async fn connect(url: String, timeout: Duration) -> Result<Self, TransportError> {
        let attempt = tokio_tungstenite::connect_async(&url);
        let (socket, _response) = tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| TransportError::ConnectFailed(format!("{url}: timed out")))?
            .map_err(|e| TransportError::ConnectFailed(format!("{url}: {e}")))?;
        Ok(Self { socket })
    }

    async fn send(&mut self, request: &ClientRequest) -> Result<(), TransportError> {
        let text = request.to_wire_json()?;
        self.socket
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn next_frame(&mut self) -> Result<Frame, TransportError> {
        loop {
            let message = self
                .socket
                .next()
                .await
                .ok_or(TransportError::Closed)?
                .map_err(|e| TransportError::ProtocolParse(e.to_string()))?;
            match message {
                WsMessage::Text(text) => return parse_frame(&text),
                WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
                WsMessage::Close(_) => return Err(TransportError::Closed),
                WsMessage::Binary(_) | WsMessage::Frame(_) => continue,
            }
        }
    }

    async fn close(mut self) {
        let _ = self.socket.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{giftwrap_filter, PubKey};

    #[test]
    fn req_encodes_tagged_array() {
        let request = ClientRequest::Req {
            sub_id: "abc123".to_string(),
            filters: vec![giftwrap_filter(PubKey::from_bytes([1u8; 32]), None)],
        };
        let json = request.to_wire_json().unwrap();
        assert!(json.starts_with(r#"["REQ","abc123""#));
    }

    #[test]
    fn parses_eose_frame() {
        let frame = parse_frame(r#"["EOSE","sub-1"]"#).unwrap();
        assert!(matches!(frame, Frame::Eose { sub_id } if sub_id == "sub-1"));
    }

    #[test]
    fn rejects_unknown_tag() {
        assert!(parse_frame(r#"["WAT"]"#).is_err());
    }
}
