//! Engine.IO v4 / Socket.IO v5 text packet encoding.
//!
//! Over HTTP long-polling several Engine.IO packets share one body separated
//! by the ASCII record separator. A Socket.IO packet rides inside an Engine.IO
//! `message` packet, e.g. `42["hand_sign",{"hand_sign":"3"}]`.

use serde::Deserialize;
use serde_json::Value;

use crate::error::StreamError;

pub const RECORD_SEPARATOR: char = '\u{1e}';

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPayload {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EnginePacket {
    Open(OpenPayload),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn encode(&self) -> String {
        match self {
            // Only the server sends open packets; the data is informational.
            EnginePacket::Open(open) => format!("0{{\"sid\":\"{}\"}}", open.sid),
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(data) => format!("2{data}"),
            EnginePacket::Pong(data) => format!("3{data}"),
            EnginePacket::Message(data) => format!("4{data}"),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        }
    }

    pub fn decode(raw: &str) -> Result<Self, StreamError> {
        let mut chars = raw.chars();
        let kind = chars
            .next()
            .ok_or_else(|| StreamError::Protocol("empty engine packet".to_string()))?;
        let data = chars.as_str();

        match kind {
            '0' => serde_json::from_str(data)
                .map(EnginePacket::Open)
                .map_err(|err| StreamError::Protocol(format!("bad open packet: {err}"))),
            '1' => Ok(EnginePacket::Close),
            '2' => Ok(EnginePacket::Ping(data.to_string())),
            '3' => Ok(EnginePacket::Pong(data.to_string())),
            '4' => Ok(EnginePacket::Message(data.to_string())),
            '5' => Ok(EnginePacket::Upgrade),
            '6' => Ok(EnginePacket::Noop),
            'b' => Err(StreamError::Protocol(
                "binary engine packets are not supported".to_string(),
            )),
            other => Err(StreamError::Protocol(format!(
                "unknown engine packet type {other:?}"
            ))),
        }
    }
}

pub fn decode_payload(body: &str) -> Result<Vec<EnginePacket>, StreamError> {
    body.split(RECORD_SEPARATOR)
        .filter(|raw| !raw.is_empty())
        .map(EnginePacket::decode)
        .collect()
}

pub fn encode_payload(packets: &[EnginePacket]) -> String {
    let mut body = String::new();
    for (idx, packet) in packets.iter().enumerate() {
        if idx > 0 {
            body.push(RECORD_SEPARATOR);
        }
        body.push_str(&packet.encode());
    }
    body
}

#[derive(Clone, Debug, PartialEq)]
pub enum SocketPacket {
    Connect(Option<Value>),
    Disconnect,
    Event { name: String, args: Vec<Value> },
    Ack { id: u64, args: Vec<Value> },
    ConnectError(Value),
}

impl SocketPacket {
    pub fn event(name: &str, payload: &Value) -> Result<String, StreamError> {
        Ok(format!("2{}", serde_json::to_string(&(name, payload))?))
    }

    pub fn encode(&self) -> Result<String, StreamError> {
        Ok(match self {
            SocketPacket::Connect(None) => "0".to_string(),
            SocketPacket::Connect(Some(auth)) => format!("0{}", serde_json::to_string(auth)?),
            SocketPacket::Disconnect => "1".to_string(),
            SocketPacket::Event { name, args } => {
                let mut array = Vec::with_capacity(args.len() + 1);
                array.push(Value::String(name.clone()));
                array.extend(args.iter().cloned());
                format!("2{}", serde_json::to_string(&array)?)
            }
            SocketPacket::Ack { id, args } => format!("3{id}{}", serde_json::to_string(args)?),
            SocketPacket::ConnectError(data) => format!("4{}", serde_json::to_string(data)?),
        })
    }

    /// Decodes a packet on the default namespace. Packets for other
    /// namespaces and binary packets are rejected.
    pub fn decode(raw: &str) -> Result<Self, StreamError> {
        let mut chars = raw.chars();
        let kind = chars
            .next()
            .ok_or_else(|| StreamError::Protocol("empty socket packet".to_string()))?;
        let mut rest = chars.as_str();

        if rest.starts_with('/') {
            let (namespace, tail) = rest.split_once(',').unwrap_or((rest, ""));
            if namespace != "/" {
                return Err(StreamError::Protocol(format!(
                    "packet for unexpected namespace {namespace}"
                )));
            }
            rest = tail;
        }

        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        let (ack, json) = rest.split_at(digits);
        let ack_id = if ack.is_empty() {
            None
        } else {
            ack.parse::<u64>().ok()
        };

        let parse = |json: &str| -> Result<Value, StreamError> {
            serde_json::from_str(json)
                .map_err(|err| StreamError::Protocol(format!("bad socket payload: {err}")))
        };

        match kind {
            '0' => {
                if json.is_empty() {
                    Ok(SocketPacket::Connect(None))
                } else {
                    Ok(SocketPacket::Connect(Some(parse(json)?)))
                }
            }
            '1' => Ok(SocketPacket::Disconnect),
            '2' => {
                let mut array = match parse(json)? {
                    Value::Array(items) => items,
                    other => {
                        return Err(StreamError::Protocol(format!(
                            "event payload is not an array: {other}"
                        )));
                    }
                };
                if array.is_empty() {
                    return Err(StreamError::Protocol("event without a name".to_string()));
                }
                let name = match array.remove(0) {
                    Value::String(name) => name,
                    other => {
                        return Err(StreamError::Protocol(format!(
                            "event name is not a string: {other}"
                        )));
                    }
                };
                Ok(SocketPacket::Event { name, args: array })
            }
            '3' => {
                let args = match parse(json)? {
                    Value::Array(items) => items,
                    other => vec![other],
                };
                Ok(SocketPacket::Ack {
                    id: ack_id.unwrap_or_default(),
                    args,
                })
            }
            '4' => Ok(SocketPacket::ConnectError(if json.is_empty() {
                Value::Null
            } else {
                parse(json)?
            })),
            '5' | '6' => Err(StreamError::Protocol(
                "binary socket packets are not supported".to_string(),
            )),
            other => Err(StreamError::Protocol(format!(
                "unknown socket packet type {other:?}"
            ))),
        }
    }
}
