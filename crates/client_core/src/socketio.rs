//! Engine.IO v4 / Socket.IO v5 text framing.
//!
//! Only the text subset the messaging namespace uses is supported: no binary
//! attachments and no long-polling payload batching.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("empty frame")]
    Empty,
    #[error("unknown engine packet type '{0}'")]
    UnknownEngineType(char),
    #[error("unknown socket packet type '{0}'")]
    UnknownSocketType(char),
    #[error("binary packets are not supported")]
    Binary,
    #[error("invalid packet payload: {0}")]
    Payload(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    pub sid: String,
    #[serde(default)]
    pub ping_interval: u64,
    #[serde(default)]
    pub ping_timeout: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenHandshake),
    Close,
    Ping,
    Pong,
    Message(SocketPacket),
    Noop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect {
        nsp: String,
        data: Option<Value>,
    },
    Disconnect {
        nsp: String,
    },
    Event {
        nsp: String,
        ack: Option<u64>,
        name: String,
        data: Value,
    },
    Ack {
        nsp: String,
        ack: u64,
        data: Value,
    },
    ConnectError {
        nsp: String,
        message: String,
    },
}

impl SocketPacket {
    pub fn nsp(&self) -> &str {
        match self {
            Self::Connect { nsp, .. }
            | Self::Disconnect { nsp }
            | Self::Event { nsp, .. }
            | Self::Ack { nsp, .. }
            | Self::ConnectError { nsp, .. } => nsp,
        }
    }

    pub fn event(nsp: &str, name: impl Into<String>, data: Value) -> Self {
        Self::Event {
            nsp: nsp.to_string(),
            ack: None,
            name: name.into(),
            data,
        }
    }
}

impl EnginePacket {
    pub fn decode(frame: &str) -> Result<Self, CodecError> {
        let mut chars = frame.chars();
        let kind = chars.next().ok_or(CodecError::Empty)?;
        let rest = chars.as_str();
        match kind {
            '0' => serde_json::from_str(rest)
                .map(Self::Open)
                .map_err(|err| CodecError::Payload(err.to_string())),
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping),
            '3' => Ok(Self::Pong),
            '4' => decode_socket(rest).map(Self::Message),
            '6' => Ok(Self::Noop),
            other => Err(CodecError::UnknownEngineType(other)),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Open(handshake) => format!(
                "0{}",
                serde_json::to_string(handshake).unwrap_or_else(|_| "{}".into())
            ),
            Self::Close => "1".into(),
            Self::Ping => "2".into(),
            Self::Pong => "3".into(),
            Self::Message(packet) => format!("4{}", encode_socket(packet)),
            Self::Noop => "6".into(),
        }
    }
}

fn nsp_prefix(nsp: &str) -> String {
    if nsp == "/" || nsp.is_empty() {
        String::new()
    } else {
        format!("{nsp},")
    }
}

fn encode_socket(packet: &SocketPacket) -> String {
    match packet {
        SocketPacket::Connect { nsp, data } => {
            let body = data.as_ref().map(Value::to_string).unwrap_or_default();
            format!("0{}{body}", nsp_prefix(nsp))
        }
        SocketPacket::Disconnect { nsp } => format!("1{}", nsp_prefix(nsp)),
        SocketPacket::Event {
            nsp,
            ack,
            name,
            data,
        } => {
            let args = Value::Array(vec![Value::String(name.clone()), data.clone()]);
            let ack = ack.map(|id| id.to_string()).unwrap_or_default();
            format!("2{}{ack}{args}", nsp_prefix(nsp))
        }
        SocketPacket::Ack { nsp, ack, data } => {
            let args = match data {
                Value::Array(_) => data.clone(),
                other => Value::Array(vec![other.clone()]),
            };
            format!("3{}{ack}{args}", nsp_prefix(nsp))
        }
        SocketPacket::ConnectError { nsp, message } => {
            let body = serde_json::json!({ "message": message });
            format!("4{}{body}", nsp_prefix(nsp))
        }
    }
}

fn decode_socket(frame: &str) -> Result<SocketPacket, CodecError> {
    let mut chars = frame.chars();
    let kind = chars.next().ok_or(CodecError::Empty)?;
    if matches!(kind, '5' | '6') {
        return Err(CodecError::Binary);
    }
    let mut rest = chars.as_str();

    let nsp = if rest.starts_with('/') {
        let (nsp, tail) = match rest.find(',') {
            Some(idx) => (&rest[..idx], &rest[idx + 1..]),
            None => (rest, ""),
        };
        rest = tail;
        nsp.to_string()
    } else {
        "/".to_string()
    };

    let digits = rest.chars().take_while(char::is_ascii_digit).count();
    let ack = if digits > 0 {
        let id = rest[..digits]
            .parse::<u64>()
            .map_err(|err| CodecError::Payload(err.to_string()))?;
        rest = &rest[digits..];
        Some(id)
    } else {
        None
    };

    let payload = if rest.is_empty() {
        None
    } else {
        Some(
            serde_json::from_str::<Value>(rest)
                .map_err(|err| CodecError::Payload(err.to_string()))?,
        )
    };

    match kind {
        '0' => Ok(SocketPacket::Connect { nsp, data: payload }),
        '1' => Ok(SocketPacket::Disconnect { nsp }),
        '2' => {
            let Some(Value::Array(mut args)) = payload else {
                return Err(CodecError::Payload("event payload must be an array".into()));
            };
            if args.is_empty() {
                return Err(CodecError::Payload("event payload is missing its name".into()));
            }
            let Value::String(name) = args.remove(0) else {
                return Err(CodecError::Payload("event name must be a string".into()));
            };
            let data = if args.is_empty() {
                Value::Null
            } else {
                args.remove(0)
            };
            Ok(SocketPacket::Event {
                nsp,
                ack,
                name,
                data,
            })
        }
        '3' => Ok(SocketPacket::Ack {
            nsp,
            ack: ack.ok_or_else(|| CodecError::Payload("ack packet without id".into()))?,
            data: payload.unwrap_or(Value::Null),
        }),
        '4' => {
            let message = match payload {
                Some(Value::Object(fields)) => fields
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("connection refused")
                    .to_string(),
                Some(Value::String(message)) => message,
                _ => "connection refused".to_string(),
            };
            Ok(SocketPacket::ConnectError { nsp, message })
        }
        other => Err(CodecError::UnknownSocketType(other)),
    }
}

#[cfg(test)]
#[path = "tests/socketio_tests.rs"]
mod tests;
