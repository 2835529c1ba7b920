// Channel wire format
//
// Chat: `{"type":"message","data":"hi"}`.
// File control: `{"type":"file","signal":"ask"|"accept"|"refuse"|"chunk","sendId":..., ...}`.

use crate::error::MeshError;
use crate::types::SendId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelMessage {
    Message { data: String },
    File(FileSignal),
}

/// File-transfer control and data signals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "lowercase")]
pub enum FileSignal {
    #[serde(rename_all = "camelCase")]
    Ask {
        send_id: SendId,
        name: String,
        size: u64,
    },
    #[serde(rename_all = "camelCase")]
    Accept { send_id: SendId },
    #[serde(rename_all = "camelCase")]
    Refuse { send_id: SendId },
    #[serde(rename_all = "camelCase")]
    Chunk {
        send_id: SendId,
        data: String,
        last: bool,
        #[serde(default)]
        percent: f64,
    },
}

impl FileSignal {
    pub fn send_id(&self) -> &SendId {
        match self {
            FileSignal::Ask { send_id, .. }
            | FileSignal::Accept { send_id }
            | FileSignal::Refuse { send_id }
            | FileSignal::Chunk { send_id, .. } => send_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FileSignal::Ask { .. } => "ask",
            FileSignal::Accept { .. } => "accept",
            FileSignal::Refuse { .. } => "refuse",
            FileSignal::Chunk { .. } => "chunk",
        }
    }
}

impl ChannelMessage {
    pub fn chat(text: impl Into<String>) -> Self {
        ChannelMessage::Message { data: text.into() }
    }

    pub fn encode(&self) -> Result<String, MeshError> {
        serde_json::to_string(self).map_err(|e| MeshError::Protocol(e.to_string()))
    }
}

/// Inbound channel payload after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Chat(String),
    File(FileSignal),
}

/// `type == "file"` goes to the transfer protocol; anything else is chat.
pub fn classify(text: &str) -> Result<Incoming, MeshError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| MeshError::Protocol(format!("channel payload is not JSON: {}", e)))?;

    if value.get("type").and_then(Value::as_str) == Some("file") {
        return serde_json::from_value(value)
            .map(Incoming::File)
            .map_err(|e| MeshError::Protocol(format!("bad file signal: {}", e)));
    }

    let text = match value.get("data") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    Ok(Incoming::Chat(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_wire_shape() {
        let text = ChannelMessage::chat("hi").encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"type": "message", "data": "hi"}));
    }

    #[test]
    fn test_ask_wire_shape() {
        let msg = ChannelMessage::File(FileSignal::Ask {
            send_id: SendId::new("s1"),
            name: "a.txt".into(),
            size: 12,
        });
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "file", "signal": "ask", "sendId": "s1", "name": "a.txt", "size": 12})
        );
    }

    #[test]
    fn test_classify_file_signals() {
        let incoming =
            classify(r#"{"type":"file","signal":"chunk","sendId":"s","data":"ab","last":true,"percent":100}"#)
                .unwrap();
        assert_eq!(
            incoming,
            Incoming::File(FileSignal::Chunk {
                send_id: SendId::new("s"),
                data: "ab".into(),
                last: true,
                percent: 100.0,
            })
        );
        assert!(matches!(
            classify(r#"{"type":"file","signal":"accept","sendId":"s"}"#).unwrap(),
            Incoming::File(FileSignal::Accept { .. })
        ));
    }

    #[test]
    fn test_anything_else_is_chat() {
        assert_eq!(
            classify(r#"{"type":"message","data":"hello"}"#).unwrap(),
            Incoming::Chat("hello".into())
        );
        assert_eq!(
            classify(r#"{"type":"emoji","data":42}"#).unwrap(),
            Incoming::Chat("42".into())
        );
        assert_eq!(classify(r#"{}"#).unwrap(), Incoming::Chat(String::new()));
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(classify("nope"), Err(MeshError::Protocol(_))));
        assert!(matches!(
            classify(r#"{"type":"file","signal":"close","sendId":"s"}"#),
            Err(MeshError::Protocol(_))
        ));
    }
}
