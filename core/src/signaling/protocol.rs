// Relay wire protocol: `{eventName, data}` text envelopes

use crate::types::{IceCandidate, PeerId, PeerRecord, SessionDescription};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Event names this engine understands.
pub const KNOWN_EVENTS: &[&str] = &[
    "join",
    "peers",
    "new_peer",
    "remove_peer",
    "ice_candidate",
    "offer",
    "answer",
];

/// A relay envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventName", content = "data", rename_all = "snake_case")]
pub enum Signal {
    /// Enter a room (outbound)
    Join { room: String },

    /// Full roster snapshot, the relay's answer to `join`
    #[serde(rename_all = "camelCase")]
    Peers {
        #[serde(default)]
        connections: Vec<PeerId>,
        #[serde(default)]
        avatars: Vec<String>,
        me: PeerId,
        #[serde(default)]
        myself_avatar: String,
    },

    #[serde(rename_all = "camelCase")]
    NewPeer {
        socket_id: PeerId,
        #[serde(default)]
        socket_avatar: String,
    },

    #[serde(rename_all = "camelCase")]
    RemovePeer { socket_id: PeerId },

    /// Trickled candidate; `socketId` names the target outbound and the
    /// origin inbound
    #[serde(rename_all = "camelCase")]
    IceCandidate {
        socket_id: PeerId,
        candidate: String,
        #[serde(default)]
        label: Option<u16>,
    },

    #[serde(rename_all = "camelCase")]
    Offer {
        socket_id: PeerId,
        sdp: SessionDescription,
    },

    #[serde(rename_all = "camelCase")]
    Answer {
        socket_id: PeerId,
        sdp: SessionDescription,
    },
}

impl Signal {
    pub fn event_name(&self) -> &'static str {
        match self {
            Signal::Join { .. } => "join",
            Signal::Peers { .. } => "peers",
            Signal::NewPeer { .. } => "new_peer",
            Signal::RemovePeer { .. } => "remove_peer",
            Signal::IceCandidate { .. } => "ice_candidate",
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
        }
    }

    pub fn candidate(peer_id: PeerId, candidate: IceCandidate) -> Self {
        Signal::IceCandidate {
            socket_id: peer_id,
            candidate: candidate.candidate,
            label: candidate.label,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Roster entries from a `peers` envelope; missing avatars become empty.
pub fn roster_entries(connections: &[PeerId], avatars: &[String]) -> Vec<PeerRecord> {
    connections
        .iter()
        .enumerate()
        .map(|(i, id)| PeerRecord::new(id.clone(), avatars.get(i).cloned().unwrap_or_default()))
        .collect()
}

/// Result of parsing one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Signal(Signal),
    /// Well-formed envelope with an event name we do not handle
    Named { name: String, data: Value },
    /// Known event name with a payload that does not fit it
    Malformed { name: String, reason: String },
    /// Anything without an event name
    Raw(Value),
}

pub fn parse_inbound(text: &str) -> Inbound {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("Relay frame is not JSON: {}", e);
            return Inbound::Raw(Value::String(text.to_string()));
        }
    };

    let name = match value.get("eventName").and_then(Value::as_str) {
        Some(name) => name.to_string(),
        None => return Inbound::Raw(value),
    };

    if !KNOWN_EVENTS.contains(&name.as_str()) {
        let data = value.get("data").cloned().unwrap_or(Value::Null);
        return Inbound::Named { name, data };
    }

    match serde_json::from_value::<Signal>(value) {
        Ok(signal) => Inbound::Signal(signal),
        Err(e) => Inbound::Malformed {
            name,
            reason: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_wire_shape() {
        let text = Signal::Join {
            room: "lobby".into(),
        }
        .encode()
        .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value, json!({"eventName": "join", "data": {"room": "lobby"}}));
    }

    #[test]
    fn test_offer_wire_shape() {
        let signal = Signal::Offer {
            socket_id: PeerId::new("p1"),
            sdp: SessionDescription::offer("v=0"),
        };
        let value = serde_json::to_value(&signal).unwrap();
        assert_eq!(value["eventName"], "offer");
        assert_eq!(value["data"]["socketId"], "p1");
        assert_eq!(value["data"]["sdp"]["type"], "offer");
    }

    #[test]
    fn test_parse_peers() {
        let text = r#"{"eventName":"peers","data":{"connections":["a","b"],"avatars":["x"],"me":"m","myselfAvatar":"z"}}"#;
        match parse_inbound(text) {
            Inbound::Signal(Signal::Peers {
                connections,
                avatars,
                me,
                myself_avatar,
            }) => {
                assert_eq!(me, PeerId::new("m"));
                assert_eq!(myself_avatar, "z");
                let roster = roster_entries(&connections, &avatars);
                assert_eq!(roster[0].avatar, "x");
                assert_eq!(roster[1].avatar, "");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_candidate_without_label() {
        let text = r#"{"eventName":"ice_candidate","data":{"socketId":"p","candidate":"c"}}"#;
        assert_eq!(
            parse_inbound(text),
            Inbound::Signal(Signal::IceCandidate {
                socket_id: PeerId::new("p"),
                candidate: "c".into(),
                label: None,
            })
        );
    }

    #[test]
    fn test_unknown_missing_and_malformed() {
        assert_eq!(
            parse_inbound(r#"{"eventName":"kick","data":{"why":1}}"#),
            Inbound::Named {
                name: "kick".into(),
                data: json!({"why": 1})
            }
        );
        assert_eq!(parse_inbound(r#"{"hello":1}"#), Inbound::Raw(json!({"hello": 1})));
        assert_eq!(
            parse_inbound("not json"),
            Inbound::Raw(Value::String("not json".into()))
        );
        assert!(matches!(
            parse_inbound(r#"{"eventName":"offer","data":{"socketId":"p"}}"#),
            Inbound::Malformed { .. }
        ));
    }
}
