// Error taxonomy surfaced through events and command results

use crate::types::{PeerId, SendId};
use std::fmt;
use thiserror::Error;

/// Step of the offer/answer exchange that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStage {
    OpenSession,
    CreateOffer,
    CreateAnswer,
    SetLocalDescription,
    SetRemoteDescription,
    SendDescription,
}

impl fmt::Display for NegotiationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationStage::OpenSession => "open-session",
            NegotiationStage::CreateOffer => "create-offer",
            NegotiationStage::CreateAnswer => "create-answer",
            NegotiationStage::SetLocalDescription => "set-local-description",
            NegotiationStage::SetRemoteDescription => "set-remote-description",
            NegotiationStage::SendDescription => "send-description",
        };
        f.write_str(name)
    }
}

/// Errors produced by the mesh engine.
///
/// Every variant carries enough context (peer id, send id, cause) for a
/// consumer to decide what to do; the engine itself never retries.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MeshError {
    #[error("Relay transport error: {0}")]
    Transport(String),

    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(String),

    #[error("Negotiation with {peer_id} failed at {stage}: {reason}")]
    Negotiation {
        peer_id: PeerId,
        stage: NegotiationStage,
        reason: String,
    },

    #[error("Cannot create channel to {peer_id}: {reason}")]
    ChannelCreation { peer_id: PeerId, reason: String },

    #[error("Channel to {0} is missing or closed")]
    ChannelUnavailable(PeerId),

    #[error("Channel to {peer_id} reported an error: {reason}")]
    ChannelFailed { peer_id: PeerId, reason: String },

    #[error("Sending {send_id} to {peer_id} failed: {reason}")]
    TransferSend {
        send_id: SendId,
        peer_id: PeerId,
        reason: String,
    },

    #[error("Receiving {send_id} from {peer_id} failed: {reason}")]
    TransferReceive {
        send_id: SendId,
        peer_id: PeerId,
        reason: String,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Engine is not running")]
    EngineStopped,
}

impl MeshError {
    pub(crate) fn negotiation(
        peer_id: &PeerId,
        stage: NegotiationStage,
        cause: impl fmt::Display,
    ) -> Self {
        MeshError::Negotiation {
            peer_id: peer_id.clone(),
            stage,
            reason: cause.to_string(),
        }
    }

    pub(crate) fn send_failed(send_id: &SendId, peer_id: &PeerId, reason: impl fmt::Display) -> Self {
        MeshError::TransferSend {
            send_id: send_id.clone(),
            peer_id: peer_id.clone(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn receive_failed(
        send_id: &SendId,
        peer_id: &PeerId,
        reason: impl fmt::Display,
    ) -> Self {
        MeshError::TransferReceive {
            send_id: send_id.clone(),
            peer_id: peer_id.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Render a collaborator error with its whole context chain.
pub(crate) fn describe(err: &anyhow::Error) -> String {
    format!("{:#}", err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiation_error_display() {
        let err = MeshError::negotiation(
            &PeerId::new("p1"),
            NegotiationStage::CreateOffer,
            "no codecs",
        );
        assert_eq!(
            err.to_string(),
            "Negotiation with p1 failed at create-offer: no codecs"
        );
    }

    #[test]
    fn test_describe_keeps_context_chain() {
        let err = anyhow::anyhow!("socket reset").context("dial relay");
        assert_eq!(describe(&err), "dial relay: socket reset");
    }
}
