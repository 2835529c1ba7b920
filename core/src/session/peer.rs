// Peer connection manager: one transport session per peer
//
// Drives the offer/answer/candidate handshake. Each asynchronous step runs
// in its own task and reports back as `Input::Negotiated`, stamped with
// the session generation so results for a session that has since been
// closed or replaced are discarded.

use crate::engine::Input;
use crate::error::{describe, MeshError, NegotiationStage};
use crate::signaling::Signal;
use crate::transport::{PeerSession, PeerTransport, SessionContext, SessionRole, TransportEvents};
use crate::types::{IceCandidate, IceServer, MediaStream, PeerId, SdpType, SessionDescription};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, trace, warn};

/// Per-peer negotiation state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    New,
    OfferSent,
    OfferReceived,
    AnswerSent,
    Connected,
    Failed,
    Closed,
}

impl SessionState {
    fn rank(self) -> u8 {
        match self {
            SessionState::New => 0,
            SessionState::OfferSent | SessionState::OfferReceived => 1,
            SessionState::AnswerSent => 2,
            SessionState::Connected => 3,
            SessionState::Failed => 4,
            SessionState::Closed => 5,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }
}

/// Result of one asynchronous negotiation step.
#[derive(Debug, Clone)]
pub(crate) enum NegotiationStep {
    /// Local description created and applied; it must go to the relay
    LocalDescription(SessionDescription),
    /// Remote description applied; buffered candidates may flow
    RemoteApplied,
    Failed {
        stage: NegotiationStage,
        reason: String,
    },
}

/// What the engine must do after a negotiation step.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum StepOutcome {
    Send(Signal),
    Failed(MeshError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    /// No session for that peer; dropped
    Unknown,
    Duplicate,
    /// Held until the remote description is applied
    Buffered,
    Applying,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub peer_id: PeerId,
    pub role: SessionRole,
    pub state: SessionState,
    pub has_channel: bool,
    pub pending_candidates: usize,
}

struct Session {
    role: SessionRole,
    state: SessionState,
    handle: Arc<dyn PeerSession>,
    generation: u64,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    seen_candidates: HashSet<IceCandidate>,
}

impl Session {
    fn advance(&mut self, next: SessionState) -> bool {
        if self.state.is_terminal() || next.rank() <= self.state.rank() {
            return false;
        }
        self.state = next;
        true
    }
}

pub struct PeerConnectionManager {
    transport: Arc<dyn PeerTransport>,
    ice_servers: Vec<IceServer>,
    inputs: UnboundedSender<Input>,
    sessions: BTreeMap<PeerId, Session>,
    next_generation: u64,
}

impl PeerConnectionManager {
    pub(crate) fn new(
        transport: Arc<dyn PeerTransport>,
        ice_servers: Vec<IceServer>,
        inputs: UnboundedSender<Input>,
    ) -> Self {
        Self {
            transport,
            ice_servers,
            inputs,
            sessions: BTreeMap::new(),
            next_generation: 0,
        }
    }

    /// Open a session to `peer_id` and attach `streams`.
    ///
    /// Returns `Ok(false)` when a session already exists.
    pub fn open(
        &mut self,
        peer_id: &PeerId,
        role: SessionRole,
        local_id: &PeerId,
        streams: &[MediaStream],
    ) -> Result<bool, MeshError> {
        if self.sessions.contains_key(peer_id) {
            return Ok(false);
        }
        self.next_generation += 1;
        let generation = self.next_generation;

        let tx = self.inputs.clone();
        let owner = peer_id.clone();
        let events = TransportEvents::new(move |event| {
            let _ = tx.send(Input::Transport {
                peer_id: owner.clone(),
                generation,
                event,
            });
        });
        let ctx = SessionContext {
            local_id: local_id.clone(),
            peer_id: peer_id.clone(),
            role,
            ice_servers: self.ice_servers.clone(),
        };
        let handle = self
            .transport
            .open(ctx, events)
            .map_err(|e| MeshError::negotiation(peer_id, NegotiationStage::OpenSession, describe(&e)))?;

        for stream in streams {
            if let Err(e) = handle.attach_stream(stream) {
                handle.close();
                return Err(MeshError::negotiation(
                    peer_id,
                    NegotiationStage::OpenSession,
                    format!("attach stream {}: {}", stream.id, describe(&e)),
                ));
            }
        }

        info!(peer_id = %peer_id, ?role, "Session opened");
        self.sessions.insert(
            peer_id.clone(),
            Session {
                role,
                state: SessionState::New,
                handle,
                generation,
                remote_description_set: false,
                pending_candidates: Vec::new(),
                seen_candidates: HashSet::new(),
            },
        );
        Ok(true)
    }

    /// Create and apply an offer for a local-initiator session.
    pub fn start_offer(&mut self, peer_id: &PeerId) -> bool {
        let Some(session) = self.sessions.get(peer_id) else {
            return false;
        };
        if session.role != SessionRole::LocalInitiator || session.state != SessionState::New {
            return false;
        }
        let handle = session.handle.clone();
        let generation = session.generation;
        let peer = peer_id.clone();
        let tx = self.inputs.clone();
        debug!(peer_id = %peer_id, "Creating offer");
        tokio::spawn(async move {
            let step = async {
                let offer = handle
                    .create_offer()
                    .await
                    .map_err(|e| (NegotiationStage::CreateOffer, describe(&e)))?;
                handle
                    .set_local_description(offer.clone())
                    .await
                    .map_err(|e| (NegotiationStage::SetLocalDescription, describe(&e)))?;
                Ok::<_, (NegotiationStage, String)>(offer)
            }
            .await;
            let step = match step {
                Ok(offer) => NegotiationStep::LocalDescription(offer),
                Err((stage, reason)) => NegotiationStep::Failed { stage, reason },
            };
            let _ = tx.send(Input::Negotiated {
                peer_id: peer,
                generation,
                step,
            });
        });
        true
    }

    /// Remote offer for a responder session: apply it and answer.
    pub fn on_offer(&mut self, peer_id: &PeerId, offer: SessionDescription) -> bool {
        let Some(session) = self.sessions.get_mut(peer_id) else {
            warn!(peer_id = %peer_id, "Offer for unknown session dropped");
            return false;
        };
        if !session.advance(SessionState::OfferReceived) {
            warn!(peer_id = %peer_id, state = ?session.state, "Unexpected offer ignored");
            return false;
        }
        let handle = session.handle.clone();
        let generation = session.generation;
        let peer = peer_id.clone();
        let tx = self.inputs.clone();
        tokio::spawn(async move {
            let post = |step| {
                let _ = tx.send(Input::Negotiated {
                    peer_id: peer.clone(),
                    generation,
                    step,
                });
            };
            if let Err(e) = handle.set_remote_description(offer).await {
                post(NegotiationStep::Failed {
                    stage: NegotiationStage::SetRemoteDescription,
                    reason: describe(&e),
                });
                return;
            }
            post(NegotiationStep::RemoteApplied);
            let answer = match handle.create_answer().await {
                Ok(answer) => answer,
                Err(e) => {
                    post(NegotiationStep::Failed {
                        stage: NegotiationStage::CreateAnswer,
                        reason: describe(&e),
                    });
                    return;
                }
            };
            match handle.set_local_description(answer.clone()).await {
                Ok(()) => post(NegotiationStep::LocalDescription(answer)),
                Err(e) => post(NegotiationStep::Failed {
                    stage: NegotiationStage::SetLocalDescription,
                    reason: describe(&e),
                }),
            }
        });
        true
    }

    /// Remote answer for an initiator session.
    pub fn on_answer(&mut self, peer_id: &PeerId, answer: SessionDescription) -> bool {
        let Some(session) = self.sessions.get(peer_id) else {
            warn!(peer_id = %peer_id, "Answer for unknown session dropped");
            return false;
        };
        if session.role != SessionRole::LocalInitiator
            || session.state != SessionState::OfferSent
            || session.remote_description_set
        {
            warn!(peer_id = %peer_id, state = ?session.state, "Unexpected answer ignored");
            return false;
        }
        let handle = session.handle.clone();
        let generation = session.generation;
        let peer = peer_id.clone();
        let tx = self.inputs.clone();
        tokio::spawn(async move {
            let step = match handle.set_remote_description(answer).await {
                Ok(()) => NegotiationStep::RemoteApplied,
                Err(e) => NegotiationStep::Failed {
                    stage: NegotiationStage::SetRemoteDescription,
                    reason: describe(&e),
                },
            };
            let _ = tx.send(Input::Negotiated {
                peer_id: peer,
                generation,
                step,
            });
        });
        true
    }

    /// Trickled candidate from the relay.
    pub fn on_remote_candidate(
        &mut self,
        peer_id: &PeerId,
        candidate: IceCandidate,
    ) -> CandidateOutcome {
        let Some(session) = self.sessions.get_mut(peer_id) else {
            debug!(peer_id = %peer_id, "Candidate for unknown session dropped");
            return CandidateOutcome::Unknown;
        };
        if !session.seen_candidates.insert(candidate.clone()) {
            trace!(peer_id = %peer_id, "Duplicate candidate ignored");
            return CandidateOutcome::Duplicate;
        }
        if !session.remote_description_set {
            session.pending_candidates.push(candidate);
            return CandidateOutcome::Buffered;
        }
        Self::apply_candidates(peer_id, session.handle.clone(), vec![candidate]);
        CandidateOutcome::Applying
    }

    fn apply_candidates(peer_id: &PeerId, handle: Arc<dyn PeerSession>, candidates: Vec<IceCandidate>) {
        let peer = peer_id.clone();
        tokio::spawn(async move {
            for candidate in candidates {
                if let Err(e) = handle.add_ice_candidate(candidate).await {
                    warn!(peer_id = %peer, "Candidate rejected: {}", describe(&e));
                }
            }
        });
    }

    /// Whether `generation` is still the live session for `peer_id`.
    pub fn is_current(&self, peer_id: &PeerId, generation: u64) -> bool {
        self.sessions
            .get(peer_id)
            .map(|s| s.generation == generation)
            .unwrap_or(false)
    }

    pub(crate) fn on_negotiated(
        &mut self,
        peer_id: &PeerId,
        generation: u64,
        step: NegotiationStep,
    ) -> Option<StepOutcome> {
        let session = match self.sessions.get_mut(peer_id) {
            Some(s) if s.generation == generation => s,
            _ => {
                debug!(peer_id = %peer_id, generation, "Stale negotiation result discarded");
                return None;
            }
        };
        if session.state.is_terminal() {
            return None;
        }
        match step {
            NegotiationStep::LocalDescription(desc) => {
                let signal = match desc.kind {
                    SdpType::Offer => {
                        session.advance(SessionState::OfferSent);
                        Signal::Offer {
                            socket_id: peer_id.clone(),
                            sdp: desc,
                        }
                    }
                    SdpType::Answer => {
                        session.advance(SessionState::AnswerSent);
                        Signal::Answer {
                            socket_id: peer_id.clone(),
                            sdp: desc,
                        }
                    }
                };
                Some(StepOutcome::Send(signal))
            }
            NegotiationStep::RemoteApplied => {
                session.remote_description_set = true;
                let pending = std::mem::take(&mut session.pending_candidates);
                if !pending.is_empty() {
                    debug!(peer_id = %peer_id, count = pending.len(), "Flushing buffered candidates");
                    Self::apply_candidates(peer_id, session.handle.clone(), pending);
                }
                None
            }
            NegotiationStep::Failed { stage, reason } => {
                warn!(peer_id = %peer_id, %stage, "Negotiation failed: {}", reason);
                session.advance(SessionState::Failed);
                Some(StepOutcome::Failed(MeshError::negotiation(peer_id, stage, reason)))
            }
        }
    }

    /// Put a session in its failed terminal state.
    pub fn mark_failed(&mut self, peer_id: &PeerId) {
        if let Some(session) = self.sessions.get_mut(peer_id) {
            session.advance(SessionState::Failed);
        }
    }

    pub fn on_connected(&mut self, peer_id: &PeerId) -> bool {
        match self.sessions.get_mut(peer_id) {
            Some(session) => {
                let advanced = session.advance(SessionState::Connected);
                if advanced {
                    info!(peer_id = %peer_id, "Session connected");
                }
                advanced
            }
            None => false,
        }
    }

    /// Release the transport handle and forget the session.
    pub fn close(&mut self, peer_id: &PeerId) -> bool {
        match self.sessions.remove(peer_id) {
            Some(mut session) => {
                session.advance(SessionState::Closed);
                session.handle.close();
                info!(peer_id = %peer_id, "Session closed");
                true
            }
            None => false,
        }
    }

    pub fn handle(&self, peer_id: &PeerId) -> Option<Arc<dyn PeerSession>> {
        self.sessions.get(peer_id).map(|s| s.handle.clone())
    }

    pub fn state(&self, peer_id: &PeerId) -> Option<SessionState> {
        self.sessions.get(peer_id).map(|s| s.state)
    }

    /// Sessions that can still carry traffic.
    pub fn live_peers(&self) -> Vec<PeerId> {
        self.sessions
            .iter()
            .filter(|(_, s)| !s.state.is_terminal())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.sessions.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshot(&self, peer_id: &PeerId, has_channel: bool) -> Option<SessionSnapshot> {
        self.sessions.get(peer_id).map(|s| SessionSnapshot {
            peer_id: peer_id.clone(),
            role: s.role,
            state: s.state,
            has_channel,
            pending_candidates: s.pending_candidates.len(),
        })
    }
}
