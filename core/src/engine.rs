// Mesh engine: the single task that owns every map
//
// Relay frames, transport notifications, consumer commands and the
// completions of spawned asynchronous steps all arrive on one ordered input
// queue. The engine handles them one at a time, so the registry, session,
// channel and transfer maps are never shared. The transfer tick only exists
// while at least one record is SENDING.

use crate::channel::{classify, ChannelMessage, DataChannelManager, Incoming};
use crate::config::MeshConfig;
use crate::error::{describe, MeshError, NegotiationStage};
use crate::event::{Event, EventBus, EventStream};
use crate::session::peer::{NegotiationStep, StepOutcome};
use crate::session::{CandidateOutcome, PeerConnectionManager, SessionRegistry, SessionSnapshot};
use crate::signaling::protocol::roster_entries;
use crate::signaling::{
    Inbound, MemoryRelay, RelayDialer, RelayFrame, RelayInput, RelayLink, Signal, SignalingClient,
};
use crate::transfer::engine::FollowUp;
use crate::transfer::payload::decode_data_url;
use crate::transfer::{
    FileHandle, FileMeta, FileSink, TransferEngine, TransferSnapshot, CONNECTION_CLOSED,
};
use crate::transport::{
    LoopbackNetwork, MediaDevices, PeerTransport, SessionRole, StaticMedia, TransportEvent,
};
use crate::types::{
    IceCandidate, LocalIdentity, MediaConstraints, MediaStream, PeerId, PeerRecord, SdpType,
    SendId,
};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Consumer requests.
pub(crate) enum Command {
    Connect {
        address: String,
        reply: oneshot::Sender<Result<(), MeshError>>,
    },
    CreateStream {
        constraints: MediaConstraints,
    },
    BroadcastMessage {
        text: String,
        reply: oneshot::Sender<Result<Vec<PeerId>, MeshError>>,
    },
    BroadcastFile {
        file: FileHandle,
        reply: oneshot::Sender<Vec<SendId>>,
    },
    SendFile {
        peer_id: PeerId,
        file: FileHandle,
        reply: oneshot::Sender<Result<SendId, MeshError>>,
    },
    AcceptTransfer {
        peer_id: PeerId,
        send_id: SendId,
        reply: oneshot::Sender<Result<(), MeshError>>,
    },
    RefuseTransfer {
        peer_id: PeerId,
        send_id: SendId,
        reply: oneshot::Sender<Result<(), MeshError>>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerRecord>>,
    },
    LocalIdentity {
        reply: oneshot::Sender<Option<LocalIdentity>>,
    },
    Sessions {
        reply: oneshot::Sender<Vec<SessionSnapshot>>,
    },
    Transfers {
        reply: oneshot::Sender<Vec<TransferSnapshot>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Everything the engine reacts to.
pub(crate) enum Input {
    Command(Command),
    RelayDialed {
        connection: u64,
        result: Result<RelayLink, String>,
    },
    Relay {
        connection: u64,
        frame: RelayFrame,
    },
    Transport {
        peer_id: PeerId,
        generation: u64,
        event: TransportEvent,
    },
    Negotiated {
        peer_id: PeerId,
        generation: u64,
        step: NegotiationStep,
    },
    StreamResolved {
        result: Result<MediaStream, String>,
    },
    PayloadLoaded {
        send_id: SendId,
        result: Result<Vec<u8>, String>,
    },
    Materialized {
        send_id: SendId,
        peer_id: PeerId,
        file: FileMeta,
        result: Result<String, String>,
    },
}

/// External collaborators an engine is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub dialer: Arc<dyn RelayDialer>,
    pub transport: Arc<dyn PeerTransport>,
    pub media: Arc<dyn MediaDevices>,
    pub sink: Arc<dyn FileSink>,
}

impl Collaborators {
    pub fn new(
        dialer: Arc<dyn RelayDialer>,
        transport: Arc<dyn PeerTransport>,
        media: Arc<dyn MediaDevices>,
        sink: Arc<dyn FileSink>,
    ) -> Self {
        Self {
            dialer,
            transport,
            media,
            sink,
        }
    }

    /// In-process wiring: memory relay, loopback sessions, static media.
    pub fn loopback(relay: &MemoryRelay, network: &LoopbackNetwork, sink: Arc<dyn FileSink>) -> Self {
        Self {
            dialer: Arc::new(relay.clone()),
            transport: Arc::new(network.transport()),
            media: Arc::new(StaticMedia::new()),
            sink,
        }
    }
}

enum Wake {
    Input(Option<Input>),
    Tick,
}

pub struct MeshEngine {
    config: MeshConfig,
    bus: EventBus,
    inputs_tx: UnboundedSender<Input>,
    inputs: UnboundedReceiver<Input>,
    signaling: SignalingClient,
    registry: SessionRegistry,
    sessions: PeerConnectionManager,
    channels: DataChannelManager,
    transfers: TransferEngine,
    media: Arc<dyn MediaDevices>,
    sink: Arc<dyn FileSink>,
    streams: Vec<MediaStream>,
    streams_requested: usize,
    streams_resolved: usize,
    ready: bool,
    ticker: Option<Interval>,
}

impl MeshEngine {
    pub fn new(config: MeshConfig, collaborators: Collaborators) -> Self {
        let (inputs_tx, inputs) = mpsc::unbounded_channel();
        Self {
            bus: EventBus::new(),
            signaling: SignalingClient::new(collaborators.dialer, config.room.clone()),
            registry: SessionRegistry::new(),
            sessions: PeerConnectionManager::new(
                collaborators.transport,
                config.ice_servers.clone(),
                inputs_tx.clone(),
            ),
            channels: DataChannelManager::new(config.channel_label.clone()),
            transfers: TransferEngine::new(
                config.effective_chunk_size(),
                config.max_buffered_amount,
            ),
            media: collaborators.media,
            sink: collaborators.sink,
            streams: Vec::new(),
            streams_requested: 0,
            streams_resolved: 0,
            ready: false,
            ticker: None,
            inputs_tx,
            inputs,
            config,
        }
    }

    pub fn handle(&self) -> MeshHandle {
        MeshHandle {
            inputs: self.inputs_tx.clone(),
            bus: self.bus.clone(),
        }
    }

    /// Run the engine on the current tokio runtime.
    pub fn spawn(self) -> MeshHandle {
        let handle = self.handle();
        tokio::spawn(self.run());
        handle
    }

    /// Process inputs until `shutdown`.
    pub async fn run(mut self) {
        info!(room = %self.config.room, "Mesh engine started");
        loop {
            let wake = match self.ticker.as_mut() {
                Some(ticker) => tokio::select! {
                    input = self.inputs.recv() => Wake::Input(input),
                    _ = ticker.tick() => Wake::Tick,
                },
                None => Wake::Input(self.inputs.recv().await),
            };

            match wake {
                Wake::Tick => {
                    self.transfers.pump(&self.channels, &self.bus);
                }
                Wake::Input(Some(Input::Command(Command::Shutdown { reply }))) => {
                    self.inputs.close();
                    self.shutdown();
                    let _ = reply.send(());
                    break;
                }
                Wake::Input(Some(input)) => self.handle_input(input),
                Wake::Input(None) => break,
            }
            self.sync_ticker();
        }
        info!("Mesh engine stopped");
    }

    fn sync_ticker(&mut self) {
        let sending = self.transfers.is_sending();
        if sending && self.ticker.is_none() {
            let period = self.config.chunk_interval();
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.ticker = Some(ticker);
            trace!("Transfer tick started");
        } else if !sending && self.ticker.is_some() {
            self.ticker = None;
            trace!("Transfer tick stopped");
        }
    }

    fn handle_input(&mut self, input: Input) {
        match input {
            Input::Command(command) => self.handle_command(command),
            Input::RelayDialed { connection, result } => self.on_relay_dialed(connection, result),
            Input::Relay { connection, frame } => {
                match self.signaling.on_frame(connection, frame) {
                    Some(RelayInput::Message(inbound)) => self.on_relay_message(inbound),
                    Some(RelayInput::Error(reason)) => self.bus.publish(Event::SignalingError {
                        error: MeshError::Transport(reason),
                    }),
                    Some(RelayInput::Closed) => self.bus.publish(Event::SignalingClosed),
                    None => {}
                }
            }
            Input::Transport {
                peer_id,
                generation,
                event,
            } => {
                if self.sessions.is_current(&peer_id, generation) {
                    self.on_transport_event(peer_id, event);
                } else {
                    trace!(peer_id = %peer_id, ?event, "Event from a retired session dropped");
                }
            }
            Input::Negotiated {
                peer_id,
                generation,
                step,
            } => self.on_negotiated(peer_id, generation, step),
            Input::StreamResolved { result } => self.on_stream_resolved(result),
            Input::PayloadLoaded { send_id, result } => {
                self.transfers.payload_loaded(&send_id, result, &self.bus);
            }
            Input::Materialized {
                send_id,
                peer_id,
                file,
                result,
            } => match result {
                Ok(location) => {
                    info!(send_id = %send_id, location = %location, "Received file stored");
                    self.bus.publish(Event::TransferReceived {
                        send_id,
                        peer_id,
                        file,
                        location,
                    });
                }
                Err(reason) => {
                    warn!(send_id = %send_id, "Cannot store received file: {}", reason);
                    self.bus.publish(Event::TransferReceiveError {
                        error: MeshError::receive_failed(&send_id, &peer_id, reason),
                        send_id,
                        peer_id,
                    });
                }
            },
        }
    }

    // ===== COMMANDS =====

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { address, reply } => {
                let _ = reply.send(self.connect(address));
            }
            Command::CreateStream { constraints } => self.create_stream(constraints),
            Command::BroadcastMessage { text, reply } => {
                let result = self.channels.broadcast(&ChannelMessage::chat(text));
                let _ = reply.send(result);
            }
            Command::BroadcastFile { file, reply } => {
                let ids = self
                    .transfers
                    .broadcast_file(&file, &self.channels, &self.bus);
                let _ = reply.send(ids);
            }
            Command::SendFile {
                peer_id,
                file,
                reply,
            } => {
                let result = self
                    .transfers
                    .send_file(&peer_id, file, &self.channels, &self.bus);
                let _ = reply.send(result);
            }
            Command::AcceptTransfer {
                peer_id,
                send_id,
                reply,
            } => {
                let result = self
                    .transfers
                    .accept(&peer_id, &send_id, &self.channels, &self.bus);
                let _ = reply.send(result);
            }
            Command::RefuseTransfer {
                peer_id,
                send_id,
                reply,
            } => {
                let result = self
                    .transfers
                    .refuse(&peer_id, &send_id, &self.channels, &self.bus);
                let _ = reply.send(result);
            }
            Command::Peers { reply } => {
                let _ = reply.send(self.registry.peers());
            }
            Command::LocalIdentity { reply } => {
                let _ = reply.send(self.registry.local().cloned());
            }
            Command::Sessions { reply } => {
                let snapshots = self
                    .sessions
                    .peer_ids()
                    .iter()
                    .filter_map(|id| self.sessions.snapshot(id, self.channels.has_channel(id)))
                    .collect();
                let _ = reply.send(snapshots);
            }
            Command::Transfers { reply } => {
                let _ = reply.send(self.transfers.snapshots());
            }
            // Handled by the run loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn connect(&mut self, address: String) -> Result<(), MeshError> {
        let connection = self.signaling.begin(&address)?;
        let dialer = self.signaling.dialer();
        let tx = self.inputs_tx.clone();
        tokio::spawn(async move {
            let result = dialer.dial(&address).await.map_err(|e| describe(&e));
            let _ = tx.send(Input::RelayDialed { connection, result });
        });
        Ok(())
    }

    fn create_stream(&mut self, constraints: MediaConstraints) {
        self.streams_requested += 1;
        debug!(?constraints, requested = self.streams_requested, "Requesting local stream");
        let media = self.media.clone();
        let tx = self.inputs_tx.clone();
        tokio::spawn(async move {
            let result = media
                .get_user_media(constraints)
                .await
                .map_err(|e| describe(&e));
            let _ = tx.send(Input::StreamResolved { result });
        });
    }

    fn shutdown(&mut self) {
        info!("Shutting down mesh engine");
        let was_connected = self.signaling.is_connected();
        self.signaling.disconnect();
        for peer_id in self.sessions.peer_ids() {
            self.teardown_peer(&peer_id, CONNECTION_CLOSED);
        }
        self.channels.release_all();
        self.ticker = None;
        if was_connected {
            self.bus.publish(Event::SignalingClosed);
        }
    }

    // ===== RELAY =====

    fn on_relay_dialed(&mut self, connection: u64, result: Result<RelayLink, String>) {
        match result {
            Ok(link) => match self.signaling.established(connection, link) {
                Ok(Some(mut inbound)) => {
                    // A fresh link brings a fresh roster; readiness is redone for it.
                    self.ready = false;
                    let tx = self.inputs_tx.clone();
                    tokio::spawn(async move {
                        while let Some(frame) = inbound.recv().await {
                            let closed = frame == RelayFrame::Closed;
                            if tx.send(Input::Relay { connection, frame }).is_err() || closed {
                                return;
                            }
                        }
                        let _ = tx.send(Input::Relay {
                            connection,
                            frame: RelayFrame::Closed,
                        });
                    });
                    self.bus.publish(Event::Connected {
                        room: self.signaling.room().to_string(),
                    });
                }
                Ok(None) => {}
                Err(error) => self.bus.publish(Event::SignalingError { error }),
            },
            Err(reason) => {
                if self.signaling.dial_failed(connection) {
                    warn!("Relay connection failed: {}", reason);
                    self.bus.publish(Event::SignalingError {
                        error: MeshError::Transport(reason),
                    });
                }
            }
        }
    }

    fn on_relay_message(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Signal(signal) => self.on_signal(signal),
            Inbound::Named { name, data } => {
                debug!("Relay event '{}' republished", name);
                self.bus.publish(Event::RelayEvent { name, data });
            }
            Inbound::Malformed { name, reason } => self.bus.publish(Event::SignalingError {
                error: MeshError::Protocol(format!("malformed '{}' envelope: {}", name, reason)),
            }),
            Inbound::Raw(payload) => self.bus.publish(Event::RawMessage { payload }),
        }
    }

    fn on_signal(&mut self, signal: Signal) {
        trace!("← relay {}", signal.event_name());
        match signal {
            Signal::Peers {
                connections,
                avatars,
                me,
                myself_avatar,
            } => {
                let previous = self.registry.local().map(|l| l.id.clone());
                if previous.as_ref().is_some_and(|id| *id != me) {
                    // Remote ends knew us by the old id; those sessions are dead.
                    info!(old = ?previous, new = %me, "Local identity changed, dropping sessions");
                    for peer_id in self.sessions.peer_ids() {
                        self.teardown_peer(&peer_id, CONNECTION_CLOSED);
                    }
                }
                let local = LocalIdentity {
                    id: me,
                    avatar: myself_avatar,
                };
                self.registry
                    .apply_roster(roster_entries(&connections, &avatars), local.clone());
                info!(peers = self.registry.len(), "Roster received");
                self.bus.publish(Event::RosterReady {
                    peers: self.registry.peers(),
                    local,
                });
                self.maybe_ready();
            }
            Signal::NewPeer {
                socket_id,
                socket_avatar,
            } => self.on_peer_arrived(PeerRecord::new(socket_id, socket_avatar)),
            Signal::RemovePeer { socket_id } => {
                info!(peer_id = %socket_id, "Peer left");
                self.teardown_peer(&socket_id, CONNECTION_CLOSED);
                self.registry.remove(&socket_id);
                self.bus.publish(Event::PeerRemoved { peer_id: socket_id });
            }
            Signal::IceCandidate {
                socket_id,
                candidate,
                label,
            } => {
                let candidate = IceCandidate { candidate, label };
                match self.sessions.on_remote_candidate(&socket_id, candidate.clone()) {
                    CandidateOutcome::Unknown | CandidateOutcome::Duplicate => {}
                    CandidateOutcome::Buffered | CandidateOutcome::Applying => {
                        self.bus.publish(Event::CandidateReceived {
                            peer_id: socket_id,
                            candidate,
                        });
                    }
                }
            }
            Signal::Offer { socket_id, sdp } => {
                if sdp.kind != SdpType::Offer {
                    warn!(peer_id = %socket_id, "Offer envelope carries an {}", sdp.kind);
                } else if self.sessions.on_offer(&socket_id, sdp) {
                    self.bus.publish(Event::OfferReceived { peer_id: socket_id });
                }
            }
            Signal::Answer { socket_id, sdp } => {
                if sdp.kind != SdpType::Answer {
                    warn!(peer_id = %socket_id, "Answer envelope carries an {}", sdp.kind);
                } else if self.sessions.on_answer(&socket_id, sdp) {
                    self.bus.publish(Event::AnswerReceived { peer_id: socket_id });
                }
            }
            Signal::Join { room } => self.bus.publish(Event::RelayEvent {
                name: "join".to_string(),
                data: serde_json::json!({ "room": room }),
            }),
        }
    }

    fn on_peer_arrived(&mut self, peer: PeerRecord) {
        let Some(local_id) = self.registry.local().map(|l| l.id.clone()) else {
            warn!(peer_id = %peer.id, "Arrival before roster ignored");
            return;
        };
        if peer.id == local_id {
            return;
        }
        info!(peer_id = %peer.id, "Peer arrived");
        self.registry.insert(peer.clone());
        if let Err(error) = self.sessions.open(
            &peer.id,
            SessionRole::RemoteResponder,
            &local_id,
            &self.streams,
        ) {
            self.bus.publish(Event::NegotiationError {
                peer_id: peer.id.clone(),
                error,
            });
        }
        self.bus.publish(Event::PeerArrived { peer });
    }

    // ===== SESSIONS =====

    fn on_stream_resolved(&mut self, result: Result<MediaStream, String>) {
        match result {
            Ok(stream) => {
                self.streams_resolved += 1;
                info!(stream = %stream.id, "Local stream ready");
                self.streams.push(stream.clone());
                self.bus.publish(Event::StreamCreated { stream });
                self.maybe_ready();
            }
            Err(reason) => {
                warn!("Local stream failed: {}", reason);
                self.bus.publish(Event::StreamCreateError {
                    error: MeshError::MediaAcquisition(reason),
                });
            }
        }
    }

    /// Open initiator sessions once the roster is known and every requested
    /// stream resolved.
    fn maybe_ready(&mut self) {
        if self.ready
            || !self.registry.has_roster()
            || self.streams_requested == 0
            || self.streams_resolved < self.streams_requested
        {
            return;
        }
        let Some(local_id) = self.registry.local().map(|l| l.id.clone()) else {
            return;
        };
        self.ready = true;

        let mut opened = Vec::new();
        for peer_id in self.registry.peer_ids() {
            match self.sessions.open(
                &peer_id,
                SessionRole::LocalInitiator,
                &local_id,
                &self.streams,
            ) {
                Ok(true) => opened.push(peer_id),
                Ok(false) => {}
                Err(error) => self.bus.publish(Event::NegotiationError { peer_id, error }),
            }
        }
        self.add_channels();
        for peer_id in &opened {
            self.sessions.start_offer(peer_id);
        }
        info!(sessions = opened.len(), "Ready");
        self.bus.publish(Event::Ready {
            sessions: opened.len(),
        });
    }

    /// Give every live session a channel.
    fn add_channels(&mut self) {
        for peer_id in self.sessions.live_peers() {
            let handle = self.sessions.handle(&peer_id);
            if let Err(error) = self.channels.create_channel(&peer_id, handle.as_ref()) {
                self.bus.publish(Event::ChannelError { peer_id, error });
            }
        }
    }

    fn on_negotiated(&mut self, peer_id: PeerId, generation: u64, step: NegotiationStep) {
        match self.sessions.on_negotiated(&peer_id, generation, step) {
            Some(StepOutcome::Send(signal)) => {
                if let Err(e) = self.signaling.send(&signal) {
                    self.sessions.mark_failed(&peer_id);
                    let error = MeshError::negotiation(&peer_id, NegotiationStage::SendDescription, e);
                    self.bus.publish(Event::NegotiationError { peer_id, error });
                }
            }
            Some(StepOutcome::Failed(error)) => {
                self.bus.publish(Event::NegotiationError { peer_id, error });
            }
            None => {}
        }
    }

    fn on_transport_event(&mut self, peer_id: PeerId, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if let Err(e) = self.signaling.send(&Signal::candidate(peer_id.clone(), candidate)) {
                    debug!(peer_id = %peer_id, "Local candidate not forwarded: {}", e);
                }
            }
            TransportEvent::Connected => {
                if self.sessions.on_connected(&peer_id) {
                    self.bus.publish(Event::SessionOpened { peer_id });
                }
            }
            TransportEvent::RemoteStream(stream) => {
                self.bus.publish(Event::RemoteStream { peer_id, stream });
            }
            TransportEvent::DataChannel(channel) => {
                self.channels.adopt(&peer_id, channel);
            }
            TransportEvent::ChannelOpen(channel_id) => {
                if self.channels.on_open(&peer_id, channel_id) {
                    self.bus.publish(Event::ChannelOpened { peer_id });
                }
            }
            TransportEvent::ChannelMessage { text, .. } => self.on_channel_message(peer_id, &text),
            TransportEvent::ChannelClosed(channel_id) => {
                if self.channels.on_closed(&peer_id, channel_id) {
                    self.bus.publish(Event::ChannelClosed {
                        peer_id: peer_id.clone(),
                    });
                    self.fail_transfers(&peer_id, CONNECTION_CLOSED);
                }
            }
            TransportEvent::ChannelError { channel_id, reason } => {
                if self.channels.is_tracked(&peer_id, channel_id) {
                    self.bus.publish(Event::ChannelError {
                        peer_id: peer_id.clone(),
                        error: MeshError::ChannelFailed {
                            peer_id: peer_id.clone(),
                            reason: reason.clone(),
                        },
                    });
                    self.fail_transfers(&peer_id, &reason);
                }
            }
            TransportEvent::Closed => {
                info!(peer_id = %peer_id, "Transport closed the session");
                self.teardown_peer(&peer_id, CONNECTION_CLOSED);
            }
        }
    }

    fn on_channel_message(&mut self, peer_id: PeerId, text: &str) {
        match classify(text) {
            Ok(Incoming::Chat(text)) => {
                let avatar = self.registry.avatar(&peer_id);
                self.bus.publish(Event::ChatMessage {
                    peer_id,
                    avatar,
                    text,
                });
            }
            Ok(Incoming::File(signal)) => {
                if let Some(follow_up) = self.transfers.on_signal(&peer_id, signal, &self.bus) {
                    self.run_follow_up(follow_up);
                }
            }
            Err(error) => {
                warn!(peer_id = %peer_id, "Undecodable channel message: {}", error);
                self.bus.publish(Event::ChannelError { peer_id, error });
            }
        }
    }

    fn run_follow_up(&self, follow_up: FollowUp) {
        let tx = self.inputs_tx.clone();
        match follow_up {
            FollowUp::Load { send_id, source } => {
                tokio::spawn(async move {
                    let result = source.read().await.map_err(|e| describe(&e));
                    let _ = tx.send(Input::PayloadLoaded { send_id, result });
                });
            }
            FollowUp::Materialize {
                send_id,
                peer_id,
                file,
                payload,
            } => {
                let sink = self.sink.clone();
                tokio::spawn(async move {
                    let result = match decode_data_url(&payload) {
                        Ok(bytes) => sink.store(&file.name, bytes).await.map_err(|e| describe(&e)),
                        Err(e) => Err(e.to_string()),
                    };
                    let _ = tx.send(Input::Materialized {
                        send_id,
                        peer_id,
                        file,
                        result,
                    });
                });
            }
        }
    }

    /// Every transfer with `peer_id` rides its channel; fail them all.
    fn fail_transfers(&mut self, peer_id: &PeerId, reason: &str) {
        let failed = self.transfers.fail_peer(peer_id, reason, &self.bus);
        if failed > 0 {
            debug!(peer_id = %peer_id, failed, "Transfers cancelled");
        }
    }

    /// Destroy the peer's session and channel, then fail its transfers.
    fn teardown_peer(&mut self, peer_id: &PeerId, reason: &str) {
        let had_session = self.sessions.close(peer_id);
        if self.channels.release(peer_id) {
            self.bus.publish(Event::ChannelClosed {
                peer_id: peer_id.clone(),
            });
        }
        self.fail_transfers(peer_id, reason);
        if had_session {
            self.bus.publish(Event::SessionClosed {
                peer_id: peer_id.clone(),
            });
        }
    }
}

/// Cloneable consumer handle to a running engine.
#[derive(Clone)]
pub struct MeshHandle {
    inputs: UnboundedSender<Input>,
    bus: EventBus,
}

impl MeshHandle {
    /// Events published from now on.
    pub fn subscribe(&self) -> EventStream {
        self.bus.subscribe()
    }

    pub fn is_running(&self) -> bool {
        !self.inputs.is_closed()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, MeshError> {
        let (reply, rx) = oneshot::channel();
        self.inputs
            .send(Input::Command(make(reply)))
            .map_err(|_| MeshError::EngineStopped)?;
        rx.await.map_err(|_| MeshError::EngineStopped)
    }

    /// Open the relay connection and join the configured room.
    pub async fn connect(&self, address: impl Into<String>) -> Result<(), MeshError> {
        let address = address.into();
        self.request(|reply| Command::Connect { address, reply }).await?
    }

    /// Request a local stream; resolution is reported as an event.
    pub fn create_stream(&self, constraints: MediaConstraints) -> Result<(), MeshError> {
        self.inputs
            .send(Input::Command(Command::CreateStream { constraints }))
            .map_err(|_| MeshError::EngineStopped)
    }

    /// Send a chat message on every open channel; returns the peers reached.
    pub async fn broadcast_message(&self, text: impl Into<String>) -> Result<Vec<PeerId>, MeshError> {
        let text = text.into();
        self.request(|reply| Command::BroadcastMessage { text, reply })
            .await?
    }

    /// Offer a file to every peer with an open channel.
    pub async fn broadcast_file(&self, file: FileHandle) -> Result<Vec<SendId>, MeshError> {
        self.request(|reply| Command::BroadcastFile { file, reply })
            .await
    }

    pub async fn send_file(&self, peer_id: PeerId, file: FileHandle) -> Result<SendId, MeshError> {
        self.request(|reply| Command::SendFile {
            peer_id,
            file,
            reply,
        })
        .await?
    }

    pub async fn accept_transfer(&self, peer_id: PeerId, send_id: SendId) -> Result<(), MeshError> {
        self.request(|reply| Command::AcceptTransfer {
            peer_id,
            send_id,
            reply,
        })
        .await?
    }

    pub async fn refuse_transfer(&self, peer_id: PeerId, send_id: SendId) -> Result<(), MeshError> {
        self.request(|reply| Command::RefuseTransfer {
            peer_id,
            send_id,
            reply,
        })
        .await?
    }

    pub async fn peers(&self) -> Result<Vec<PeerRecord>, MeshError> {
        self.request(|reply| Command::Peers { reply }).await
    }

    pub async fn local_identity(&self) -> Result<Option<LocalIdentity>, MeshError> {
        self.request(|reply| Command::LocalIdentity { reply }).await
    }

    pub async fn sessions(&self) -> Result<Vec<SessionSnapshot>, MeshError> {
        self.request(|reply| Command::Sessions { reply }).await
    }

    pub async fn transfers(&self) -> Result<Vec<TransferSnapshot>, MeshError> {
        self.request(|reply| Command::Transfers { reply }).await
    }

    /// Stop the engine, leave the relay and close every session.
    pub async fn shutdown(&self) -> Result<(), MeshError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

// ===== TESTS =====

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::MemorySink;
    use crate::transport::MockMediaDevices;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_matching(events: &mut EventStream, want: &str) -> Event {
        loop {
            let event = timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event stream closed");
            if event.name() == want {
                return event;
            }
        }
    }

    fn engine_with_media(relay: &MemoryRelay, media: Arc<dyn MediaDevices>) -> MeshHandle {
        let network = LoopbackNetwork::new();
        let mut collaborators =
            Collaborators::loopback(relay, &network, Arc::new(MemorySink::new()));
        collaborators.media = media;
        MeshEngine::new(MeshConfig::for_room("lobby"), collaborators).spawn()
    }

    #[tokio::test]
    async fn test_media_failure_keeps_engine_unready() {
        let mut media = MockMediaDevices::new();
        media
            .expect_get_user_media()
            .times(1)
            .returning(|_| Err(anyhow::anyhow!("camera busy")));
        let relay = MemoryRelay::new();
        let handle = engine_with_media(&relay, Arc::new(media));
        let mut events = handle.subscribe();

        handle.connect("mem://relay").await.unwrap();
        handle.create_stream(MediaConstraints::audio_video()).unwrap();

        match next_matching(&mut events, "stream-create-error").await {
            Event::StreamCreateError {
                error: MeshError::MediaAcquisition(reason),
            } => assert!(reason.contains("camera busy")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(handle.sessions().await.unwrap().is_empty());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_media_constraints_reach_backend() {
        let mut media = MockMediaDevices::new();
        media
            .expect_get_user_media()
            .withf(|c| c.video && c.audio)
            .times(1)
            .returning(|c| Ok(MediaStream::new("cam", c)));
        let relay = MemoryRelay::new();
        let handle = engine_with_media(&relay, Arc::new(media));
        let mut events = handle.subscribe();

        handle.create_stream(MediaConstraints::audio_video()).unwrap();
        match next_matching(&mut events, "stream-created").await {
            Event::StreamCreated { stream } => assert_eq!(stream.id, "cam"),
            other => panic!("unexpected {:?}", other),
        }
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_second_connect_is_rejected() {
        let relay = MemoryRelay::new();
        let handle = engine_with_media(&relay, Arc::new(StaticMedia::new()));
        handle.connect("mem://relay").await.unwrap();
        assert!(matches!(
            handle.connect("mem://relay").await,
            Err(MeshError::Transport(_))
        ));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_failure_is_reported() {
        let relay = MemoryRelay::new();
        relay.refuse_connections("full");
        let handle = engine_with_media(&relay, Arc::new(StaticMedia::new()));
        let mut events = handle.subscribe();

        handle.connect("mem://relay").await.unwrap();
        match next_matching(&mut events, "signaling-error").await {
            Event::SignalingError {
                error: MeshError::Transport(reason),
            } => assert!(reason.contains("full")),
            other => panic!("unexpected {:?}", other),
        }
        // A failed dial frees the slot for another attempt.
        handle.connect("mem://relay").await.unwrap();
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_after_shutdown_fail() {
        let relay = MemoryRelay::new();
        let handle = engine_with_media(&relay, Arc::new(StaticMedia::new()));
        handle.shutdown().await.unwrap();
        assert_eq!(handle.peers().await, Err(MeshError::EngineStopped));
        assert!(!handle.is_running());
        assert_eq!(
            handle.create_stream(MediaConstraints::none()),
            Err(MeshError::EngineStopped)
        );
    }

    #[tokio::test]
    async fn test_unknown_relay_events_are_republished() {
        let relay = MemoryRelay::new();
        let handle = engine_with_media(&relay, Arc::new(StaticMedia::new()));
        let mut events = handle.subscribe();
        handle.connect("mem://relay").await.unwrap();
        next_matching(&mut events, "roster-ready").await;

        let me = handle.local_identity().await.unwrap().unwrap().id;
        relay.inject(&me, r#"{"eventName":"kick","data":{"why":"idle"}}"#);
        relay.inject(&me, r#"{"note":"hello"}"#);

        match next_matching(&mut events, "relay-event").await {
            Event::RelayEvent { name, data } => {
                assert_eq!(name, "kick");
                assert_eq!(data["why"], "idle");
            }
            other => panic!("unexpected {:?}", other),
        }
        match next_matching(&mut events, "raw-message").await {
            Event::RawMessage { payload } => assert_eq!(payload["note"], "hello"),
            other => panic!("unexpected {:?}", other),
        }
        handle.shutdown().await.unwrap();
    }
}
