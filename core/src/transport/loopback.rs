// Loopback transport: in-process peer sessions for simulation and tests
//
// Every engine gets its own `LoopbackTransport` from one shared
// `LoopbackNetwork`. A session `A→B` is paired with the session `B→A`
// once both sides hold a local and a remote description, at which point
// both report `Connected`, remote streams are announced, and channels
// created on either side get a counterpart on the other. Messages sent on
// a channel are delivered synchronously to the counterpart's sink.

use super::{
    ChannelId, DataChannel, MediaDevices, PeerSession, PeerTransport, SessionContext,
    TransportEvent, TransportEvents,
};
use crate::types::{IceCandidate, MediaConstraints, MediaStream, PeerId, SessionDescription};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

#[derive(Default)]
struct NetworkState {
    /// Keyed by (local, remote)
    sessions: HashMap<(PeerId, PeerId), Weak<LoopbackSession>>,
    next_channel: ChannelId,
    next_candidate: u64,
}

/// Shared medium every loopback session lives on.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport handle for one engine.
    pub fn transport(&self) -> LoopbackTransport {
        LoopbackTransport {
            network: self.clone(),
        }
    }

    fn session(&self, local: &PeerId, remote: &PeerId) -> Option<Arc<LoopbackSession>> {
        self.state
            .lock()
            .sessions
            .get(&(local.clone(), remote.clone()))
            .and_then(Weak::upgrade)
    }

    /// Whether the session `local→remote` is paired with its counterpart.
    pub fn is_connected(&self, local: &PeerId, remote: &PeerId) -> bool {
        self.session(local, remote)
            .map(|s| s.inner.lock().connected)
            .unwrap_or(false)
    }

    /// Number of live (not closed) sessions on the network.
    pub fn session_count(&self) -> usize {
        let sessions: Vec<_> = self
            .state
            .lock()
            .sessions
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        sessions.iter().filter(|s| !s.inner.lock().closed).count()
    }

    /// First open channel on the session `local→remote`.
    pub fn channel(&self, local: &PeerId, remote: &PeerId) -> Option<Arc<LoopbackChannel>> {
        let session = self.session(local, remote)?;
        let inner = session.inner.lock();
        inner.channels.iter().find(|c| c.is_open()).cloned()
    }

    /// Break every channel between `local` and `remote`: both ends see an
    /// error followed by a close. Returns false when nothing was open.
    pub fn fail_channel(&self, local: &PeerId, remote: &PeerId, reason: &str) -> bool {
        let Some(session) = self.session(local, remote) else {
            return false;
        };
        let channels: Vec<_> = session.inner.lock().channels.clone();
        let mut failed = false;
        for channel in channels.into_iter().filter(|c| c.is_open()) {
            channel.fail(reason);
            failed = true;
        }
        failed
    }

    fn allocate_channel_id(&self) -> ChannelId {
        let mut state = self.state.lock();
        state.next_channel += 1;
        state.next_channel
    }

    fn allocate_candidate(&self, local: &PeerId) -> IceCandidate {
        let mut state = self.state.lock();
        state.next_candidate += 1;
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host ufrag {}",
                state.next_candidate,
                40000 + state.next_candidate % 20000,
                local
            ),
            label: Some(0),
        }
    }

    fn register(&self, session: &Arc<LoopbackSession>) {
        let key = (session.local.clone(), session.remote.clone());
        self.state.lock().sessions.insert(key, Arc::downgrade(session));
    }

    fn unregister(&self, session: &LoopbackSession) {
        let key = (session.local.clone(), session.remote.clone());
        let mut state = self.state.lock();
        let same = state
            .sessions
            .get(&key)
            .map(|w| std::ptr::eq(w.as_ptr(), session))
            .unwrap_or(false);
        if same {
            state.sessions.remove(&key);
        }
    }

    /// Pair `local→remote` with `remote→local` when both are negotiated.
    fn try_pair(&self, local: &PeerId, remote: &PeerId) {
        // Serialize pairing so two sides finishing together pair once.
        let guard = self.state.lock();
        let a = guard
            .sessions
            .get(&(local.clone(), remote.clone()))
            .and_then(Weak::upgrade);
        let b = guard
            .sessions
            .get(&(remote.clone(), local.clone()))
            .and_then(Weak::upgrade);
        let (Some(a), Some(b)) = (a, b) else {
            return;
        };
        if !a.ready_to_pair() || !b.ready_to_pair() {
            return;
        }
        drop(guard);

        a.link(&b);
        b.link(&a);
        debug!(local = %local, remote = %remote, "loopback sessions paired");

        for session in [&a, &b] {
            session.events.emit(TransportEvent::Connected);
        }
        for (from, to) in [(&a, &b), (&b, &a)] {
            let streams = from.inner.lock().streams.clone();
            for stream in streams {
                to.events.emit(TransportEvent::RemoteStream(stream));
            }
        }
        for (from, to) in [(&a, &b), (&b, &a)] {
            let pending: Vec<_> = from
                .inner
                .lock()
                .channels
                .iter()
                .filter(|c| c.awaiting_counterpart())
                .cloned()
                .collect();
            for channel in pending {
                self.pair_channel(&channel, to);
            }
        }
    }

    /// Give `channel` a counterpart on `remote`, then open both ends.
    fn pair_channel(&self, channel: &Arc<LoopbackChannel>, remote: &Arc<LoopbackSession>) {
        let counterpart = LoopbackChannel::new(
            self.allocate_channel_id(),
            &channel.label,
            remote.events.clone(),
        );
        channel.state.lock().peer = Some(Arc::downgrade(&counterpart));
        counterpart.state.lock().peer = Some(Arc::downgrade(channel));
        remote.inner.lock().channels.push(counterpart.clone());

        remote
            .events
            .emit(TransportEvent::DataChannel(counterpart.clone() as Arc<dyn DataChannel>));
        channel.state.lock().open = true;
        counterpart.state.lock().open = true;
        channel.events.emit(TransportEvent::ChannelOpen(channel.id));
        counterpart.events.emit(TransportEvent::ChannelOpen(counterpart.id));
    }
}

/// [`PeerTransport`] backed by a [`LoopbackNetwork`].
#[derive(Clone)]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
}

impl PeerTransport for LoopbackTransport {
    fn open(&self, ctx: SessionContext, events: TransportEvents) -> Result<Arc<dyn PeerSession>> {
        if ctx.local_id == ctx.peer_id {
            bail!("cannot open a session to ourselves ({})", ctx.peer_id);
        }
        let session = Arc::new(LoopbackSession {
            local: ctx.local_id,
            remote: ctx.peer_id,
            events,
            network: self.network.clone(),
            inner: Mutex::new(SessionInner::default()),
        });
        self.network.register(&session);
        Ok(session)
    }
}

#[derive(Default)]
struct SessionInner {
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    streams: Vec<MediaStream>,
    channels: Vec<Arc<LoopbackChannel>>,
    applied_candidates: Vec<IceCandidate>,
    counterpart: Option<Weak<LoopbackSession>>,
    connected: bool,
    closed: bool,
}

pub struct LoopbackSession {
    local: PeerId,
    remote: PeerId,
    events: TransportEvents,
    network: LoopbackNetwork,
    inner: Mutex<SessionInner>,
}

impl LoopbackSession {
    fn ready_to_pair(&self) -> bool {
        let inner = self.inner.lock();
        !inner.closed
            && !inner.connected
            && inner.local_description.is_some()
            && inner.remote_description.is_some()
    }

    fn link(&self, other: &Arc<LoopbackSession>) {
        let mut inner = self.inner.lock();
        inner.connected = true;
        inner.counterpart = Some(Arc::downgrade(other));
    }

    fn counterpart(&self) -> Option<Arc<LoopbackSession>> {
        self.inner.lock().counterpart.as_ref().and_then(Weak::upgrade)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.lock().closed {
            bail!("session {}→{} is closed", self.local, self.remote);
        }
        Ok(())
    }

    /// The counterpart went away.
    fn remote_closed(&self) {
        let channels = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.connected = false;
            std::mem::take(&mut inner.channels)
        };
        for channel in channels {
            channel.close();
        }
        self.network.unregister(self);
        self.events.emit(TransportEvent::Closed);
    }
}

#[async_trait]
impl PeerSession for LoopbackSession {
    fn attach_stream(&self, stream: &MediaStream) -> Result<()> {
        self.ensure_open()?;
        let connected = {
            let mut inner = self.inner.lock();
            inner.streams.push(stream.clone());
            inner.connected
        };
        if connected {
            if let Some(other) = self.counterpart() {
                other.events.emit(TransportEvent::RemoteStream(stream.clone()));
            }
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(format!(
            "v=0 loopback-offer {}->{}",
            self.local, self.remote
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        if self.inner.lock().remote_description.is_none() {
            bail!("cannot answer without a remote offer");
        }
        Ok(SessionDescription::answer(format!(
            "v=0 loopback-answer {}->{}",
            self.local, self.remote
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        self.inner.lock().local_description = Some(desc);
        let candidate = self.network.allocate_candidate(&self.local);
        self.events.emit(TransportEvent::LocalCandidate(candidate));
        self.network.try_pair(&self.local, &self.remote);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        self.inner.lock().remote_description = Some(desc);
        self.network.try_pair(&self.local, &self.remote);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        let mut inner = self.inner.lock();
        if inner.remote_description.is_none() {
            bail!("remote description not set");
        }
        trace!(local = %self.local, remote = %self.remote, "candidate applied");
        inner.applied_candidates.push(candidate);
        Ok(())
    }

    fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        self.ensure_open()?;
        let channel = LoopbackChannel::new(
            self.network.allocate_channel_id(),
            label,
            self.events.clone(),
        );
        let connected = {
            let mut inner = self.inner.lock();
            inner.channels.push(channel.clone());
            inner.connected
        };
        if connected {
            if let Some(other) = self.counterpart() {
                self.network.pair_channel(&channel, &other);
            }
        }
        Ok(channel)
    }

    fn close(&self) {
        let (channels, counterpart) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.connected = false;
            (
                std::mem::take(&mut inner.channels),
                inner.counterpart.take().and_then(|w| w.upgrade()),
            )
        };
        for channel in channels {
            channel.close();
        }
        self.network.unregister(self);
        if let Some(other) = counterpart {
            other.remote_closed();
        }
    }
}

#[derive(Default)]
struct ChannelState {
    open: bool,
    closed: bool,
    peer: Option<Weak<LoopbackChannel>>,
    sent: Vec<String>,
    buffered: usize,
}

/// One end of a loopback channel pair.
pub struct LoopbackChannel {
    id: ChannelId,
    label: String,
    events: TransportEvents,
    state: Mutex<ChannelState>,
}

impl LoopbackChannel {
    fn new(id: ChannelId, label: &str, events: TransportEvents) -> Arc<Self> {
        Arc::new(Self {
            id,
            label: label.to_string(),
            events,
            state: Mutex::new(ChannelState::default()),
        })
    }

    /// Open channel with no counterpart; sends are only recorded.
    pub fn detached(id: ChannelId, label: &str) -> Arc<Self> {
        let channel = Self::new(id, label, TransportEvents::new(|_| {}));
        channel.state.lock().open = true;
        channel
    }

    /// Every text sent from this end, in order.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// Pretend the outgoing buffer holds `amount` bytes.
    pub fn set_buffered_amount(&self, amount: usize) {
        self.state.lock().buffered = amount;
    }

    /// Report an error on both ends, then close them.
    pub fn fail(&self, reason: &str) {
        let peer = self.state.lock().peer.as_ref().and_then(Weak::upgrade);
        self.events.emit(TransportEvent::ChannelError {
            channel_id: self.id,
            reason: reason.to_string(),
        });
        if let Some(peer) = &peer {
            peer.events.emit(TransportEvent::ChannelError {
                channel_id: peer.id,
                reason: reason.to_string(),
            });
        }
        self.close();
    }

    fn awaiting_counterpart(&self) -> bool {
        let state = self.state.lock();
        !state.closed && state.peer.is_none()
    }
}

impl DataChannel for LoopbackChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn send(&self, text: &str) -> Result<()> {
        let peer = {
            let mut state = self.state.lock();
            if !state.open {
                bail!("channel {} is not open", self.id);
            }
            state.sent.push(text.to_string());
            state.peer.clone()
        };
        let Some(weak) = peer else {
            return Ok(());
        };
        let peer = weak
            .upgrade()
            .ok_or_else(|| anyhow!("channel {} lost its counterpart", self.id))?;
        peer.events.emit(TransportEvent::ChannelMessage {
            channel_id: peer.id,
            text: text.to_string(),
        });
        Ok(())
    }

    fn buffered_amount(&self) -> usize {
        self.state.lock().buffered
    }

    fn close(&self) {
        let peer = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.open = false;
            state.peer.take().and_then(|w| w.upgrade())
        };
        self.events.emit(TransportEvent::ChannelClosed(self.id));
        if let Some(peer) = peer {
            peer.close();
        }
    }
}

/// Media backend that hands out track-less stream handles.
#[derive(Debug, Default)]
pub struct StaticMedia {
    next: AtomicU64,
}

impl StaticMedia {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediaDevices for StaticMedia {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<MediaStream> {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(MediaStream::new(format!("stream-{}", n), constraints))
    }
}

/// Media backend for hosts without capture devices.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableMedia;

#[async_trait]
impl MediaDevices for UnavailableMedia {
    async fn get_user_media(&self, _constraints: MediaConstraints) -> Result<MediaStream> {
        bail!("media devices are not available on this host")
    }
}
