// Data channel manager: at most one application channel per peer

use super::message::ChannelMessage;
use crate::error::{describe, MeshError};
use crate::transport::{ChannelId, DataChannel, PeerSession};
use crate::types::PeerId;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, trace};

pub struct DataChannelManager {
    label: String,
    channels: BTreeMap<PeerId, Arc<dyn DataChannel>>,
}

impl DataChannelManager {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            channels: BTreeMap::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Open our channel on the peer's session. No-op when one is tracked.
    pub fn create_channel(
        &mut self,
        peer_id: &PeerId,
        session: Option<&Arc<dyn PeerSession>>,
    ) -> Result<(), MeshError> {
        if self.channels.contains_key(peer_id) {
            return Ok(());
        }
        let session = session.ok_or_else(|| MeshError::ChannelCreation {
            peer_id: peer_id.clone(),
            reason: "no session for peer".to_string(),
        })?;
        let channel = session
            .create_data_channel(&self.label)
            .map_err(|e| MeshError::ChannelCreation {
                peer_id: peer_id.clone(),
                reason: describe(&e),
            })?;
        debug!(peer_id = %peer_id, channel_id = channel.id(), "Channel created");
        self.channels.insert(peer_id.clone(), channel);
        Ok(())
    }

    /// Track a channel the remote side opened. The first tracked channel
    /// for a peer wins; returns false when this one is not tracked.
    pub fn adopt(&mut self, peer_id: &PeerId, channel: Arc<dyn DataChannel>) -> bool {
        if self.channels.contains_key(peer_id) {
            debug!(peer_id = %peer_id, channel_id = channel.id(), "Extra remote channel left untracked");
            return false;
        }
        debug!(peer_id = %peer_id, channel_id = channel.id(), "Remote channel adopted");
        self.channels.insert(peer_id.clone(), channel);
        true
    }

    pub fn is_tracked(&self, peer_id: &PeerId, channel_id: ChannelId) -> bool {
        self.channels
            .get(peer_id)
            .map(|c| c.id() == channel_id)
            .unwrap_or(false)
    }

    /// A tracked channel reported `open`.
    pub fn on_open(&self, peer_id: &PeerId, channel_id: ChannelId) -> bool {
        let tracked = self.is_tracked(peer_id, channel_id);
        if tracked {
            info!(peer_id = %peer_id, "Channel open");
        }
        tracked
    }

    /// A tracked channel closed; forget it.
    pub fn on_closed(&mut self, peer_id: &PeerId, channel_id: ChannelId) -> bool {
        if !self.is_tracked(peer_id, channel_id) {
            return false;
        }
        self.channels.remove(peer_id);
        info!(peer_id = %peer_id, "Channel closed");
        true
    }

    /// Close and forget the peer's channel.
    pub fn release(&mut self, peer_id: &PeerId) -> bool {
        match self.channels.remove(peer_id) {
            Some(channel) => {
                channel.close();
                true
            }
            None => false,
        }
    }

    pub fn release_all(&mut self) {
        for (_, channel) in std::mem::take(&mut self.channels) {
            channel.close();
        }
    }

    pub fn send_text(&self, peer_id: &PeerId, text: &str) -> Result<(), MeshError> {
        let channel = self
            .channels
            .get(peer_id)
            .filter(|c| c.is_open())
            .ok_or_else(|| MeshError::ChannelUnavailable(peer_id.clone()))?;
        channel.send(text).map_err(|e| {
            debug!(peer_id = %peer_id, "Channel send failed: {}", describe(&e));
            MeshError::ChannelUnavailable(peer_id.clone())
        })?;
        trace!(peer_id = %peer_id, len = text.len(), "Channel send");
        Ok(())
    }

    pub fn send(&self, peer_id: &PeerId, message: &ChannelMessage) -> Result<(), MeshError> {
        let text = message.encode()?;
        self.send_text(peer_id, &text)
    }

    /// Send one message on every open channel; returns the peers reached.
    pub fn broadcast(&self, message: &ChannelMessage) -> Result<Vec<PeerId>, MeshError> {
        let text = message.encode()?;
        Ok(self
            .open_peers()
            .into_iter()
            .filter(|peer| self.send_text(peer, &text).is_ok())
            .collect())
    }

    pub fn open_peers(&self) -> Vec<PeerId> {
        self.channels
            .iter()
            .filter(|(_, c)| c.is_open())
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn has_channel(&self, peer_id: &PeerId) -> bool {
        self.channels.contains_key(peer_id)
    }

    pub fn buffered_amount(&self, peer_id: &PeerId) -> Option<usize> {
        self.channels.get(peer_id).map(|c| c.buffered_amount())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
