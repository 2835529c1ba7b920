// File transfer engine: ask/accept handshake and chunk multiplexing
//
// Owns every `TransferRecord`, keyed by send id. Sending is driven by
// `TransferEngine::pump`, which the mesh engine calls on a fixed tick
// while `TransferEngine::is_sending` holds; each call sends at most one
// chunk per SENDING record, oldest record first, so concurrent transfers
// share bandwidth. Any failure purges the record and publishes exactly one
// error event for it.

use super::io::FileHandle;
use super::payload::{chunk_bounds, chunk_count, encode_data_url, encoded_len, percent};
use super::record::{Direction, FileMeta, TransferRecord, TransferSnapshot, TransferState};
use crate::channel::{ChannelMessage, DataChannelManager, FileSignal};
use crate::error::MeshError;
use crate::event::{Event, EventBus};
use crate::types::{PeerId, SendId};
use std::collections::HashMap;
use tracing::{debug, info, trace, warn};

/// Reason given to every transfer of a peer that went away.
pub const CONNECTION_CLOSED: &str = "Connection has been closed";

/// Asynchronous work the mesh engine must run for a transfer.
#[derive(Debug, Clone)]
pub(crate) enum FollowUp {
    /// Read the outgoing file; report with [`TransferEngine::payload_loaded`]
    Load { send_id: SendId, source: FileHandle },
    /// Decode and store a completed incoming file
    Materialize {
        send_id: SendId,
        peer_id: PeerId,
        file: FileMeta,
        payload: String,
    },
}

pub struct TransferEngine {
    records: HashMap<SendId, TransferRecord>,
    sources: HashMap<SendId, FileHandle>,
    chunk_size: usize,
    max_buffered_amount: usize,
    next_seq: u64,
}

impl TransferEngine {
    pub fn new(chunk_size: usize, max_buffered_amount: usize) -> Self {
        Self {
            records: HashMap::new(),
            sources: HashMap::new(),
            chunk_size: chunk_size.max(1),
            max_buffered_amount,
            next_seq: 0,
        }
    }

    fn insert(&mut self, mut record: TransferRecord) {
        self.next_seq += 1;
        record.seq = self.next_seq;
        self.records.insert(record.send_id.clone(), record);
    }

    /// Remove a record that reached a terminal `state`.
    fn retire(&mut self, send_id: &SendId, state: TransferState) -> Option<TransferRecord> {
        let mut record = self.records.remove(send_id)?;
        self.sources.remove(send_id);
        if !record.advance(state) {
            debug!(send_id = %send_id, from = ?record.state, to = ?state, "Retired out of order");
        }
        Some(record)
    }

    /// Purge a record and publish its single error event.
    fn fail(&mut self, send_id: &SendId, reason: impl ToString, bus: &EventBus) -> Option<MeshError> {
        let mut record = self.records.remove(send_id)?;
        self.sources.remove(send_id);
        record.advance(TransferState::Failed);
        let reason = reason.to_string();
        warn!(send_id = %send_id, peer_id = %record.peer_id, "Transfer failed: {}", reason);
        let (error, event) = match record.direction {
            Direction::Outbound => {
                let error = MeshError::send_failed(send_id, &record.peer_id, &reason);
                let event = Event::TransferSendError {
                    send_id: send_id.clone(),
                    peer_id: record.peer_id.clone(),
                    error: error.clone(),
                };
                (error, event)
            }
            Direction::Inbound => {
                let error = MeshError::receive_failed(send_id, &record.peer_id, &reason);
                let event = Event::TransferReceiveError {
                    send_id: send_id.clone(),
                    peer_id: record.peer_id.clone(),
                    error: error.clone(),
                };
                (error, event)
            }
        };
        bus.publish(event);
        Some(error)
    }

    /// Inbound protocol violation: purge whatever exists, report a receive error.
    fn violation(&mut self, send_id: &SendId, peer_id: &PeerId, reason: &str, bus: &EventBus) {
        warn!(send_id = %send_id, peer_id = %peer_id, "Protocol violation: {}", reason);
        self.records.remove(send_id);
        self.sources.remove(send_id);
        bus.publish(Event::TransferReceiveError {
            send_id: send_id.clone(),
            peer_id: peer_id.clone(),
            error: MeshError::receive_failed(send_id, peer_id, reason),
        });
    }

    /// Ask `peer_id` to accept `file`. The returned send id is only issued
    /// when the ask reached the channel.
    pub fn send_file(
        &mut self,
        peer_id: &PeerId,
        file: FileHandle,
        channels: &DataChannelManager,
        bus: &EventBus,
    ) -> Result<SendId, MeshError> {
        let meta = file.meta();
        let send_id = SendId::generate();
        self.insert(TransferRecord::outbound(
            send_id.clone(),
            peer_id.clone(),
            meta.clone(),
        ));
        self.sources.insert(send_id.clone(), file);

        let ask = ChannelMessage::File(FileSignal::Ask {
            send_id: send_id.clone(),
            name: meta.name.clone(),
            size: meta.size,
        });
        if let Err(e) = channels.send(peer_id, &ask) {
            let error = self
                .fail(&send_id, e, bus)
                .unwrap_or_else(|| MeshError::ChannelUnavailable(peer_id.clone()));
            return Err(error);
        }
        info!(send_id = %send_id, peer_id = %peer_id, name = %meta.name, "File offered");
        bus.publish(Event::TransferRequested {
            send_id: send_id.clone(),
            peer_id: peer_id.clone(),
            file: meta,
        });
        Ok(send_id)
    }

    /// Offer `file` on every open channel.
    pub fn broadcast_file(
        &mut self,
        file: &FileHandle,
        channels: &DataChannelManager,
        bus: &EventBus,
    ) -> Vec<SendId> {
        channels
            .open_peers()
            .into_iter()
            .filter_map(|peer| self.send_file(&peer, file.clone(), channels, bus).ok())
            .collect()
    }

    pub(crate) fn on_signal(
        &mut self,
        peer_id: &PeerId,
        signal: FileSignal,
        bus: &EventBus,
    ) -> Option<FollowUp> {
        let send_id = signal.send_id().clone();
        if let Some(record) = self.records.get(&send_id) {
            if &record.peer_id != peer_id {
                warn!(send_id = %send_id, peer_id = %peer_id, "Signal from non-owner ignored");
                return None;
            }
        }
        trace!(send_id = %send_id, peer_id = %peer_id, signal = signal.name(), "File signal");

        match signal {
            FileSignal::Ask { name, size, .. } => {
                if self.records.contains_key(&send_id) {
                    self.violation(&send_id, peer_id, "duplicate transfer request", bus);
                    return None;
                }
                let file = FileMeta::new(name, size);
                self.insert(TransferRecord::inbound(
                    send_id.clone(),
                    peer_id.clone(),
                    file.clone(),
                ));
                info!(send_id = %send_id, peer_id = %peer_id, name = %file.name, "Incoming file request");
                bus.publish(Event::TransferIncoming {
                    send_id,
                    peer_id: peer_id.clone(),
                    file,
                });
                None
            }
            FileSignal::Accept { .. } => {
                let record = self.outbound_mut(&send_id)?;
                if !record.advance(TransferState::Accepted) {
                    debug!(send_id = %send_id, state = ?record.state, "Late accept ignored");
                    return None;
                }
                let file = record.file.clone();
                let source = self.sources.get(&send_id).cloned()?;
                bus.publish(Event::TransferAccepted {
                    send_id: send_id.clone(),
                    peer_id: peer_id.clone(),
                    direction: Direction::Outbound,
                    file,
                });
                Some(FollowUp::Load { send_id, source })
            }
            FileSignal::Refuse { .. } => {
                let record = self.outbound_mut(&send_id)?;
                if !record.state.can_transition(record.direction, TransferState::Refused) {
                    debug!(send_id = %send_id, state = ?record.state, "Late refuse ignored");
                    return None;
                }
                let file = self.retire(&send_id, TransferState::Refused)?.file;
                info!(send_id = %send_id, peer_id = %peer_id, "File refused by peer");
                bus.publish(Event::TransferRefused {
                    send_id,
                    peer_id: peer_id.clone(),
                    direction: Direction::Outbound,
                    file,
                });
                None
            }
            FileSignal::Chunk {
                data,
                last,
                percent,
                ..
            } => self.on_chunk(peer_id, send_id, data, last, percent, bus),
        }
    }

    fn outbound_mut(&mut self, send_id: &SendId) -> Option<&mut TransferRecord> {
        match self.records.get_mut(send_id) {
            Some(record) if record.direction == Direction::Outbound => Some(record),
            _ => {
                debug!(send_id = %send_id, "Reply for unknown transfer ignored");
                None
            }
        }
    }

    fn on_chunk(
        &mut self,
        peer_id: &PeerId,
        send_id: SendId,
        data: String,
        last: bool,
        percent: f64,
        bus: &EventBus,
    ) -> Option<FollowUp> {
        let problem = match self.records.get(&send_id).map(|r| (r.direction, r.state)) {
            None => Some("chunk for unknown transfer"),
            Some((Direction::Outbound, _)) => Some("chunk for an outgoing transfer"),
            Some((_, TransferState::Accepted | TransferState::Receiving)) => None,
            Some(_) => Some("chunk before accept"),
        };
        if let Some(reason) = problem {
            self.violation(&send_id, peer_id, reason, bus);
            return None;
        }

        let limit = encoded_len(self.records.get(&send_id)?.file.size);
        let record = self.records.get_mut(&send_id)?;
        if record.payload.len() + data.len() > limit {
            let announced = record.file.size;
            self.violation(
                &send_id,
                peer_id,
                &format!("payload exceeds the announced {} bytes", announced),
                bus,
            );
            return None;
        }
        if record.state == TransferState::Accepted {
            record.advance(TransferState::Receiving);
        }
        record.payload.push_str(&data);
        record.chunk_index += 1;

        if !last {
            bus.publish(Event::TransferProgress {
                send_id,
                peer_id: peer_id.clone(),
                direction: Direction::Inbound,
                file: record.file.clone(),
                percent,
            });
            return None;
        }

        record.advance(TransferState::Complete);
        let record = self.records.remove(&send_id)?;
        info!(send_id = %send_id, peer_id = %peer_id, chunks = record.chunk_index, "File received");
        Some(FollowUp::Materialize {
            send_id,
            peer_id: record.peer_id,
            file: record.file,
            payload: record.payload,
        })
    }

    /// Consumer accepts an incoming request.
    pub fn accept(
        &mut self,
        peer_id: &PeerId,
        send_id: &SendId,
        channels: &DataChannelManager,
        bus: &EventBus,
    ) -> Result<(), MeshError> {
        let file = self.pending_request(peer_id, send_id)?;
        let accept = ChannelMessage::File(FileSignal::Accept {
            send_id: send_id.clone(),
        });
        if let Err(e) = channels.send(peer_id, &accept) {
            let error = self.fail(send_id, e, bus);
            return Err(error.unwrap_or_else(|| MeshError::ChannelUnavailable(peer_id.clone())));
        }
        if let Some(record) = self.records.get_mut(send_id) {
            record.advance(TransferState::Accepted);
        }
        info!(send_id = %send_id, peer_id = %peer_id, "File request accepted");
        bus.publish(Event::TransferAccepted {
            send_id: send_id.clone(),
            peer_id: peer_id.clone(),
            direction: Direction::Inbound,
            file,
        });
        Ok(())
    }

    /// Consumer refuses an incoming request; the record is purged either way.
    pub fn refuse(
        &mut self,
        peer_id: &PeerId,
        send_id: &SendId,
        channels: &DataChannelManager,
        bus: &EventBus,
    ) -> Result<(), MeshError> {
        let file = self.pending_request(peer_id, send_id)?;
        let refuse = ChannelMessage::File(FileSignal::Refuse {
            send_id: send_id.clone(),
        });
        if let Err(e) = channels.send(peer_id, &refuse) {
            let error = self.fail(send_id, e, bus);
            return Err(error.unwrap_or_else(|| MeshError::ChannelUnavailable(peer_id.clone())));
        }
        self.retire(send_id, TransferState::Refused);
        info!(send_id = %send_id, peer_id = %peer_id, "File request refused");
        bus.publish(Event::TransferRefused {
            send_id: send_id.clone(),
            peer_id: peer_id.clone(),
            direction: Direction::Inbound,
            file,
        });
        Ok(())
    }

    fn pending_request(&self, peer_id: &PeerId, send_id: &SendId) -> Result<FileMeta, MeshError> {
        match self.records.get(send_id) {
            Some(r)
                if r.direction == Direction::Inbound
                    && &r.peer_id == peer_id
                    && r.state == TransferState::AskReceived =>
            {
                Ok(r.file.clone())
            }
            _ => Err(MeshError::receive_failed(
                send_id,
                peer_id,
                "no pending request with this id",
            )),
        }
    }

    /// The outgoing file finished loading. Returns true when the record
    /// entered SENDING.
    pub fn payload_loaded(
        &mut self,
        send_id: &SendId,
        result: Result<Vec<u8>, String>,
        bus: &EventBus,
    ) -> bool {
        match self.records.get(send_id) {
            Some(record) if record.state == TransferState::Accepted => {}
            _ => {
                debug!(send_id = %send_id, "Loaded payload for a purged transfer dropped");
                return false;
            }
        }
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(reason) => {
                self.fail(send_id, format!("cannot read file: {}", reason), bus);
                return false;
            }
        };
        self.sources.remove(send_id);
        let Some(record) = self.records.get_mut(send_id) else {
            return false;
        };
        record.payload = encode_data_url(&bytes);
        record.total_chunks = chunk_count(record.payload.len(), self.chunk_size);
        record.remaining = record.total_chunks;
        record.advance(TransferState::Sending);
        debug!(
            send_id = %send_id,
            units = record.payload.len(),
            chunks = record.total_chunks,
            "Sending started"
        );
        true
    }

    /// One multiplexing tick. Returns the number of chunks sent.
    pub fn pump(&mut self, channels: &DataChannelManager, bus: &EventBus) -> usize {
        let mut sending: Vec<(u64, SendId)> = self
            .records
            .values()
            .filter(|r| r.state == TransferState::Sending)
            .map(|r| (r.seq, r.send_id.clone()))
            .collect();
        sending.sort();

        let mut sent = 0;
        for (_, send_id) in sending {
            let Some(record) = self.records.get(&send_id) else {
                continue;
            };
            let peer_id = record.peer_id.clone();
            if let Some(buffered) = channels.buffered_amount(&peer_id) {
                if buffered > self.max_buffered_amount {
                    trace!(send_id = %send_id, buffered, "Channel congested, skipping tick");
                    continue;
                }
            }

            let index = record.chunk_index;
            let total = record.total_chunks;
            let (start, end) = chunk_bounds(record.payload.len(), self.chunk_size, index);
            let Some(data) = record.payload.get(start..end).map(str::to_string) else {
                self.fail(&send_id, "chunk boundary outside payload", bus);
                continue;
            };
            let last = index + 1 >= total;
            let progress = percent(index, total);
            let chunk = ChannelMessage::File(FileSignal::Chunk {
                send_id: send_id.clone(),
                data,
                last,
                percent: progress,
            });

            if let Err(e) = channels.send(&peer_id, &chunk) {
                self.fail(&send_id, e, bus);
                continue;
            }
            sent += 1;

            let Some(record) = self.records.get_mut(&send_id) else {
                continue;
            };
            record.chunk_index += 1;
            record.remaining = record.remaining.saturating_sub(1);
            let file = record.file.clone();
            if last {
                record.advance(TransferState::Sent);
                self.records.remove(&send_id);
                info!(send_id = %send_id, peer_id = %peer_id, "File sent");
                bus.publish(Event::TransferSent {
                    send_id,
                    peer_id,
                    file,
                });
            } else {
                bus.publish(Event::TransferProgress {
                    send_id,
                    peer_id,
                    direction: Direction::Outbound,
                    file,
                    percent: progress,
                });
            }
        }
        sent
    }

    /// Fail every record of a peer that went away, exactly once each.
    pub fn fail_peer(&mut self, peer_id: &PeerId, reason: &str, bus: &EventBus) -> usize {
        let mut doomed: Vec<(u64, SendId)> = self
            .records
            .values()
            .filter(|r| &r.peer_id == peer_id)
            .map(|r| (r.seq, r.send_id.clone()))
            .collect();
        doomed.sort();
        doomed
            .iter()
            .filter(|(_, send_id)| self.fail(send_id, reason, bus).is_some())
            .count()
    }

    pub fn is_sending(&self) -> bool {
        self.records
            .values()
            .any(|r| r.state == TransferState::Sending)
    }

    pub fn get(&self, send_id: &SendId) -> Option<&TransferRecord> {
        self.records.get(send_id)
    }

    pub fn snapshots(&self) -> Vec<TransferSnapshot> {
        let mut records: Vec<&TransferRecord> = self.records.values().collect();
        records.sort_by_key(|r| r.seq);
        records.into_iter().map(TransferRecord::snapshot).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
