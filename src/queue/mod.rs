//! Queue substream (§4.D): per-substream ordered delivery over the tunnel, timeout
//! expiry, dead-letter generation, and the possible-duplicate recovery handshake.

pub mod events;
pub mod persistent;
pub mod wire;

pub use events::{QueueEvent, SubmitTimeout, UndeliverableCode};
pub use persistent::PersistentQueue;

use crate::error::{CodecError, Result, TunnelError};
use crate::persist::SlotOffset;
use crate::wire::ack_range::seq_le;
use crate::wire::cursor::{write_u32, Cursor};

/// Persisted slots hold the whole submit, not just the application payload, so a
/// recovered record still carries its identifier and container type.
fn encode_persisted(identifier: u32, container_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + payload.len());
    write_u32(&mut out, identifier);
    out.push(container_type);
    out.extend_from_slice(payload);
    out
}

fn decode_persisted(buf: &[u8]) -> std::result::Result<(u32, u8, Vec<u8>), CodecError> {
    let mut cur = Cursor::new(buf);
    let identifier = cur.read_u32()?;
    let container_type = cur.read_u8()?;
    let payload = cur.read_exact(cur.remaining())?.to_vec();
    Ok((identifier, container_type, payload))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubstreamState {
    NotOpen,
    WaitRefresh,
    Open,
    Closed,
}

struct OutboundPending {
    identifier: u32,
    container_type: u8,
    payload: Vec<u8>,
    deadline_ms: Option<i64>,
    persisted_slot: Option<SlotOffset>,
}

struct InFlight {
    seq: u32,
    identifier: u32,
    container_type: u8,
    payload: Vec<u8>,
    deadline_ms: Option<i64>,
    persisted_slot: Option<SlotOffset>,
    possible_duplicate: bool,
    needs_resend: bool,
}

/// Encodes the wire `timeout_field` as the time remaining until `deadline_ms`,
/// recomputed fresh at every transmit (§4.D "Timeout model": "on transmit, the
/// wire timeout field is rewritten to the remaining time") rather than the
/// static duration the application originally requested.
fn encode_timeout(deadline_ms: Option<i64>, now_ms: i64) -> i64 {
    match deadline_ms {
        None => wire::WIRE_TIMEOUT_INFINITE,
        Some(deadline) => (deadline - now_ms).max(0),
    }
}

/// Reconstructs an absolute deadline from a persisted slot's `timeout` field,
/// which `submit` writes as `u64::MAX` for `SubmitTimeout::Infinite`.
fn deadline_from_persisted(timeout: u64) -> Option<i64> {
    if timeout == u64::MAX {
        None
    } else {
        Some(timeout as i64)
    }
}

/// One named, ordered, optionally-guaranteed channel multiplexed over a tunnel.
pub struct Substream {
    stream_id: i32,
    domain_type: u8,
    source_queue_name: String,
    dest_queue_name: String,
    state: SubstreamState,
    last_in_seq: u32,
    local_last_out_seq: u32,
    last_observed_queue_depth: u32,
    persistence: Option<Box<dyn PersistentQueue>>,
    pending_out: std::collections::VecDeque<OutboundPending>,
    in_flight: Vec<InFlight>,
    max_fragment_size: u32,
}

impl Substream {
    /// Opens a substream, replaying any persisted messages left over from a prior
    /// process as pending sends (untransmitted) or in-flight resends (transmitted,
    /// `possible_duplicate = true` until the peer's refresh proves otherwise).
    pub fn new(
        stream_id: i32,
        domain_type: u8,
        source_queue_name: String,
        dest_queue_name: String,
        mut persistence: Option<Box<dyn PersistentQueue>>,
        max_fragment_size: u32,
    ) -> Result<Self> {
        if source_queue_name.len() > 200 {
            return Err(TunnelError::InvalidArgument("source_queue_name exceeds 200 bytes".into()));
        }

        let mut pending_out = std::collections::VecDeque::new();
        let mut in_flight = Vec::new();
        let mut last_in_seq = 0;

        if let Some(p) = persistence.as_mut() {
            last_in_seq = p.last_in_seq();
            for recovered in p.recover()? {
                let (identifier, container_type, payload) = decode_persisted(&recovered.payload)?;
                // Keep the original `time_queued`/`timeout` so the reconstructed
                // deadline reconciles against the new session's wall clock (§4.D)
                // instead of silently becoming infinite.
                let deadline_ms = deadline_from_persisted(recovered.timeout);
                if let Some(seq) = recovered.seq {
                    in_flight.push(InFlight {
                        seq,
                        identifier,
                        container_type,
                        payload,
                        deadline_ms,
                        persisted_slot: Some(recovered.slot),
                        possible_duplicate: true,
                        needs_resend: true,
                    });
                } else {
                    pending_out.push_back(OutboundPending {
                        identifier,
                        container_type,
                        payload,
                        deadline_ms,
                        persisted_slot: Some(recovered.slot),
                    });
                }
            }
        }

        Ok(Substream {
            stream_id,
            domain_type,
            source_queue_name,
            dest_queue_name,
            state: SubstreamState::NotOpen,
            last_in_seq,
            local_last_out_seq: 0,
            last_observed_queue_depth: 0,
            persistence,
            pending_out,
            in_flight,
            max_fragment_size,
        })
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn state(&self) -> SubstreamState {
        self.state
    }

    fn effective_last_out_seq(&self) -> u32 {
        self.persistence.as_ref().map(|p| p.last_out_seq()).unwrap_or(self.local_last_out_seq)
    }

    /// Builds the request that opens the substream, per §4.D's open handshake.
    #[tracing::instrument(level = "debug", skip(self), fields(stream_id = self.stream_id))]
    pub fn open_request(&mut self) -> wire::RequestMessage {
        self.state = SubstreamState::WaitRefresh;
        wire::RequestMessage {
            stream_id: self.stream_id,
            domain_type: self.domain_type,
            source_queue_name: self.source_queue_name.clone(),
            last_out_seq: self.effective_last_out_seq(),
            last_in_seq: self.last_in_seq,
        }
    }

    /// Applies the peer's refresh: opens the substream and resolves every in-flight
    /// message against the peer's reported `last_in_seq` — already-seen messages are
    /// synthesized-acked and freed, the rest are flagged for resend as duplicates.
    #[tracing::instrument(level = "debug", skip(self, msg), fields(stream_id = self.stream_id))]
    pub fn handle_refresh(&mut self, msg: &wire::RefreshMessage) -> Result<Vec<QueueEvent>> {
        self.state = SubstreamState::Open;
        self.last_observed_queue_depth = msg.queue_depth;

        let mut events = Vec::new();
        let mut keep = Vec::with_capacity(self.in_flight.len());
        for mut m in self.in_flight.drain(..) {
            if seq_le(m.seq, msg.remote_last_in_seq) {
                if let Some(slot) = m.persisted_slot {
                    if let Some(p) = self.persistence.as_mut() {
                        p.free(slot)?;
                    }
                }
                events.push(QueueEvent::QueueAck { substream_id: self.stream_id, seq: m.seq });
            } else {
                m.possible_duplicate = true;
                m.needs_resend = true;
                keep.push(m);
            }
        }
        self.in_flight = keep;

        events.push(QueueEvent::Refresh {
            substream_id: self.stream_id,
            remote_last_out_seq: msg.remote_last_out_seq,
            remote_last_in_seq: msg.remote_last_in_seq,
            queue_depth: msg.queue_depth,
        });
        Ok(events)
    }

    /// Queues a message for transmission, persisting it first if this substream
    /// carries the guarantee class of service.
    pub fn submit(
        &mut self,
        identifier: u32,
        container_type: u8,
        payload: Vec<u8>,
        timeout: SubmitTimeout,
        now_ms: i64,
    ) -> Result<()> {
        if self.state == SubstreamState::Closed {
            return Err(TunnelError::Protocol("substream is closed".into()));
        }
        let deadline_ms = match timeout {
            SubmitTimeout::Immediate => Some(now_ms),
            SubmitTimeout::Infinite => None,
            SubmitTimeout::AfterMs(ms) => Some(now_ms + ms as i64),
        };

        let persisted_slot = match self.persistence.as_mut() {
            Some(p) => {
                let wire_timeout = deadline_ms.map(|d| d as u64).unwrap_or(u64::MAX);
                let record = encode_persisted(identifier, container_type, &payload);
                Some(p.save(&record, now_ms as u64, wire_timeout)?)
            }
            None => None,
        };

        self.pending_out.push_back(OutboundPending {
            identifier,
            container_type,
            payload,
            deadline_ms,
            persisted_slot,
        });
        Ok(())
    }

    /// Drains sendable messages: duplicate resends left over from recovery first,
    /// then freshly submitted messages, expiring any whose deadline has passed.
    #[tracing::instrument(level = "trace", skip(self), fields(stream_id = self.stream_id))]
    pub fn dispatch(&mut self, now_ms: i64) -> Result<(Vec<wire::DataMessage>, Vec<QueueEvent>)> {
        let mut to_send = Vec::new();
        let mut events = Vec::new();

        if self.state != SubstreamState::Open {
            return Ok((to_send, events));
        }

        let mut i = 0;
        while i < self.in_flight.len() {
            if !self.in_flight[i].needs_resend {
                i += 1;
                continue;
            }
            if self.in_flight[i].payload.len() as u32 > self.max_fragment_size {
                let m = self.in_flight.remove(i);
                if let Some(slot) = m.persisted_slot {
                    if let Some(p) = self.persistence.as_mut() {
                        p.free(slot)?;
                    }
                }
                tracing::warn!(
                    stream_id = self.stream_id,
                    identifier = m.identifier,
                    "recovered message exceeds max_fragment_size renegotiated on reopen"
                );
                events.push(QueueEvent::QueueDataExpired {
                    substream_id: self.stream_id,
                    code: UndeliverableCode::MaxMsgSize,
                    identifier: m.identifier,
                    payload: m.payload,
                });
                continue;
            }
            let m = &mut self.in_flight[i];
            m.needs_resend = false;
            to_send.push(wire::DataMessage {
                from_queue: self.source_queue_name.clone(),
                to_queue: self.dest_queue_name.clone(),
                timeout_field: encode_timeout(m.deadline_ms, now_ms),
                identifier: m.identifier,
                container_type: m.container_type,
                seq_num: m.seq,
                possible_duplicate: true,
                payload: m.payload.clone(),
            });
            i += 1;
        }

        while let Some(pending) = self.pending_out.pop_front() {
            if pending.payload.len() as u32 > self.max_fragment_size {
                if let Some(slot) = pending.persisted_slot {
                    if let Some(p) = self.persistence.as_mut() {
                        p.free(slot)?;
                    }
                }
                tracing::warn!(
                    stream_id = self.stream_id,
                    identifier = pending.identifier,
                    "recovered message exceeds max_fragment_size renegotiated on reopen"
                );
                events.push(QueueEvent::QueueDataExpired {
                    substream_id: self.stream_id,
                    code: UndeliverableCode::MaxMsgSize,
                    identifier: pending.identifier,
                    payload: pending.payload,
                });
                continue;
            }
            if let Some(deadline) = pending.deadline_ms {
                if now_ms >= deadline {
                    if let Some(slot) = pending.persisted_slot {
                        if let Some(p) = self.persistence.as_mut() {
                            p.free(slot)?;
                        }
                    }
                    tracing::warn!(stream_id = self.stream_id, identifier = pending.identifier, "queue submit expired");
                    events.push(QueueEvent::QueueDataExpired {
                        substream_id: self.stream_id,
                        code: UndeliverableCode::Expired,
                        identifier: pending.identifier,
                        payload: pending.payload,
                    });
                    continue;
                }
            }

            let seq = match pending.persisted_slot {
                Some(slot) => self.persistence.as_mut().unwrap().transmit_update(slot)?,
                None => {
                    self.local_last_out_seq += 1;
                    self.local_last_out_seq
                }
            };

            let msg = wire::DataMessage {
                from_queue: self.source_queue_name.clone(),
                to_queue: self.dest_queue_name.clone(),
                timeout_field: encode_timeout(pending.deadline_ms, now_ms),
                identifier: pending.identifier,
                container_type: pending.container_type,
                seq_num: seq,
                possible_duplicate: false,
                payload: pending.payload.clone(),
            };
            self.in_flight.push(InFlight {
                seq,
                identifier: pending.identifier,
                container_type: pending.container_type,
                payload: pending.payload,
                deadline_ms: pending.deadline_ms,
                persisted_slot: pending.persisted_slot,
                possible_duplicate: false,
                needs_resend: false,
            });
            to_send.push(msg);
        }

        Ok((to_send, events))
    }

    /// Applies a peer ack, freeing any persisted slot and surfacing a `QueueAck`.
    pub fn handle_ack(&mut self, ack: &wire::AckMessage) -> Result<Option<QueueEvent>> {
        let Some(pos) = self.in_flight.iter().position(|m| m.seq == ack.seq_num) else {
            return Ok(None);
        };
        let m = self.in_flight.remove(pos);
        if let Some(slot) = m.persisted_slot {
            if let Some(p) = self.persistence.as_mut() {
                p.free(slot)?;
            }
        }
        Ok(Some(QueueEvent::QueueAck { substream_id: self.stream_id, seq: ack.seq_num }))
    }

    /// Accepts an inbound data message, delivering it in order and persisting the
    /// new high-water `last_in_seq` so a crash doesn't replay it on recovery.
    pub fn handle_data(&mut self, msg: wire::DataMessage) -> Result<(Option<QueueEvent>, wire::AckMessage)> {
        let ack = wire::AckMessage { seq_num: msg.seq_num };
        if seq_le(msg.seq_num, self.last_in_seq) {
            return Ok((None, ack));
        }
        self.last_in_seq = msg.seq_num;
        if let Some(p) = self.persistence.as_mut() {
            p.set_last_in_seq(msg.seq_num)?;
        }
        let event = QueueEvent::Data {
            substream_id: self.stream_id,
            identifier: msg.identifier,
            container_type: msg.container_type,
            possible_duplicate: msg.possible_duplicate,
            payload: msg.payload,
        };
        Ok((Some(event), ack))
    }

    /// Surfaces a peer-originated dead letter (the peer gave up delivering or
    /// waiting on this message) as a local expiry event.
    pub fn handle_dead_letter(&self, msg: wire::DeadLetterMessage) -> QueueEvent {
        let code = match msg.code {
            wire::DeadLetterCode::Expired => UndeliverableCode::Expired,
            wire::DeadLetterCode::MaxMsgSize => UndeliverableCode::MaxMsgSize,
        };
        QueueEvent::QueueDataExpired {
            substream_id: self.stream_id,
            code,
            identifier: msg.identifier,
            payload: msg.payload,
        }
    }

    pub fn close(&mut self) {
        self.state = SubstreamState::Closed;
    }

    pub fn last_observed_queue_depth(&self) -> u32 {
        self.last_observed_queue_depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::{MemoryBackend, PersistFile};

    fn open_substream(persisted: bool) -> Substream {
        let persistence: Option<Box<dyn PersistentQueue>> = if persisted {
            Some(Box::new(PersistFile::open(MemoryBackend::new(), 8, 64).unwrap()))
        } else {
            None
        };
        Substream::new(1, 0, "src".into(), "dst".into(), persistence, 8192).unwrap()
    }

    #[test]
    fn submit_then_dispatch_after_open_sends_data() {
        let mut s = open_substream(false);
        let _ = s.open_request();
        s.handle_refresh(&wire::RefreshMessage { remote_last_out_seq: 0, remote_last_in_seq: 0, queue_depth: 0 }).unwrap();
        s.submit(10, 130, b"hello".to_vec(), SubmitTimeout::Infinite, 1_000).unwrap();
        let (sent, events) = s.dispatch(1_000).unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].seq_num, 1);
        assert!(events.is_empty());
    }

    #[test]
    fn immediate_timeout_expires_before_dispatch_runs_later() {
        let mut s = open_substream(false);
        s.handle_refresh(&wire::RefreshMessage { remote_last_out_seq: 0, remote_last_in_seq: 0, queue_depth: 0 }).unwrap();
        s.submit(1, 130, b"x".to_vec(), SubmitTimeout::Immediate, 1_000).unwrap();
        let (sent, events) = s.dispatch(1_500).unwrap();
        assert!(sent.is_empty());
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], QueueEvent::QueueDataExpired { code: UndeliverableCode::Expired, .. }));
    }

    #[test]
    fn ack_frees_persisted_slot() {
        let mut s = open_substream(true);
        s.handle_refresh(&wire::RefreshMessage { remote_last_out_seq: 0, remote_last_in_seq: 0, queue_depth: 0 }).unwrap();
        s.submit(1, 130, b"x".to_vec(), SubmitTimeout::Infinite, 0).unwrap();
        let (sent, _) = s.dispatch(0).unwrap();
        let ack = wire::AckMessage { seq_num: sent[0].seq_num };
        let event = s.handle_ack(&ack).unwrap();
        assert!(matches!(event, Some(QueueEvent::QueueAck { seq: 1, .. })));
    }

    #[test]
    fn inbound_data_is_delivered_in_order_and_duplicate_is_suppressed() {
        let mut s = open_substream(false);
        let msg = wire::DataMessage {
            from_queue: "dst".into(),
            to_queue: "src".into(),
            timeout_field: wire::WIRE_TIMEOUT_INFINITE,
            identifier: 5,
            container_type: 130,
            seq_num: 1,
            possible_duplicate: false,
            payload: b"payload".to_vec(),
        };
        let (event, _) = s.handle_data(msg.clone()).unwrap();
        assert!(matches!(event, Some(QueueEvent::Data { .. })));

        let (dup_event, _) = s.handle_data(msg).unwrap();
        assert!(dup_event.is_none());
    }

    #[test]
    fn refresh_resolves_in_flight_against_remote_last_in_seq() {
        let mut s = open_substream(true);
        s.handle_refresh(&wire::RefreshMessage { remote_last_out_seq: 0, remote_last_in_seq: 0, queue_depth: 0 }).unwrap();
        s.submit(1, 130, b"a".to_vec(), SubmitTimeout::Infinite, 0).unwrap();
        s.submit(2, 130, b"b".to_vec(), SubmitTimeout::Infinite, 0).unwrap();
        let (sent, _) = s.dispatch(0).unwrap();
        assert_eq!(sent.len(), 2);

        // Peer has only actually seen seq 1; reopening should synthesize an ack for
        // it and flag seq 2 for resend as a possible duplicate.
        let events = s.handle_refresh(&wire::RefreshMessage { remote_last_out_seq: 0, remote_last_in_seq: 1, queue_depth: 0 }).unwrap();
        assert!(events.iter().any(|e| matches!(e, QueueEvent::QueueAck { seq: 1, .. })));

        let (resent, _) = s.dispatch(0).unwrap();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].seq_num, 2);
        assert!(resent[0].possible_duplicate);
    }
}
