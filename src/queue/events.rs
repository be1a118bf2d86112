//! Locally synthesized and wire-driven events fanned out by a queue substream (§4.D).

/// Why a queue message could not be delivered before a local deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndeliverableCode {
    /// The submit-time deadline passed before the message was ever transmitted.
    Expired,
    /// The message exceeds `max_fragment_size` as renegotiated on reopen, or the peer
    /// reported the same via a wire `DeadLetter`.
    MaxMsgSize,
}

/// The timeout an application attaches to a queue submit (§4.D "Timeout model").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitTimeout {
    /// Fires on the very next dispatch if not yet transmitted.
    Immediate,
    /// Never expires.
    Infinite,
    /// Relative milliseconds from submit time; converted to an absolute deadline.
    AfterMs(u32),
}

/// Events a substream hands to the application, either locally synthesized
/// (acks on recovery, expiry) or driven by a wire message from the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// A locally synthesized or wire-confirmed ack for a previously sent message.
    QueueAck { substream_id: i32, seq: u32 },
    /// A submitted message expired locally before transmission.
    QueueDataExpired { substream_id: i32, code: UndeliverableCode, identifier: u32, payload: Vec<u8> },
    /// The peer's refresh response, reporting its view of the queue.
    Refresh { substream_id: i32, remote_last_out_seq: u32, remote_last_in_seq: u32, queue_depth: u32 },
    /// An inbound data message delivered to the application, in order.
    Data { substream_id: i32, identifier: u32, container_type: u8, possible_duplicate: bool, payload: Vec<u8> },
}
