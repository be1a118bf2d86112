//! # Tunnel Stream
//!
//! A reliable, in-order, flow-controlled message channel multiplexed over an
//! underlying transport, with an optional persistent queue substream for
//! at-least-once delivery across process restarts.
//!
//! ## Architecture
//!
//! - **Wire codec** (`wire`): `LS-i64`/`RB-u15` scalar encodings, the tunnel data/ack
//!   extended headers, and class-of-service filter list encode/decode.
//! - **Buffer pool** (`buffer`): a slab allocator for encoded/decoded payloads, split
//!   into application and internal buffer classes.
//! - **Persistence** (`persist`): a fixed-slot file format with free/saved linked
//!   lists and crash recovery, behind a [`persist::FileBackend`] trait seam.
//! - **Queue substream** (`queue`): per-substream ordered delivery, timeout expiry,
//!   dead-letter generation, and the possible-duplicate recovery handshake.
//! - **Tunnel engine** (`engine`): the open/close state machine, fragmentation and
//!   reassembly, and the selective ack/nak reliability engine tying the rest
//!   together.

pub mod buffer;
pub mod engine;
pub mod error;
pub mod flat_map;
pub mod persist;
pub mod queue;
pub mod rtt;
pub mod time;
pub mod wire;

pub use engine::{EngineEvent, OutboundBytes, TunnelEngine, TunnelOptions, TunnelState};
pub use error::{CodecError, ErrorKind, PersistenceError, Result, TunnelError};
pub use queue::{QueueEvent, SubmitTimeout, Substream, SubstreamState, UndeliverableCode};
pub use time::{ManualTimeProvider, SystemTimeProvider, TimeProvider};
