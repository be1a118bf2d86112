//! Wire codec (§4.A): `LS-i64`/`RB-u15` scalar encodings, tunnel data/ack extended
//! headers, and class-of-service filter list encode/decode.

pub mod ack_range;
pub mod cos;
pub mod cursor;
pub mod header;
pub mod varint;

pub use ack_range::AckRangeList;
pub use cos::ClassOfService;
pub use cursor::Cursor;
pub use header::{AckHeader, DataHeader, FragmentHeader, Opcode, CONTAINER_TYPE_MIN};
pub use varint::{decode_ls_i64, decode_rb_u15, encode_ls_i64, encode_rb_u15};
