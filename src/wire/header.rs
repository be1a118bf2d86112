//! Tunnel data and ack extended headers (§4.A).

use super::ack_range::AckRangeList;
use super::cursor::{write_i32, write_u16, write_u32, Cursor};
use crate::error::CodecError;

/// Tunnel-level opcodes. `Refresh`/`Status`/`Close`/`Fin`/`AckOfFin` are carried by
/// the encapsulated message class rather than the fragmentation header; their numeric
/// values are assigned in sequence around the ones pinned by the wire-protocol-constants
/// table (`Data=1`, `Retrans=2`, `Ack=3`, `Refresh=5`).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Data = 1,
    Retrans = 2,
    Ack = 3,
    Status = 4,
    Refresh = 5,
    Close = 6,
    /// Initiates the close handshake (§4.E "open -> send_fin -> wait_ack_of_fin").
    Fin = 7,
    /// The acknowledger's reply to `Fin`, carrying the final cumulative sequence
    /// number it has received.
    AckOfFin = 8,
}

impl TryFrom<u8> for Opcode {
    type Error = CodecError;
    fn try_from(v: u8) -> Result<Self, CodecError> {
        match v {
            1 => Ok(Opcode::Data),
            2 => Ok(Opcode::Retrans),
            3 => Ok(Opcode::Ack),
            4 => Ok(Opcode::Status),
            5 => Ok(Opcode::Refresh),
            6 => Ok(Opcode::Close),
            7 => Ok(Opcode::Fin),
            8 => Ok(Opcode::AckOfFin),
            other => Err(CodecError::UnknownOpcode(other)),
        }
    }
}

pub const FRAGMENTED_FLAG: u8 = 0x1;

/// Container types are numbered starting at this value; the fragmentation header
/// stores only the offset from it to keep the on-wire byte small.
pub const CONTAINER_TYPE_MIN: u8 = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentHeader {
    pub total_length: u32,
    pub fragment_number: u32,
    pub message_id: u16,
    pub container_type: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataHeader {
    pub opcode: Opcode,
    /// Tunnel-level sequence number, used by the reliability engine's selective
    /// ack/nak (§4.E). Retransmits carry the original packet's sequence number
    /// with `opcode = Retrans`.
    pub seq_num: u32,
    pub fragment: Option<FragmentHeader>,
}

impl DataHeader {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.opcode as u8);
        let flags = if self.fragment.is_some() { FRAGMENTED_FLAG } else { 0 };
        out.push(flags);
        write_u32(out, self.seq_num);
        if let Some(f) = &self.fragment {
            write_u32(out, f.total_length);
            write_u32(out, f.fragment_number);
            write_u16(out, f.message_id);
            out.push(f.container_type.wrapping_sub(CONTAINER_TYPE_MIN));
        }
    }

    pub fn decode(cur: &mut Cursor) -> Result<Self, CodecError> {
        let opcode = Opcode::try_from(cur.read_u8()?)?;
        if !matches!(opcode, Opcode::Data | Opcode::Retrans) {
            return Err(CodecError::decode("data header opcode", "expected Data or Retrans"));
        }
        let flags = cur.read_u8()?;
        let seq_num = cur.read_u32()?;
        let fragment = if flags & FRAGMENTED_FLAG != 0 {
            let total_length = cur.read_u32()?;
            let fragment_number = cur.read_u32()?;
            let message_id = cur.read_u16()?;
            let offset = cur.read_u8()?;
            Some(FragmentHeader {
                total_length,
                fragment_number,
                message_id,
                container_type: CONTAINER_TYPE_MIN.wrapping_add(offset),
            })
        } else {
            None
        };
        Ok(DataHeader { opcode, seq_num, fragment })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AckHeader {
    pub flags: u16,
    pub cumulative_seq: u32,
    pub nak_ranges: AckRangeList,
    pub ack_ranges: AckRangeList,
    pub recv_window_size: i32,
}

impl AckHeader {
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.push(Opcode::Ack as u8);
        super::varint::encode_rb_u15(self.flags, out)?;
        write_u32(out, self.cumulative_seq);
        encode_range_list(&self.nak_ranges, out)?;
        encode_range_list(&self.ack_ranges, out)?;
        write_i32(out, self.recv_window_size);
        Ok(())
    }

    pub fn decode(cur: &mut Cursor) -> Result<Self, CodecError> {
        let opcode = Opcode::try_from(cur.read_u8()?)?;
        if opcode != Opcode::Ack {
            return Err(CodecError::decode("ack header opcode", "expected Ack"));
        }
        let flags = super::varint::decode_rb_u15(cur)?;
        let cumulative_seq = cur.read_u32()?;
        let nak_ranges = decode_range_list(cur)?;
        let ack_ranges = decode_range_list(cur)?;
        let recv_window_size = cur.read_i32()?;
        Ok(AckHeader {
            flags,
            cumulative_seq,
            nak_ranges,
            ack_ranges,
            recv_window_size,
        })
    }
}

fn encode_range_list(list: &AckRangeList, out: &mut Vec<u8>) -> Result<(), CodecError> {
    let ranges = list.ranges();
    if ranges.len() > u8::MAX as usize {
        return Err(CodecError::decode("range count", "too many ranges"));
    }
    out.push(ranges.len() as u8);
    for &(lo, hi) in ranges {
        write_u32(out, lo);
        // Wire encodes an inclusive [lo, hi] pair; our in-memory list is half-open.
        write_u32(out, hi.wrapping_sub(1));
    }
    Ok(())
}

fn decode_range_list(cur: &mut Cursor) -> Result<AckRangeList, CodecError> {
    let count = cur.read_u8()?;
    let mut list = AckRangeList::new();
    for _ in 0..count {
        let lo = cur.read_u32()?;
        let hi_inclusive = cur.read_u32()?;
        list.insert_range(lo, hi_inclusive.wrapping_add(1));
    }
    Ok(list)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_header_roundtrip_unfragmented() {
        let h = DataHeader { opcode: Opcode::Data, seq_num: 7, fragment: None };
        let mut out = Vec::new();
        h.encode(&mut out);
        let mut cur = Cursor::new(&out);
        assert_eq!(DataHeader::decode(&mut cur).unwrap(), h);
    }

    #[test]
    fn data_header_roundtrip_fragmented() {
        let h = DataHeader {
            opcode: Opcode::Retrans,
            seq_num: 99,
            fragment: Some(FragmentHeader {
                total_length: 1500,
                fragment_number: 2,
                message_id: 42,
                container_type: 133,
            }),
        };
        let mut out = Vec::new();
        h.encode(&mut out);
        let mut cur = Cursor::new(&out);
        assert_eq!(DataHeader::decode(&mut cur).unwrap(), h);
    }

    #[test]
    fn ack_header_roundtrip() {
        let mut nak = AckRangeList::new();
        nak.insert_range(3, 4);
        let mut ack = AckRangeList::new();
        ack.insert_range(1, 2);
        let h = AckHeader {
            flags: 0,
            cumulative_seq: 1,
            nak_ranges: nak,
            ack_ranges: ack,
            recv_window_size: 65535,
        };
        let mut out = Vec::new();
        h.encode(&mut out).unwrap();
        let mut cur = Cursor::new(&out);
        assert_eq!(AckHeader::decode(&mut cur).unwrap(), h);
    }

    #[test]
    fn truncated_data_header_is_incomplete() {
        let h = DataHeader {
            opcode: Opcode::Data,
            seq_num: 1,
            fragment: Some(FragmentHeader {
                total_length: 10,
                fragment_number: 1,
                message_id: 1,
                container_type: 130,
            }),
        };
        let mut out = Vec::new();
        h.encode(&mut out);
        for cut in 2..out.len() {
            let mut cur = Cursor::new(&out[..cut]);
            assert!(DataHeader::decode(&mut cur).is_err());
        }
    }
}
