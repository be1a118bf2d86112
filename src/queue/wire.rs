//! Queue substream opcodes and message encoding, carried as the payload of an
//! encapsulated tunnel data message (§6 "Queue substream opcodes").

use crate::error::CodecError;
use crate::wire::cursor::{write_u32, Cursor};
use crate::wire::varint::{decode_ls_i64, encode_ls_i64};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubstreamOpcode {
    Data = 1,
    Ack = 2,
    Request = 3,
    DeadLetter = 4,
    Refresh = 5,
}

impl TryFrom<u8> for SubstreamOpcode {
    type Error = CodecError;
    fn try_from(v: u8) -> Result<Self, CodecError> {
        match v {
            1 => Ok(SubstreamOpcode::Data),
            2 => Ok(SubstreamOpcode::Ack),
            3 => Ok(SubstreamOpcode::Request),
            4 => Ok(SubstreamOpcode::DeadLetter),
            5 => Ok(SubstreamOpcode::Refresh),
            other => Err(CodecError::UnknownOpcode(other)),
        }
    }
}

fn write_str(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn read_str(cur: &mut Cursor) -> Result<String, CodecError> {
    let len = cur.read_u16()? as usize;
    let bytes = cur.read_exact(len)?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| CodecError::decode("queue name", "invalid utf-8"))
}

/// The immediate-timeout sentinel on the wire.
pub const WIRE_TIMEOUT_IMMEDIATE: i64 = 0;
/// The infinite-timeout sentinel on the wire.
pub const WIRE_TIMEOUT_INFINITE: i64 = -1;

#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
    pub from_queue: String,
    pub to_queue: String,
    pub timeout_field: i64,
    pub identifier: u32,
    pub container_type: u8,
    pub seq_num: u32,
    pub possible_duplicate: bool,
    pub payload: Vec<u8>,
}

impl DataMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(SubstreamOpcode::Data as u8);
        write_str(&mut out, &self.from_queue);
        write_str(&mut out, &self.to_queue);
        encode_ls_i64(self.timeout_field, &mut out);
        write_u32(&mut out, self.identifier);
        out.push(self.container_type);
        write_u32(&mut out, self.seq_num);
        out.push(self.possible_duplicate as u8);
        write_u32(&mut out, self.payload.len() as u32);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(cur: &mut Cursor) -> Result<Self, CodecError> {
        let opcode = SubstreamOpcode::try_from(cur.read_u8()?)?;
        if opcode != SubstreamOpcode::Data {
            return Err(CodecError::decode("substream opcode", "expected Data"));
        }
        let from_queue = read_str(cur)?;
        let to_queue = read_str(cur)?;
        let timeout_field = decode_ls_i64(cur)?;
        let identifier = cur.read_u32()?;
        let container_type = cur.read_u8()?;
        let seq_num = cur.read_u32()?;
        let possible_duplicate = cur.read_u8()? != 0;
        let len = cur.read_u32()? as usize;
        let payload = cur.read_exact(len)?.to_vec();
        Ok(DataMessage {
            from_queue,
            to_queue,
            timeout_field,
            identifier,
            container_type,
            seq_num,
            possible_duplicate,
            payload,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckMessage {
    pub seq_num: u32,
}

impl AckMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![SubstreamOpcode::Ack as u8];
        write_u32(&mut out, self.seq_num);
        out
    }

    pub fn decode(cur: &mut Cursor) -> Result<Self, CodecError> {
        let opcode = SubstreamOpcode::try_from(cur.read_u8()?)?;
        if opcode != SubstreamOpcode::Ack {
            return Err(CodecError::decode("substream opcode", "expected Ack"));
        }
        Ok(AckMessage { seq_num: cur.read_u32()? })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestMessage {
    pub stream_id: i32,
    pub domain_type: u8,
    pub source_queue_name: String,
    pub last_out_seq: u32,
    pub last_in_seq: u32,
}

impl RequestMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![SubstreamOpcode::Request as u8];
        write_u32(&mut out, self.stream_id as u32);
        out.push(self.domain_type);
        write_str(&mut out, &self.source_queue_name);
        write_u32(&mut out, self.last_out_seq);
        write_u32(&mut out, self.last_in_seq);
        out
    }

    pub fn decode(cur: &mut Cursor) -> Result<Self, CodecError> {
        let opcode = SubstreamOpcode::try_from(cur.read_u8()?)?;
        if opcode != SubstreamOpcode::Request {
            return Err(CodecError::decode("substream opcode", "expected Request"));
        }
        let stream_id = cur.read_u32()? as i32;
        let domain_type = cur.read_u8()?;
        let source_queue_name = read_str(cur)?;
        if source_queue_name.len() > 200 {
            return Err(CodecError::decode("source_queue_name", "exceeds 200 bytes"));
        }
        let last_out_seq = cur.read_u32()?;
        let last_in_seq = cur.read_u32()?;
        Ok(RequestMessage { stream_id, domain_type, source_queue_name, last_out_seq, last_in_seq })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshMessage {
    pub remote_last_out_seq: u32,
    pub remote_last_in_seq: u32,
    pub queue_depth: u32,
}

impl RefreshMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![SubstreamOpcode::Refresh as u8];
        write_u32(&mut out, self.remote_last_out_seq);
        write_u32(&mut out, self.remote_last_in_seq);
        write_u32(&mut out, self.queue_depth);
        out
    }

    pub fn decode(cur: &mut Cursor) -> Result<Self, CodecError> {
        let opcode = SubstreamOpcode::try_from(cur.read_u8()?)?;
        if opcode != SubstreamOpcode::Refresh {
            return Err(CodecError::decode("substream opcode", "expected Refresh"));
        }
        Ok(RefreshMessage {
            remote_last_out_seq: cur.read_u32()?,
            remote_last_in_seq: cur.read_u32()?,
            queue_depth: cur.read_u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterCode {
    Expired,
    MaxMsgSize,
}

impl DeadLetterCode {
    fn to_wire(self) -> u8 {
        match self {
            DeadLetterCode::Expired => 1,
            DeadLetterCode::MaxMsgSize => 2,
        }
    }

    fn from_wire(v: u8) -> Result<Self, CodecError> {
        match v {
            1 => Ok(DeadLetterCode::Expired),
            2 => Ok(DeadLetterCode::MaxMsgSize),
            other => Err(CodecError::decode("dead_letter_code", format!("unknown code {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterMessage {
    pub identifier: u32,
    pub code: DeadLetterCode,
    pub payload: Vec<u8>,
}

impl DeadLetterMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![SubstreamOpcode::DeadLetter as u8];
        write_u32(&mut out, self.identifier);
        out.push(self.code.to_wire());
        write_u32(&mut out, self.payload.len() as u32);
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(cur: &mut Cursor) -> Result<Self, CodecError> {
        let opcode = SubstreamOpcode::try_from(cur.read_u8()?)?;
        if opcode != SubstreamOpcode::DeadLetter {
            return Err(CodecError::decode("substream opcode", "expected DeadLetter"));
        }
        let identifier = cur.read_u32()?;
        let code = DeadLetterCode::from_wire(cur.read_u8()?)?;
        let len = cur.read_u32()? as usize;
        let payload = cur.read_exact(len)?.to_vec();
        Ok(DeadLetterMessage { identifier, code, payload })
    }
}
