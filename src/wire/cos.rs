//! Class-of-service filter list encode/decode (§3, §4.A).
//!
//! The filter list is canonical: `common`, `authentication`, `flow_control`,
//! `data_integrity` always appear in that order; `guarantee` appears only when
//! explicitly requested. Unknown elements are skipped by their type tag's shape so a
//! decoder built against an older filter set still reads newer streams correctly.

use super::cursor::Cursor;
use super::varint::{decode_ls_i64, encode_ls_i64};
use crate::error::CodecError;
use serde::{Deserialize, Serialize};

const FILTER_ID_COMMON: u8 = 1;
const FILTER_ID_AUTHENTICATION: u8 = 2;
const FILTER_ID_FLOW_CONTROL: u8 = 3;
const FILTER_ID_DATA_INTEGRITY: u8 = 4;
const FILTER_ID_GUARANTEE: u8 = 5;

const ELEM_TYPE_UINT: u8 = 0;
const ELEM_TYPE_INT: u8 = 1;
const ELEM_TYPE_BOOL: u8 = 2;

const COMMON_MAX_MSG_SIZE: u8 = 1;
const COMMON_MAX_FRAGMENT_SIZE: u8 = 2;
const COMMON_SUPPORTS_FRAGMENTATION: u8 = 3;
const COMMON_PROTOCOL_TYPE: u8 = 4;
const COMMON_PROTOCOL_MAJOR_VERSION: u8 = 5;
const COMMON_PROTOCOL_MINOR_VERSION: u8 = 6;
const COMMON_STREAM_VERSION: u8 = 7;

const AUTH_TYPE: u8 = 1;
const FLOW_CONTROL_TYPE: u8 = 1;
const FLOW_CONTROL_RECV_WINDOW_SIZE: u8 = 2;
const DATA_INTEGRITY_TYPE: u8 = 1;
const GUARANTEE_TYPE: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonFilter {
    pub max_msg_size: u32,
    pub max_fragment_size: u32,
    pub supports_fragmentation: bool,
    pub protocol_type: u8,
    pub protocol_major_version: u8,
    pub protocol_minor_version: u8,
    pub stream_version: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Authentication {
    NotRequired,
    OmmLogin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowControl {
    None,
    Bidirectional { recv_window_size: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataIntegrity {
    BestEffort,
    Reliable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Guarantee {
    None,
    PersistentQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassOfService {
    pub common: CommonFilter,
    pub authentication: Authentication,
    pub flow_control: FlowControl,
    pub data_integrity: DataIntegrity,
    pub guarantee: Guarantee,
}

impl Default for ClassOfService {
    fn default() -> Self {
        ClassOfService {
            common: CommonFilter {
                max_msg_size: 6_144_000,
                max_fragment_size: 8192,
                supports_fragmentation: true,
                protocol_type: 0,
                protocol_major_version: 1,
                protocol_minor_version: 0,
                stream_version: 1,
            },
            authentication: Authentication::NotRequired,
            flow_control: FlowControl::None,
            data_integrity: DataIntegrity::BestEffort,
            guarantee: Guarantee::None,
        }
    }
}

fn encode_element_uint(out: &mut Vec<u8>, name: u8, value: u64) {
    out.push(name);
    out.push(ELEM_TYPE_UINT);
    encode_ls_i64(value as i64, out);
}

fn encode_element_bool(out: &mut Vec<u8>, name: u8, value: bool) {
    out.push(name);
    out.push(ELEM_TYPE_BOOL);
    out.push(value as u8);
}

enum ElementValue {
    UInt(u64),
    Int(i64),
    Bool(bool),
}

fn decode_element(cur: &mut Cursor) -> Result<(u8, ElementValue), CodecError> {
    let name = cur.read_u8()?;
    let ty = cur.read_u8()?;
    let value = match ty {
        ELEM_TYPE_UINT => ElementValue::UInt(decode_ls_i64(cur)? as u64),
        ELEM_TYPE_INT => ElementValue::Int(decode_ls_i64(cur)?),
        ELEM_TYPE_BOOL => ElementValue::Bool(cur.read_u8()? != 0),
        other => {
            return Err(CodecError::decode("element type tag", format!("unknown tag {other}")))
        }
    };
    Ok((name, value))
}

fn encode_filter(out: &mut Vec<u8>, filter_id: u8, elements: Vec<u8>, count: u16) {
    out.push(filter_id);
    let mut count_buf = Vec::new();
    super::varint::encode_rb_u15(count, &mut count_buf).expect("element count fits u15");
    out.extend_from_slice(&count_buf);
    out.extend_from_slice(&elements);
}

impl ClassOfService {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        let filter_count = if self.guarantee == Guarantee::None { 4 } else { 5 };
        out.push(filter_count);

        let mut common = Vec::new();
        encode_element_uint(&mut common, COMMON_MAX_MSG_SIZE, self.common.max_msg_size as u64);
        encode_element_uint(
            &mut common,
            COMMON_MAX_FRAGMENT_SIZE,
            self.common.max_fragment_size as u64,
        );
        encode_element_bool(
            &mut common,
            COMMON_SUPPORTS_FRAGMENTATION,
            self.common.supports_fragmentation,
        );
        encode_element_uint(&mut common, COMMON_PROTOCOL_TYPE, self.common.protocol_type as u64);
        encode_element_uint(
            &mut common,
            COMMON_PROTOCOL_MAJOR_VERSION,
            self.common.protocol_major_version as u64,
        );
        encode_element_uint(
            &mut common,
            COMMON_PROTOCOL_MINOR_VERSION,
            self.common.protocol_minor_version as u64,
        );
        encode_element_uint(&mut common, COMMON_STREAM_VERSION, self.common.stream_version as u64);
        encode_filter(&mut out, FILTER_ID_COMMON, common, 7);

        let mut auth = Vec::new();
        let auth_val = match self.authentication {
            Authentication::NotRequired => 0,
            Authentication::OmmLogin => 1,
        };
        encode_element_uint(&mut auth, AUTH_TYPE, auth_val);
        encode_filter(&mut out, FILTER_ID_AUTHENTICATION, auth, 1);

        let mut flow = Vec::new();
        match self.flow_control {
            FlowControl::None => {
                encode_element_uint(&mut flow, FLOW_CONTROL_TYPE, 0);
                encode_filter(&mut out, FILTER_ID_FLOW_CONTROL, flow, 1);
            }
            FlowControl::Bidirectional { recv_window_size } => {
                encode_element_uint(&mut flow, FLOW_CONTROL_TYPE, 1);
                encode_element_uint(
                    &mut flow,
                    FLOW_CONTROL_RECV_WINDOW_SIZE,
                    recv_window_size as u64,
                );
                encode_filter(&mut out, FILTER_ID_FLOW_CONTROL, flow, 2);
            }
        }

        let mut integrity = Vec::new();
        let integrity_val = match self.data_integrity {
            DataIntegrity::BestEffort => 0,
            DataIntegrity::Reliable => 1,
        };
        encode_element_uint(&mut integrity, DATA_INTEGRITY_TYPE, integrity_val);
        encode_filter(&mut out, FILTER_ID_DATA_INTEGRITY, integrity, 1);

        if self.guarantee != Guarantee::None {
            let mut guarantee = Vec::new();
            encode_element_uint(&mut guarantee, GUARANTEE_TYPE, 1);
            encode_filter(&mut out, FILTER_ID_GUARANTEE, guarantee, 1);
        }

        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut cur = Cursor::new(bytes);
        let filter_count = cur.read_u8()?;

        let mut common = CommonFilter {
            max_msg_size: 0,
            max_fragment_size: 0,
            supports_fragmentation: false,
            protocol_type: 0,
            protocol_major_version: 0,
            protocol_minor_version: 0,
            stream_version: 0,
        };
        let mut authentication = Authentication::NotRequired;
        let mut flow_control = FlowControl::None;
        let mut data_integrity = DataIntegrity::BestEffort;
        let mut guarantee = Guarantee::None;

        for _ in 0..filter_count {
            let filter_id = cur.read_u8()?;
            let elem_count = super::varint::decode_rb_u15(&mut cur)?;
            match filter_id {
                FILTER_ID_COMMON => {
                    for _ in 0..elem_count {
                        let (name, value) = decode_element(&mut cur)?;
                        match (name, value) {
                            (COMMON_MAX_MSG_SIZE, ElementValue::UInt(v)) => {
                                common.max_msg_size = v as u32
                            }
                            (COMMON_MAX_FRAGMENT_SIZE, ElementValue::UInt(v)) => {
                                common.max_fragment_size = v as u32
                            }
                            (COMMON_SUPPORTS_FRAGMENTATION, ElementValue::Bool(v)) => {
                                common.supports_fragmentation = v
                            }
                            (COMMON_PROTOCOL_TYPE, ElementValue::UInt(v)) => {
                                common.protocol_type = v as u8
                            }
                            (COMMON_PROTOCOL_MAJOR_VERSION, ElementValue::UInt(v)) => {
                                common.protocol_major_version = v as u8
                            }
                            (COMMON_PROTOCOL_MINOR_VERSION, ElementValue::UInt(v)) => {
                                common.protocol_minor_version = v as u8
                            }
                            (COMMON_STREAM_VERSION, ElementValue::UInt(v)) => {
                                if v > 255 {
                                    return Err(CodecError::decode(
                                        "stream_version",
                                        "exceeds 8 bits",
                                    ));
                                }
                                common.stream_version = v as u8
                            }
                            _ => {} // unknown element, already consumed by decode_element
                        }
                    }
                }
                FILTER_ID_AUTHENTICATION => {
                    for _ in 0..elem_count {
                        let (name, value) = decode_element(&mut cur)?;
                        if name == AUTH_TYPE {
                            if let ElementValue::UInt(v) = value {
                                authentication = if v == 1 {
                                    Authentication::OmmLogin
                                } else {
                                    Authentication::NotRequired
                                };
                            }
                        }
                    }
                }
                FILTER_ID_FLOW_CONTROL => {
                    let mut kind = 0u64;
                    let mut window = 0u64;
                    for _ in 0..elem_count {
                        let (name, value) = decode_element(&mut cur)?;
                        match (name, value) {
                            (FLOW_CONTROL_TYPE, ElementValue::UInt(v)) => kind = v,
                            (FLOW_CONTROL_RECV_WINDOW_SIZE, ElementValue::UInt(v)) => window = v,
                            _ => {}
                        }
                    }
                    flow_control = if kind == 1 {
                        FlowControl::Bidirectional { recv_window_size: window as u32 }
                    } else {
                        FlowControl::None
                    };
                }
                FILTER_ID_DATA_INTEGRITY => {
                    for _ in 0..elem_count {
                        let (name, value) = decode_element(&mut cur)?;
                        if name == DATA_INTEGRITY_TYPE {
                            if let ElementValue::UInt(v) = value {
                                data_integrity = if v == 1 {
                                    DataIntegrity::Reliable
                                } else {
                                    DataIntegrity::BestEffort
                                };
                            }
                        }
                    }
                }
                FILTER_ID_GUARANTEE => {
                    for _ in 0..elem_count {
                        let (name, value) = decode_element(&mut cur)?;
                        if name == GUARANTEE_TYPE {
                            if let ElementValue::UInt(v) = value {
                                guarantee = if v == 1 {
                                    Guarantee::PersistentQueue
                                } else {
                                    Guarantee::None
                                };
                            }
                        }
                    }
                }
                _ => {
                    // Unknown filter id: we don't know its element count's total byte
                    // length without decoding each element, so decode and discard them
                    // using the same per-element type-tag shape.
                    for _ in 0..elem_count {
                        decode_element(&mut cur)?;
                    }
                }
            }
        }

        Ok(ClassOfService { common, authentication, flow_control, data_integrity, guarantee })
    }

    /// Reads only the stream version from the common filter without decoding the
    /// remaining filters, per §4.A's "receiver wishing only to learn the stream
    /// version" shortcut.
    pub fn peek_stream_version(bytes: &[u8]) -> Result<u8, CodecError> {
        let mut cur = Cursor::new(bytes);
        let filter_count = cur.read_u8()?;
        for _ in 0..filter_count {
            let filter_id = cur.read_u8()?;
            let elem_count = super::varint::decode_rb_u15(&mut cur)?;
            if filter_id != FILTER_ID_COMMON {
                for _ in 0..elem_count {
                    decode_element(&mut cur)?;
                }
                continue;
            }
            for _ in 0..elem_count {
                let (name, value) = decode_element(&mut cur)?;
                if name == COMMON_STREAM_VERSION {
                    if let ElementValue::UInt(v) = value {
                        return Ok(v as u8);
                    }
                }
            }
            return Err(CodecError::decode("stream_version", "missing from common filter"));
        }
        Err(CodecError::decode("common filter", "not present"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_default_cos() {
        let cos = ClassOfService::default();
        let bytes = cos.encode().unwrap();
        assert_eq!(ClassOfService::decode(&bytes).unwrap(), cos);
    }

    #[test]
    fn roundtrip_with_guarantee() {
        let cos = ClassOfService {
            flow_control: FlowControl::Bidirectional { recv_window_size: 65535 },
            data_integrity: DataIntegrity::Reliable,
            guarantee: Guarantee::PersistentQueue,
            ..ClassOfService::default()
        };
        let bytes = cos.encode().unwrap();
        assert_eq!(ClassOfService::decode(&bytes).unwrap(), cos);
    }

    #[test]
    fn peek_stream_version_short_circuits() {
        let cos = ClassOfService::default();
        let bytes = cos.encode().unwrap();
        assert_eq!(ClassOfService::peek_stream_version(&bytes).unwrap(), 1);
    }

    #[test]
    fn unknown_element_between_known_ones_is_skipped() {
        // Build a common filter manually with an extra unknown element (name=99)
        // inserted between two known elements, and confirm decoding still succeeds.
        let mut out = Vec::new();
        out.push(4u8); // filter_count
        let mut common = Vec::new();
        encode_element_uint(&mut common, COMMON_MAX_MSG_SIZE, 1000);
        encode_element_uint(&mut common, 99, 12345); // unknown element
        encode_element_uint(&mut common, COMMON_STREAM_VERSION, 1);
        encode_filter(&mut out, FILTER_ID_COMMON, common, 3);

        let mut auth = Vec::new();
        encode_element_uint(&mut auth, AUTH_TYPE, 0);
        encode_filter(&mut out, FILTER_ID_AUTHENTICATION, auth, 1);

        let mut flow = Vec::new();
        encode_element_uint(&mut flow, FLOW_CONTROL_TYPE, 0);
        encode_filter(&mut out, FILTER_ID_FLOW_CONTROL, flow, 1);

        let mut integrity = Vec::new();
        encode_element_uint(&mut integrity, DATA_INTEGRITY_TYPE, 0);
        encode_filter(&mut out, FILTER_ID_DATA_INTEGRITY, integrity, 1);

        let cos = ClassOfService::decode(&out).unwrap();
        assert_eq!(cos.common.max_msg_size, 1000);
        assert_eq!(cos.common.stream_version, 1);
    }
}
