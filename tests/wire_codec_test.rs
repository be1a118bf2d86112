//! Wire codec round-trips exercised through the public API (§4.A).

use tunnel_stream::wire::{AckHeader, AckRangeList, ClassOfService, Cursor, DataHeader, FragmentHeader, Opcode};

#[test]
fn data_header_with_fragment_roundtrips() {
    let header = DataHeader {
        opcode: Opcode::Data,
        seq_num: 12345,
        fragment: Some(FragmentHeader {
            total_length: 9000,
            fragment_number: 3,
            message_id: 7,
            container_type: 129,
        }),
    };
    let mut out = Vec::new();
    header.encode(&mut out);
    let mut cur = Cursor::new(&out);
    assert_eq!(DataHeader::decode(&mut cur).unwrap(), header);
}

#[test]
fn ack_header_with_ranges_roundtrips() {
    let mut ack_ranges = AckRangeList::new();
    ack_ranges.insert_range(10, 20);
    let mut nak_ranges = AckRangeList::new();
    nak_ranges.insert(25);

    let header = AckHeader {
        flags: 1,
        cumulative_seq: 9,
        nak_ranges,
        ack_ranges,
        recv_window_size: 32_768,
    };
    let mut out = Vec::new();
    header.encode(&mut out).unwrap();
    let mut cur = Cursor::new(&out);
    assert_eq!(AckHeader::decode(&mut cur).unwrap(), header);
}

#[test]
fn class_of_service_default_roundtrips() {
    let cos = ClassOfService::default();
    let mut out = Vec::new();
    cos.encode(&mut out).unwrap();
    let mut cur = Cursor::new(&out);
    assert_eq!(ClassOfService::decode(&mut cur).unwrap(), cos);
}
