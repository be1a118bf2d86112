//! Queue substream lifecycle (§4.D): open handshake, ordered data delivery,
//! ack-driven slot reclamation, and recovery after a simulated crash.

use tunnel_stream::persist::{MemoryBackend, PersistFile, StdFileBackend};
use tunnel_stream::queue::wire::{AckMessage, DataMessage, RefreshMessage, WIRE_TIMEOUT_INFINITE};
use tunnel_stream::queue::{PersistentQueue, QueueEvent, SubmitTimeout, Substream, SubstreamState, UndeliverableCode};

fn persisted_substream(stream_id: i32, max_msgs: u32) -> Substream {
    let persistence: Box<dyn PersistentQueue> =
        Box::new(PersistFile::open(MemoryBackend::new(), max_msgs, 128).unwrap());
    Substream::new(stream_id, 0, "client".into(), "server".into(), Some(persistence), 8192).unwrap()
}

#[test]
fn open_handshake_transitions_through_wait_refresh_to_open() {
    let mut s = persisted_substream(1, 4);
    assert_eq!(s.state(), SubstreamState::NotOpen);
    let request = s.open_request();
    assert_eq!(request.stream_id, 1);
    assert_eq!(s.state(), SubstreamState::WaitRefresh);

    s.handle_refresh(&RefreshMessage { remote_last_out_seq: 0, remote_last_in_seq: 0, queue_depth: 0 }).unwrap();
    assert_eq!(s.state(), SubstreamState::Open);
}

#[test]
fn guaranteed_delivery_round_trip_frees_the_persisted_slot() {
    let mut sender = persisted_substream(1, 4);
    sender.open_request();
    sender
        .handle_refresh(&RefreshMessage { remote_last_out_seq: 0, remote_last_in_seq: 0, queue_depth: 0 })
        .unwrap();
    sender.submit(1, 130, b"order-42".to_vec(), SubmitTimeout::Infinite, 0).unwrap();

    let (sent, _) = sender.dispatch(0).unwrap();
    assert_eq!(sent.len(), 1);
    let data = sent.into_iter().next().unwrap();
    assert!(!data.possible_duplicate);

    let mut receiver = Substream::new(2, 0, "server".into(), "client".into(), None, 8192).unwrap();
    let (event, ack) = receiver.handle_data(data.clone()).unwrap();
    assert!(matches!(event, Some(QueueEvent::Data { payload, .. }) if payload == b"order-42"));

    let ack_event = sender.handle_ack(&AckMessage { seq_num: ack.seq_num }).unwrap();
    assert!(matches!(ack_event, Some(QueueEvent::QueueAck { seq, .. }) if seq == data.seq_num));
}

#[test]
fn crash_before_ack_redelivers_as_possible_duplicate_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("substream.dat");

    {
        // First incarnation: submit and dispatch, so the message is transmitted
        // and persisted, but never gets an ack before the process "crashes".
        let persistence: Box<dyn PersistentQueue> =
            Box::new(PersistFile::open(StdFileBackend::open(&path).unwrap(), 4, 128).unwrap());
        let mut s = Substream::new(1, 0, "client".into(), "server".into(), Some(persistence), 8192).unwrap();
        s.open_request();
        s.handle_refresh(&RefreshMessage { remote_last_out_seq: 0, remote_last_in_seq: 0, queue_depth: 0 }).unwrap();
        s.submit(9, 130, b"unacked".to_vec(), SubmitTimeout::Infinite, 0).unwrap();
        let (sent, _) = s.dispatch(0).unwrap();
        assert_eq!(sent.len(), 1);
    }

    // Second incarnation: reopening the same file replays the unacked message
    // as an in-flight resend candidate, since the peer's view is unknown.
    let persistence: Box<dyn PersistentQueue> =
        Box::new(PersistFile::open(StdFileBackend::open(&path).unwrap(), 4, 128).unwrap());
    let mut s = Substream::new(1, 0, "client".into(), "server".into(), Some(persistence), 8192).unwrap();
    s.open_request();
    s.handle_refresh(&RefreshMessage { remote_last_out_seq: 0, remote_last_in_seq: 0, queue_depth: 0 }).unwrap();

    let (resent, _) = s.dispatch(0).unwrap();
    assert_eq!(resent.len(), 1);
    assert!(resent[0].possible_duplicate);
    assert_eq!(resent[0].payload, b"unacked");
}

#[test]
fn expired_submit_surfaces_dead_letter_event_before_transmission() {
    let mut s = persisted_substream(1, 4);
    s.open_request();
    s.handle_refresh(&RefreshMessage { remote_last_out_seq: 0, remote_last_in_seq: 0, queue_depth: 0 }).unwrap();
    s.submit(1, 130, b"too slow".to_vec(), SubmitTimeout::AfterMs(10), 0).unwrap();

    let (sent, events) = s.dispatch(50).unwrap();
    assert!(sent.is_empty());
    assert_eq!(events.len(), 1);
    assert!(matches!(
        &events[0],
        QueueEvent::QueueDataExpired { code: UndeliverableCode::Expired, payload, .. } if payload == b"too slow"
    ));
}

#[test]
fn inbound_messages_outside_the_fresh_channel_decode_cleanly() {
    let mut s = Substream::new(3, 0, "server".into(), "client".into(), None, 8192).unwrap();
    let msg = DataMessage {
        from_queue: "server".into(),
        to_queue: "client".into(),
        timeout_field: WIRE_TIMEOUT_INFINITE,
        identifier: 1,
        container_type: 130,
        seq_num: 1,
        possible_duplicate: false,
        payload: b"hello".to_vec(),
    };
    let (event, ack) = s.handle_data(msg).unwrap();
    assert!(event.is_some());
    assert_eq!(ack.seq_num, 1);
}

#[test]
fn submit_exceeding_max_fragment_size_is_dead_lettered_on_dispatch() {
    let persistence: Box<dyn PersistentQueue> =
        Box::new(PersistFile::open(MemoryBackend::new(), 4, 256).unwrap());
    let mut s = Substream::new(1, 0, "client".into(), "server".into(), Some(persistence), 16).unwrap();
    s.open_request();
    s.handle_refresh(&RefreshMessage { remote_last_out_seq: 0, remote_last_in_seq: 0, queue_depth: 0 }).unwrap();
    s.submit(1, 130, b"this payload is far too long to fit".to_vec(), SubmitTimeout::Infinite, 0).unwrap();

    let (sent, events) = s.dispatch(0).unwrap();
    assert!(sent.is_empty());
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], QueueEvent::QueueDataExpired { code: UndeliverableCode::MaxMsgSize, .. }));
}
