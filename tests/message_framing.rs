//! Whole-datagram framing: the contiguous wire form a UDP receiver reads
//! in one shot, for both a data message and a zero-payload ack.

use siphon::message::{BufferState, Message};

fn contiguous_round_trip(mut sent: Message) -> Message {
    let wire = sent.to_buffer();
    let mut received = Message::new(sent.max_size());
    received.primary_mut().extend_from_slice(&wire.to_contiguous());
    received.from_buffer(true).unwrap();
    received
}

#[test]
fn data_message_survives_a_single_contiguous_datagram() {
    let mut sent = Message::new(4096);
    sent.header_mut().session_id = "session-A".into();
    sent.header_mut().seq = 42;
    sent.header_mut().src = 1;
    sent.header_mut().dst = 2;
    sent.header_mut().coding_parameters = 0x1234_5678;
    {
        let buf = sent.allocate_buffer();
        buf.extend_from_slice(b"overlay payload bytes");
    }
    sent.reset_payload(true, (0, 22));

    let received = contiguous_round_trip(sent);
    assert_eq!(received.header().session_id, "session-A");
    assert_eq!(received.header().seq, 42);
    assert_eq!(received.header().coding_parameters, 0x1234_5678);
    assert!(!received.header().ack);
    assert_eq!(received.payload(), b"overlay payload bytes");
}

#[test]
fn ack_datagram_carries_zero_payload_and_the_ack_flag() {
    let mut sent = Message::new(4096);
    sent.header_mut().session_id = "session-B".into();
    sent.header_mut().ack = true;
    sent.header_mut().coding_parameters = 0xAABB_CCDD;
    sent.reset_payload(true, (0, 0));

    let received = contiguous_round_trip(sent);
    assert!(received.header().ack);
    assert_eq!(received.header().coding_parameters, 0xAABB_CCDD);
    assert!(received.payload().is_empty());
    assert_eq!(received.state(), BufferState::S00);
}
