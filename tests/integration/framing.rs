use crate::*;

use proptest::prelude::*;

use uasc_channel::chunk::{ChunkReader, ChunkSecurity, ChunkWriter, ReaderEvent, ReaderLimits, WriterLimits};
use uasc_channel::{ChannelError, ChannelState};
use uasc_core::sequence::SequenceNumberGenerator;
use uasc_core::wire::{MessageType, SecurityHeader, SymmetricSecurityHeader, MIN_CHUNK_SIZE};

fn small_chunks() -> Side {
    Side {
        limits: ChannelLimits {
            send_buffer_size: MIN_CHUNK_SIZE,
            receive_buffer_size: MIN_CHUNK_SIZE,
            max_message_size: 0,
            max_chunk_count: 0,
            max_pending_messages: 0,
        },
        key_size: 256,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// reassemble(chunk(body)) == body for every mode and sizes up to ten chunks.
    #[test]
    fn round_trip_any_mode_any_length(
        mode_index in 0..ALL_MODES.len(),
        chunk_multiple in 0.0f64..10.0,
    ) {
        let (policy, mode) = ALL_MODES[mode_index];
        let mut pair = Pair::open_with(policy, mode, small_chunks(), small_chunks());
        let len = (chunk_multiple * MIN_CHUNK_SIZE as f64) as usize;
        let body = pattern(len);

        let chunks = pair.client.send_message(3, &body).unwrap();
        let outcome = deliver(&mut pair.server, &chunks);
        prop_assert_eq!(bodies(&outcome.events), vec![Bytes::from(body)]);
    }

    /// Chunk count is ceil(len / max body) and only the last chunk is Final.
    #[test]
    fn chunk_count_matches_capacity(mode_index in 0..ALL_MODES.len(), len in 1usize..60_000) {
        let (policy, mode) = ALL_MODES[mode_index];
        let mut pair = Pair::open_with(policy, mode, small_chunks(), small_chunks());
        let max_body = pair.client.max_body_size().unwrap();

        let chunks = pair.client.send_message(4, &pattern(len)).unwrap();
        prop_assert_eq!(chunks.len(), len.div_ceil(max_body));
        for (i, chunk) in chunks.iter().enumerate() {
            prop_assert!(chunk.len() <= MIN_CHUNK_SIZE);
            let expected = if i + 1 == chunks.len() { b'F' } else { b'C' };
            prop_assert_eq!(chunk[3], expected);
        }
    }
}

#[test]
fn empty_body_is_one_final_chunk() {
    for (policy, mode) in ALL_MODES {
        let mut pair = Pair::open(policy, mode);
        let chunks = pair.client.send_message(1, &[]).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0][3], b'F');
        let outcome = deliver(&mut pair.server, &chunks);
        assert_eq!(bodies(&outcome.events), vec![Bytes::new()], "{policy} {mode}");
    }
}

#[test]
fn exact_multiple_of_capacity_has_no_empty_tail() {
    let mut pair = Pair::open_with(
        SecurityPolicy::Basic256Sha256,
        MessageSecurityMode::SignAndEncrypt,
        small_chunks(),
        small_chunks(),
    );
    let max_body = pair.client.max_body_size().unwrap();
    let chunks = pair.client.send_message(1, &pattern(max_body * 3)).unwrap();
    assert_eq!(chunks.len(), 3);
    assert!(chunks.iter().all(|c| c.len() == MIN_CHUNK_SIZE));
}

#[test]
fn any_flipped_body_byte_is_a_security_error() {
    for mode in [MessageSecurityMode::Sign, MessageSecurityMode::SignAndEncrypt] {
        let mut reference = Pair::open(SecurityPolicy::Basic256Sha256, mode);
        let chunk_len = reference.client.send_message(1, &pattern(100)).unwrap()[0].len();

        // Past the message header and token id.
        for position in 16..chunk_len {
            let mut pair = Pair::open(SecurityPolicy::Basic256Sha256, mode);
            let mut chunk = pair.client.send_message(1, &pattern(100)).unwrap()[0].to_vec();
            chunk[position] ^= 0x01;

            let outcome = pair.server.feed(&chunk);
            assert!(bodies(&outcome.events).is_empty());
            assert!(
                matches!(
                    outcome.events.as_slice(),
                    [ChannelEvent::Faulted(ChannelError::Security { .. })]
                ),
                "{mode} byte {position}: {:?}",
                outcome.events
            );
            assert_eq!(pair.server.state(), ChannelState::Closed);
        }
    }
}

#[test]
fn single_byte_feeds_match_one_feed() {
    for (policy, mode) in ALL_MODES {
        let mut whole = Pair::open_with(policy, mode, small_chunks(), small_chunks());
        let mut split = Pair::open_with(policy, mode, small_chunks(), small_chunks());
        let body = pattern(3 * MIN_CHUNK_SIZE + 17);

        let joined: Vec<u8> = whole.client.send_message(8, &body).unwrap().concat();
        let expected = whole.server.feed(&joined).events;

        let joined: Vec<u8> = split.client.send_message(8, &body).unwrap().concat();
        let mut events = Vec::new();
        for byte in &joined {
            events.extend(split.server.feed(std::slice::from_ref(byte)).events);
        }
        assert_eq!(events, expected, "{policy} {mode}");
        assert_eq!(bodies(&events), vec![Bytes::from(body)]);
    }
}

#[test]
fn abort_discards_accumulated_chunks() {
    let writer = ChunkWriter::new(WriterLimits {
        chunk_size: 1024,
        max_message_size: 0,
        max_chunk_count: 0,
    });
    let header = || SecurityHeader::Symmetric(SymmetricSecurityHeader::new(1));
    let security = ChunkSecurity::None;

    let mut message = writer
        .begin(MessageType::Message, 42, 1, header(), &security, SequenceNumberGenerator::new())
        .unwrap();
    writer.write(&mut message, &pattern(2500), &security).unwrap();
    let written = writer.end(message, &security).unwrap();
    assert_eq!(written.chunks.len(), 3);

    // The sender gives up after two chunks.
    let abort = writer
        .abort(
            MessageType::Message,
            42,
            1,
            header(),
            &security,
            SequenceNumberGenerator::starting_after(2),
            uasc_core::StatusCode::BAD_REQUEST_TOO_LARGE,
            "cancelled",
        )
        .unwrap();

    let mut reader = ChunkReader::new(ReaderLimits {
        max_chunk_size: 1024,
        max_message_size: 0,
        max_chunk_count: 0,
        max_pending_messages: 0,
    });
    let mut events = Vec::new();
    for chunk in written.chunks[..2].iter().chain(&abort.chunks) {
        events.extend(reader.feed(chunk, &Plain));
    }
    assert_eq!(reader.pending_count(), 0);
    match events.as_slice() {
        [ReaderEvent::Failed(ChannelError::AbortedByPeer { request_id, status, reason })] => {
            assert_eq!(*request_id, 42);
            assert_eq!(*status, uasc_core::StatusCode::BAD_REQUEST_TOO_LARGE);
            assert_eq!(reason, "cancelled");
        }
        other => panic!("unexpected events {other:?}"),
    }

    // The same request id starts over cleanly.
    let mut retry = writer
        .begin(MessageType::Message, 42, 1, header(), &security, abort.sequence)
        .unwrap();
    writer.write(&mut retry, b"retry", &security).unwrap();
    let retry = writer.end(retry, &security).unwrap();
    let events = reader.feed(&retry.chunks[0], &Plain);
    assert!(matches!(
        events.as_slice(),
        [ReaderEvent::Message(m)] if m.body == Bytes::from_static(b"retry")
    ));
}
