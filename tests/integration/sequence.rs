use crate::*;

use uasc_channel::chunk::{ChunkReader, ChunkSecurity, ChunkWriter, ReaderEvent, ReaderLimits, WriterLimits};
use uasc_channel::{ChannelError, ChannelState, ErrorKind};
use uasc_core::sequence::{SequenceError, SequenceNumberGenerator};
use uasc_core::wire::{MessageType, SecurityHeader, SymmetricSecurityHeader};

/// One single-chunk message numbered `after + 1`.
fn numbered(request_id: u32, after: u32) -> Bytes {
    let writer = ChunkWriter::new(WriterLimits {
        chunk_size: 8192,
        max_message_size: 0,
        max_chunk_count: 0,
    });
    let security = ChunkSecurity::None;
    let header = SecurityHeader::Symmetric(SymmetricSecurityHeader::new(1));
    let mut message = writer
        .begin(
            MessageType::Message,
            request_id,
            1,
            header,
            &security,
            SequenceNumberGenerator::starting_after(after),
        )
        .unwrap();
    writer.write(&mut message, b"payload", &security).unwrap();
    let mut written = writer.end(message, &security).unwrap();
    written.chunks.remove(0)
}

fn reader() -> ChunkReader {
    ChunkReader::new(ReaderLimits {
        max_chunk_size: 8192,
        max_message_size: 0,
        max_chunk_count: 0,
        max_pending_messages: 0,
    })
}

#[test]
fn out_of_order_fails_on_the_skipped_number() {
    let mut reader = reader();
    let five = reader.feed(&numbered(1, 4), &Plain);
    assert!(matches!(five.as_slice(), [ReaderEvent::Message(_)]));

    let seven = reader.feed(&numbered(2, 6), &Plain);
    assert_eq!(
        seven,
        vec![ReaderEvent::Failed(ChannelError::Sequence(SequenceError {
            expected: 6,
            received: 7,
        }))]
    );
    assert!(reader.is_failed());

    // Nothing after the failure is processed, not even the "missing" 6.
    assert!(reader.feed(&numbered(3, 5), &Plain).is_empty());
}

#[test]
fn wraparound_from_max_to_one_is_accepted() {
    let mut reader = reader();
    let mut events = reader.feed(&numbered(1, u32::MAX - 1), &Plain);
    events.extend(reader.feed(&numbered(2, u32::MAX), &Plain));
    events.extend(reader.feed(&numbered(3, 1), &Plain));
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| matches!(e, ReaderEvent::Message(_))));
}

#[test]
fn wraparound_to_zero_is_rejected() {
    let mut generator = SequenceNumberGenerator::starting_after(u32::MAX - 1);
    assert_eq!(generator.next(), u32::MAX);
    assert_eq!(generator.next(), 1);

    let mut seen = SequenceNumberGenerator::starting_after(u32::MAX);
    assert!(!seen.validate(0));
    assert!(seen.accept(1).is_ok());
}

#[test]
fn replayed_chunk_closes_the_channel() {
    let mut pair = Pair::open(SecurityPolicy::Basic256Sha256, MessageSecurityMode::Sign);
    let chunks = pair.client.send_message(1, b"once").unwrap();
    assert_eq!(bodies(&deliver(&mut pair.server, &chunks).events).len(), 1);

    let replay = deliver(&mut pair.server, &chunks);
    match replay.events.as_slice() {
        [ChannelEvent::Faulted(error)] => assert_eq!(error.kind(), ErrorKind::Sequence),
        other => panic!("unexpected events {other:?}"),
    }
    assert_eq!(pair.server.state(), ChannelState::Closed);
    assert!(pair.server.current_token().is_none());
}

#[test]
fn failed_write_leaves_no_gap() {
    let limits = ChannelLimits {
        max_message_size: 1000,
        ..ChannelLimits::default()
    };
    let mut pair = Pair::open_with(
        SecurityPolicy::None,
        MessageSecurityMode::None,
        Side { limits, key_size: 256 },
        Side::default(),
    );
    let refused = pair.client.send_message(1, &pattern(1001));
    assert!(matches!(refused, Err(ChannelError::QuotaExceeded { request_id: 1, .. })));

    // The next message carries the very next sequence number.
    let chunks = pair.client.send_message(2, &pattern(1000)).unwrap();
    let outcome = deliver(&mut pair.server, &chunks);
    assert_eq!(bodies(&outcome.events), vec![Bytes::from(pattern(1000))]);
}
