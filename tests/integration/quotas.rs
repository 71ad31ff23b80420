use crate::*;

use uasc_channel::chunk::{ChunkReader, ChunkWriter, ReaderEvent, ReaderLimits, WriterLimits};
use uasc_channel::{ChannelError, ChannelState};
use uasc_core::sequence::SequenceNumberGenerator;
use uasc_core::wire::{MessageType, SecurityHeader, SymmetricSecurityHeader};
use uasc_core::StatusCode;

fn receiver_limited_to(max_message_size: usize) -> Side {
    Side {
        limits: ChannelLimits {
            max_message_size,
            ..ChannelLimits::default()
        },
        key_size: 256,
    }
}

#[test]
fn oversized_message_fails_alone_and_channel_stays_open() {
    for (policy, mode) in ALL_MODES {
        let mut pair = Pair::open_with(policy, mode, Side::default(), receiver_limited_to(1000));

        let chunks = pair.client.send_message(5, &pattern(1001)).unwrap();
        let outcome = deliver(&mut pair.server, &chunks);
        assert!(bodies(&outcome.events).is_empty(), "{policy} {mode}");
        match outcome.events.as_slice() {
            [ChannelEvent::MessageFailed {
                request_id: 5,
                error: ChannelError::QuotaExceeded { status, .. },
            }] => assert_eq!(*status, StatusCode::BAD_TCP_MESSAGE_TOO_LARGE),
            other => panic!("{policy} {mode}: unexpected events {other:?}"),
        }
        assert_eq!(pair.server.state(), ChannelState::Open);

        let chunks = pair.client.send_message(6, &pattern(1000)).unwrap();
        let outcome = deliver(&mut pair.server, &chunks);
        assert_eq!(bodies(&outcome.events), vec![Bytes::from(pattern(1000))]);
    }
}

#[test]
fn quota_trips_before_the_final_chunk() {
    // 24 bytes of headers leave exactly 1001 body bytes per chunk.
    let writer = ChunkWriter::new(WriterLimits {
        chunk_size: 1025,
        max_message_size: 0,
        max_chunk_count: 0,
    });
    let security = uasc_channel::ChunkSecurity::None;
    let header = SecurityHeader::Symmetric(SymmetricSecurityHeader::new(1));
    let mut message = writer
        .begin(MessageType::Message, 9, 1, header, &security, SequenceNumberGenerator::new())
        .unwrap();
    writer.write(&mut message, &pattern(1500), &security).unwrap();
    let written = writer.end(message, &security).unwrap();
    assert_eq!(written.chunks.len(), 2);
    assert_eq!(written.chunks[0].len(), 1025);

    let mut reader = ChunkReader::new(ReaderLimits {
        max_chunk_size: 8192,
        max_message_size: 1000,
        max_chunk_count: 0,
        max_pending_messages: 0,
    });
    let first = reader.feed(&written.chunks[0], &Plain);
    assert!(matches!(
        first.as_slice(),
        [ReaderEvent::Failed(ChannelError::QuotaExceeded { request_id: 9, .. })]
    ));
    // The Final chunk of the dropped message is swallowed.
    assert!(reader.feed(&written.chunks[1], &Plain).is_empty());
    assert_eq!(reader.pending_count(), 0);
    assert!(!reader.is_failed());
}

#[test]
fn chunk_count_limit_on_the_receiver() {
    let limits = ChannelLimits {
        send_buffer_size: 8192,
        receive_buffer_size: 8192,
        max_message_size: 0,
        max_chunk_count: 2,
        max_pending_messages: 0,
    };
    let mut pair = Pair::open_with(
        SecurityPolicy::Basic256Sha256,
        MessageSecurityMode::Sign,
        Side {
            limits: ChannelLimits {
                max_chunk_count: 0,
                ..limits
            },
            key_size: 256,
        },
        Side { limits, key_size: 256 },
    );
    let chunks = pair.client.send_message(3, &pattern(3 * 8192)).unwrap();
    assert!(chunks.len() > 2);
    let outcome = deliver(&mut pair.server, &chunks);
    assert!(matches!(
        outcome.events.as_slice(),
        [ChannelEvent::MessageFailed { request_id: 3, .. }]
    ));
    assert!(pair.server.is_open());
}

#[test]
fn sender_refuses_before_producing_anything() {
    let limits = ChannelLimits {
        send_buffer_size: 8192,
        receive_buffer_size: 8192,
        max_message_size: 0,
        max_chunk_count: 4,
        max_pending_messages: 0,
    };
    let mut pair = Pair::open_with(
        SecurityPolicy::Basic256Sha256,
        MessageSecurityMode::SignAndEncrypt,
        Side { limits, key_size: 256 },
        Side::default(),
    );
    let max_body = pair.client.max_body_size().unwrap();

    let refused = pair.client.send_message(1, &pattern(4 * max_body + 1));
    match refused {
        Err(ChannelError::QuotaExceeded { request_id, status, .. }) => {
            assert_eq!(request_id, 1);
            assert_eq!(status, StatusCode::BAD_REQUEST_TOO_LARGE);
        }
        other => panic!("unexpected result {other:?}"),
    }

    let chunks = pair.client.send_message(2, &pattern(4 * max_body)).unwrap();
    assert_eq!(chunks.len(), 4);
    assert_eq!(bodies(&deliver(&mut pair.server, &chunks).events).len(), 1);
}
