use crate::*;

use uasc_channel::{ChannelError, ChannelState, ChunkWriter, WriterLimits};
use uasc_core::wire::{AsymmetricSecurityHeader, ChunkHeader, MessageType, SecurityHeader};
use uasc_core::{SequenceNumberGenerator, StatusCode};

fn keyed(key_size: usize) -> Side {
    Side {
        key_size,
        ..Side::default()
    }
}

#[test]
fn handshake_with_2048_and_4096_bit_keys() {
    for (policy, mode) in ALL_MODES.into_iter().filter(|(p, _)| !p.is_none()) {
        for (client_key, server_key) in [(256, 256), (512, 512), (256, 512), (512, 256)] {
            let mut pair = Pair::open_with(policy, mode, keyed(client_key), keyed(server_key));
            let chunks = pair.client.send_message(2, &pattern(5000)).unwrap();
            let outcome = deliver(&mut pair.server, &chunks);
            assert_eq!(
                bodies(&outcome.events),
                vec![Bytes::from(pattern(5000))],
                "{policy} {mode} keys {client_key}/{server_key}"
            );
        }
    }
}

#[test]
fn open_request_header_is_readable_and_body_is_not() {
    let mut pair = Pair::new(
        SecurityPolicy::Basic256Sha256,
        MessageSecurityMode::Sign,
        Side::default(),
        Side::default(),
    );
    let request = pair.client.open(60_000).unwrap();
    assert_eq!(request.len(), 1);
    let chunk = &request[0];

    let header = ChunkHeader::parse(chunk).unwrap();
    assert_eq!(header.message_type().unwrap(), MessageType::OpenSecureChannel);
    assert_eq!(header.secure_channel_id(), 0);
    assert_eq!(header.message_size(), chunk.len());

    let mut cursor = &chunk[12..];
    let SecurityHeader::Asymmetric(asymmetric) =
        SecurityHeader::decode(MessageType::OpenSecureChannel, &mut cursor).unwrap()
    else {
        panic!("OPN chunks carry the asymmetric header");
    };
    assert_eq!(asymmetric.security_policy_uri, SecurityPolicy::Basic256Sha256.uri());
    let client_certs = FakeCertificates::new(CLIENT_CERT_ID, 256);
    let server_certs = FakeCertificates::new(SERVER_CERT_ID, 256);
    assert_eq!(asymmetric.sender_certificate, Some(client_certs.own_certificate()));
    assert_eq!(
        asymmetric.receiver_thumbprint,
        Some(server_certs.own_thumbprint())
    );
    // Encrypted even in Sign mode: whole cipher blocks follow the header.
    assert_eq!(cursor.len() % 256, 0);
}

#[test]
fn wrong_receiver_thumbprint_is_rejected() {
    let clock = Arc::new(ManualClock::default());
    let stranger = FakeCertificates::new(9, 256);
    let mut client = SecureChannel::new(
        ChannelOptions::new(Role::Client, SecurityPolicy::Basic256Sha256, MessageSecurityMode::Sign)
            .with_certificates(Arc::new(FakeCertificates::new(CLIENT_CERT_ID, 256)))
            .with_remote_certificate(stranger.own_certificate())
            .with_clock(clock.clone()),
        0,
    )
    .unwrap();
    let mut server = SecureChannel::new(
        ChannelOptions::new(Role::Server, SecurityPolicy::Basic256Sha256, MessageSecurityMode::Sign)
            .with_certificates(Arc::new(FakeCertificates::new(SERVER_CERT_ID, 256)))
            .with_clock(clock),
        SERVER_CHANNEL_ID,
    )
    .unwrap();

    let outcome = deliver(&mut server, &client.open(60_000).unwrap());
    assert!(outcome.outbound.is_empty());
    assert!(matches!(
        outcome.events.as_slice(),
        [ChannelEvent::Faulted(ChannelError::Security { status })]
            if *status == StatusCode::BAD_NO_VALID_CERTIFICATES
    ));
    assert_eq!(server.state(), ChannelState::Closed);
}

#[test]
fn tampered_open_request_is_rejected() {
    let mut pair = Pair::new(
        SecurityPolicy::Aes128Sha256RsaOaep,
        MessageSecurityMode::SignAndEncrypt,
        Side::default(),
        Side::default(),
    );
    let mut request = pair.client.open(60_000).unwrap()[0].to_vec();
    let last = request.len() - 1;
    request[last] ^= 0x80;

    let outcome = pair.server.feed(&request);
    assert!(matches!(
        outcome.events.as_slice(),
        [ChannelEvent::Faulted(ChannelError::Security { .. })]
    ));
}

#[test]
fn mode_mismatch_is_rejected() {
    let clock = Arc::new(ManualClock::default());
    let server_certs = Arc::new(FakeCertificates::new(SERVER_CERT_ID, 256));
    let mut client = SecureChannel::new(
        ChannelOptions::new(Role::Client, SecurityPolicy::Basic256Sha256, MessageSecurityMode::Sign)
            .with_certificates(Arc::new(FakeCertificates::new(CLIENT_CERT_ID, 256)))
            .with_remote_certificate(server_certs.own_certificate())
            .with_clock(clock.clone()),
        0,
    )
    .unwrap();
    let mut server = SecureChannel::new(
        ChannelOptions::new(
            Role::Server,
            SecurityPolicy::Basic256Sha256,
            MessageSecurityMode::SignAndEncrypt,
        )
        .with_certificates(server_certs)
        .with_clock(clock),
        SERVER_CHANNEL_ID,
    )
    .unwrap();

    let outcome = deliver(&mut server, &client.open(60_000).unwrap());
    assert!(matches!(
        outcome.events.as_slice(),
        [ChannelEvent::Faulted(ChannelError::Security { status })]
            if *status == StatusCode::BAD_SECURITY_POLICY_REJECTED
    ));
}

#[test]
fn signing_failure_on_a_later_chunk_emits_nothing() {
    let client_certs = FlakyCertificates::new(CLIENT_CERT_ID, 256);
    let server_certs = FakeCertificates::new(SERVER_CERT_ID, 256);
    let remote = server_certs.own_certificate();
    let policy = SecurityPolicy::Basic256Sha256;
    let security = ChunkSecurity::Asymmetric {
        policy,
        certificates: &client_certs,
        remote_certificate: &remote,
    };
    let header = SecurityHeader::Asymmetric(AsymmetricSecurityHeader {
        security_policy_uri: policy.uri().to_string(),
        sender_certificate: Some(client_certs.own_certificate()),
        receiver_thumbprint: Some(client_certs.thumbprint(&remote)),
    });
    let writer = ChunkWriter::new(WriterLimits {
        chunk_size: 8192,
        max_message_size: 0,
        max_chunk_count: 0,
    });
    let sequence = SequenceNumberGenerator::new();
    let body = pattern(20_000);

    client_certs.fail_after(1);
    let mut message = writer
        .begin(MessageType::OpenSecureChannel, 1, 0, header.clone(), &security, sequence)
        .unwrap();
    let result = writer
        .write(&mut message, &body, &security)
        .and_then(|()| writer.end(message, &security));
    assert!(matches!(result, Err(ChannelError::Encoding { .. })));
    assert_eq!(client_certs.attempts(), 2);

    // The untouched generator numbers the retry from the start.
    client_certs.recover();
    let mut message = writer
        .begin(MessageType::OpenSecureChannel, 1, 0, header, &security, sequence)
        .unwrap();
    writer.write(&mut message, &body, &security).unwrap();
    let written = writer.end(message, &security).unwrap();
    assert!(written.chunks.len() >= 3);
    assert_eq!(written.sequence.last(), written.chunks.len() as u32);
}
