use crate::*;

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

use uasc_channel::{ChannelHandle, ChannelManager, ChannelState, ErrorKind, ManagerOptions, Transport};
use uasc_core::wire::MessageType;
use uasc_core::StatusCode;

/// Outbound chunks queued until the test pumps them.
#[derive(Default)]
struct MemoryTransport {
    queue: Mutex<VecDeque<Bytes>>,
    closed: Mutex<Vec<ChannelHandle>>,
}

impl MemoryTransport {
    fn take(&self) -> Vec<Bytes> {
        self.queue.lock().unwrap().drain(..).collect()
    }
}

impl Transport for MemoryTransport {
    fn send(&self, _handle: ChannelHandle, chunk: Bytes) -> io::Result<()> {
        self.queue.lock().unwrap().push_back(chunk);
        Ok(())
    }

    fn close(&self, handle: ChannelHandle) {
        self.closed.lock().unwrap().push(handle);
    }
}

struct Endpoint {
    manager: Arc<ChannelManager>,
    transport: Arc<MemoryTransport>,
    handle: ChannelHandle,
    received: Arc<Mutex<Vec<(u32, MessageType, Bytes)>>>,
    errors: Arc<Mutex<Vec<(ErrorKind, Option<u32>)>>>,
}

impl Endpoint {
    fn new(options: ManagerOptions, policy: SecurityPolicy, mode: MessageSecurityMode) -> Self {
        let transport = Arc::new(MemoryTransport::default());
        let manager = Arc::new(ChannelManager::new(options, transport.clone()));
        let handle = manager.open_channel(policy.uri(), mode).unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        manager
            .on_message(handle, move |request_id, message_type, body| {
                sink.lock().unwrap().push((request_id, message_type, body));
            })
            .unwrap();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        manager
            .on_error(handle, move |error| {
                sink.lock().unwrap().push((error.kind(), error.request_id()));
            })
            .unwrap();

        Self {
            manager,
            transport,
            handle,
            received,
            errors,
        }
    }
}

/// Move queued chunks both ways until both queues are empty.
fn pump(client: &Endpoint, server: &Endpoint) {
    loop {
        let to_server = client.transport.take();
        let to_client = server.transport.take();
        if to_server.is_empty() && to_client.is_empty() {
            return;
        }
        for chunk in to_server {
            let _ = server.manager.on_bytes(server.handle, &chunk);
        }
        for chunk in to_client {
            let _ = client.manager.on_bytes(client.handle, &chunk);
        }
    }
}

fn connect(policy: SecurityPolicy, mode: MessageSecurityMode, clock: Arc<ManualClock>) -> (Endpoint, Endpoint) {
    let server_certs = Arc::new(FakeCertificates::new(SERVER_CERT_ID, 512));
    let server = Endpoint::new(
        ManagerOptions::new(Role::Server)
            .with_certificates(server_certs.clone())
            .with_clock(clock.clone()),
        policy,
        mode,
    );
    let client = Endpoint::new(
        ManagerOptions::new(Role::Client)
            .with_certificates(Arc::new(FakeCertificates::new(CLIENT_CERT_ID, 256)))
            .with_remote_certificate(server_certs.own_certificate())
            .with_requested_lifetime(secs(60))
            .with_clock(clock),
        policy,
        mode,
    );
    pump(&client, &server);
    (client, server)
}

#[test]
fn request_response_through_managers() {
    for (policy, mode) in ALL_MODES {
        let (client, server) = connect(policy, mode, Arc::new(ManualClock::default()));
        assert_eq!(client.manager.state(client.handle), Some(ChannelState::Open));
        assert_eq!(server.manager.state(server.handle), Some(ChannelState::Open));

        let request_id = client.manager.next_request_id(client.handle).unwrap();
        client
            .manager
            .send_message(client.handle, MessageType::Message, request_id, &pattern(150_000))
            .unwrap();
        pump(&client, &server);
        {
            let received = server.received.lock().unwrap();
            assert_eq!(received.len(), 1, "{policy} {mode}");
            assert_eq!(received[0].0, request_id);
            assert_eq!(received[0].2, Bytes::from(pattern(150_000)));
        }

        server
            .manager
            .send_message(server.handle, MessageType::Message, request_id, b"response")
            .unwrap();
        pump(&client, &server);
        assert_eq!(
            *client.received.lock().unwrap(),
            vec![(request_id, MessageType::Message, Bytes::from_static(b"response"))]
        );
    }
}

#[test]
fn renew_due_tokens_renews_only_when_due() {
    let clock = Arc::new(ManualClock::default());
    let (client, server) = connect(
        SecurityPolicy::Basic256Sha256,
        MessageSecurityMode::SignAndEncrypt,
        clock.clone(),
    );
    assert_eq!(client.manager.renew_due_tokens(), 0);

    clock.advance(secs(46));
    assert_eq!(client.manager.renew_due_tokens(), 1);
    assert_eq!(client.manager.state(client.handle), Some(ChannelState::Renewing));
    pump(&client, &server);
    assert_eq!(client.manager.state(client.handle), Some(ChannelState::Open));
    assert_eq!(client.manager.renew_due_tokens(), 0);

    // Past the first token's grace window, the second one carries traffic.
    clock.advance(secs(60));
    client
        .manager
        .send_message(client.handle, MessageType::Message, 1, b"on token 2")
        .unwrap();
    pump(&client, &server);
    assert_eq!(server.received.lock().unwrap().len(), 1);
}

#[test]
fn abort_reaches_the_error_callback() {
    let (client, server) = connect(
        SecurityPolicy::Basic256Sha256,
        MessageSecurityMode::Sign,
        Arc::new(ManualClock::default()),
    );
    server
        .manager
        .abort_message(server.handle, 4, StatusCode::BAD_RESPONSE_TOO_LARGE, "response too large")
        .unwrap();
    pump(&client, &server);

    assert!(client.received.lock().unwrap().is_empty());
    assert_eq!(
        *client.errors.lock().unwrap(),
        vec![(ErrorKind::AbortedByPeer, Some(4))]
    );
    assert_eq!(client.manager.state(client.handle), Some(ChannelState::Open));
}

#[test]
fn quota_violation_reports_request_and_keeps_channel() {
    let clock = Arc::new(ManualClock::default());
    let server_certs = Arc::new(FakeCertificates::new(SERVER_CERT_ID, 256));
    let server = Endpoint::new(
        ManagerOptions::new(Role::Server)
            .with_certificates(server_certs.clone())
            .with_limits(uasc_channel::ChannelLimits {
                max_message_size: 1000,
                ..uasc_channel::ChannelLimits::default()
            })
            .with_clock(clock.clone()),
        SecurityPolicy::Basic256Sha256,
        MessageSecurityMode::Sign,
    );
    let client = Endpoint::new(
        ManagerOptions::new(Role::Client)
            .with_certificates(Arc::new(FakeCertificates::new(CLIENT_CERT_ID, 256)))
            .with_remote_certificate(server_certs.own_certificate())
            .with_clock(clock),
        SecurityPolicy::Basic256Sha256,
        MessageSecurityMode::Sign,
    );
    pump(&client, &server);

    client
        .manager
        .send_message(client.handle, MessageType::Message, 21, &pattern(1001))
        .unwrap();
    pump(&client, &server);
    assert!(server.received.lock().unwrap().is_empty());
    assert_eq!(
        *server.errors.lock().unwrap(),
        vec![(ErrorKind::QuotaExceeded, Some(21))]
    );
    assert_eq!(server.manager.state(server.handle), Some(ChannelState::Open));
}

#[test]
fn failed_open_sends_nothing_and_keeps_no_channel() {
    let server_certs = FakeCertificates::new(SERVER_CERT_ID, 256);
    let client_certs = Arc::new(FlakyCertificates::new(CLIENT_CERT_ID, 256));
    client_certs.fail_after(0);
    let transport = Arc::new(MemoryTransport::default());
    let manager = ChannelManager::new(
        ManagerOptions::new(Role::Client)
            .with_certificates(client_certs.clone())
            .with_remote_certificate(server_certs.own_certificate()),
        transport.clone(),
    );

    let result = manager.open_channel(SecurityPolicy::Basic256Sha256.uri(), MessageSecurityMode::Sign);
    assert!(matches!(result, Err(ChannelError::Encoding { .. })));
    assert!(transport.take().is_empty());
    assert_eq!(manager.channel_count(), 0);
    assert_eq!(client_certs.attempts(), 1);
}

#[test]
fn failed_renewal_sends_nothing_and_leaves_no_sequence_gap() {
    let clock = Arc::new(ManualClock::default());
    let server_certs = Arc::new(FakeCertificates::new(SERVER_CERT_ID, 256));
    let client_certs = Arc::new(FlakyCertificates::new(CLIENT_CERT_ID, 256));
    let server = Endpoint::new(
        ManagerOptions::new(Role::Server)
            .with_certificates(server_certs.clone())
            .with_clock(clock.clone()),
        SecurityPolicy::Basic256Sha256,
        MessageSecurityMode::SignAndEncrypt,
    );
    let client = Endpoint::new(
        ManagerOptions::new(Role::Client)
            .with_certificates(client_certs.clone())
            .with_remote_certificate(server_certs.own_certificate())
            .with_clock(clock),
        SecurityPolicy::Basic256Sha256,
        MessageSecurityMode::SignAndEncrypt,
    );
    pump(&client, &server);
    assert_eq!(client.manager.state(client.handle), Some(ChannelState::Open));

    client_certs.fail_after(0);
    let result = client.manager.renew_token(client.handle, secs(60));
    assert!(matches!(result, Err(ChannelError::Encoding { .. })));
    assert!(client.transport.take().is_empty());
    assert_eq!(client.manager.state(client.handle), Some(ChannelState::Open));

    // The server checks every sequence number, so a gap would fault it.
    client_certs.recover();
    client.manager.renew_token(client.handle, secs(60)).unwrap();
    pump(&client, &server);
    assert_eq!(client.manager.state(client.handle), Some(ChannelState::Open));
    client
        .manager
        .send_message(client.handle, MessageType::Message, 30, b"after the retry")
        .unwrap();
    pump(&client, &server);

    assert!(server.errors.lock().unwrap().is_empty());
    assert_eq!(server.manager.state(server.handle), Some(ChannelState::Open));
    assert_eq!(
        *server.received.lock().unwrap(),
        vec![(30, MessageType::Message, Bytes::from_static(b"after the retry"))]
    );
}

#[test]
fn close_from_client_removes_both_sides() {
    let (client, server) = connect(
        SecurityPolicy::None,
        MessageSecurityMode::None,
        Arc::new(ManualClock::default()),
    );
    client.manager.close_channel(client.handle).unwrap();
    pump(&client, &server);

    assert_eq!(client.manager.channel_count(), 0);
    assert_eq!(server.manager.channel_count(), 0);
    assert_eq!(*server.transport.closed.lock().unwrap(), vec![server.handle]);
    assert!(server.errors.lock().unwrap().is_empty());
}

#[test]
fn fatal_error_notifies_and_removes() {
    let (client, server) = connect(
        SecurityPolicy::Aes256Sha256RsaPss,
        MessageSecurityMode::SignAndEncrypt,
        Arc::new(ManualClock::default()),
    );
    client
        .manager
        .send_message(client.handle, MessageType::Message, 1, b"secret")
        .unwrap();
    let mut chunk = client.transport.take().remove(0).to_vec();
    let middle = chunk.len() / 2;
    chunk[middle] ^= 0xff;
    server.manager.on_bytes(server.handle, &chunk).unwrap();

    assert_eq!(*server.errors.lock().unwrap(), vec![(ErrorKind::Security, None)]);
    assert!(server.received.lock().unwrap().is_empty());
    assert_eq!(server.manager.state(server.handle), None);
    assert!(server.manager.on_bytes(server.handle, b"more").is_err());
}

#[test]
fn transport_loss_discards_the_channel() {
    let (client, server) = connect(
        SecurityPolicy::None,
        MessageSecurityMode::None,
        Arc::new(ManualClock::default()),
    );
    server.manager.on_transport_lost(server.handle);
    assert_eq!(server.manager.state(server.handle), None);
    assert_eq!(
        server
            .manager
            .send_message(server.handle, MessageType::Message, 1, b"x")
            .unwrap_err()
            .status(),
        StatusCode::BAD_SECURE_CHANNEL_CLOSED
    );
    drop(client);
}
