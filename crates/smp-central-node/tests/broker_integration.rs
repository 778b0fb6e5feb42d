// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end tests against a live broker loop on loopback.

use smp_central_node::{CentralNodeServer, ServerConfig, ServerError};
use smp_protocol::{
    CentralNodeClient, ClientError, Command, CommandCode, ErrorCode, MAX_KEY_LEN, MAX_PACKET_LEN,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(2);

struct Broker {
    server: CentralNodeServer,
    addr: SocketAddr,
    handle: JoinHandle<Result<(), ServerError>>,
}

impl Broker {
    async fn start(config: ServerConfig) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let server = CentralNodeServer::new(config).unwrap();

        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.run_on(socket).await })
        };
        Self {
            server,
            addr,
            handle,
        }
    }

    async fn client(&self, sensor_type: u32) -> CentralNodeClient {
        CentralNodeClient::connect(self.addr, sensor_type)
            .await
            .unwrap()
            .with_response_timeout(Duration::from_millis(500), 2)
    }

    async fn stop(self) {
        self.server.shutdown();
        tokio::time::timeout(WAIT, self.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

fn fast_config() -> ServerConfig {
    ServerConfig {
        tick_interval_ms: 30,
        timeout_limit: 3,
        ..Default::default()
    }
}

/// Wait for the next notification with the given code, skipping others.
async fn expect_notification(client: &mut CentralNodeClient, code: CommandCode) -> Command {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if let Some(command) = client
            .next_notification(Duration::from_millis(50))
            .await
            .unwrap()
        {
            if command.code() == code {
                return command;
            }
        }
    }
    panic!("no {} received", code);
}

fn rejected_with(result: Result<u16, ClientError>, expected: ErrorCode) {
    match result {
        Err(ClientError::Rejected { error, .. }) => assert_eq!(error, expected),
        other => panic!("expected {} rejection, got {:?}", expected, other),
    }
}

#[tokio::test]
async fn test_publish_subscribe_handshake() {
    let broker = Broker::start(ServerConfig::default()).await;
    let mut publisher = broker.client(11).await;
    let mut subscriber = broker.client(22).await;

    let port = publisher.add_publisher("thermo-1").await.unwrap();
    assert_eq!(port, 15002);

    let joined = subscriber.add_subscriber("thermo-1").await.unwrap();
    assert_eq!(joined, port);

    let start = expect_notification(&mut publisher, CommandCode::StartPublishing).await;
    assert!(start.transaction_id() < 0);
    assert_eq!(start.key_str(), Some("thermo-1"));
    assert_eq!(start.sensor_type(), 11);
    publisher.acknowledge(start.transaction_id()).await.unwrap();

    let left = subscriber.remove_subscriber("thermo-1").await.unwrap();
    assert_eq!(left, port);
    expect_notification(&mut publisher, CommandCode::StopPublishing).await;

    broker.stop().await;
}

#[tokio::test]
async fn test_duplicate_publisher_rejected() {
    let broker = Broker::start(ServerConfig::default()).await;
    let mut first = broker.client(0).await;
    let mut second = broker.client(0).await;

    first.add_publisher("p1").await.unwrap();
    rejected_with(first.add_publisher("p1").await, ErrorCode::PubAlreadyExists);
    rejected_with(second.add_publisher("p1").await, ErrorCode::PubAlreadyExists);

    broker.stop().await;
}

#[tokio::test]
async fn test_subscribe_to_unknown_publisher() {
    let broker = Broker::start(ServerConfig::default()).await;
    let mut subscriber = broker.client(0).await;

    rejected_with(
        subscriber.add_subscriber("zzz").await,
        ErrorCode::PubDoesNotExist,
    );

    broker.stop().await;
}

#[tokio::test]
async fn test_remove_publisher_notifies_subscribers() {
    let broker = Broker::start(ServerConfig::default()).await;
    let mut owner = broker.client(0).await;
    let mut intruder = broker.client(0).await;
    let mut subscriber = broker.client(5).await;

    let port = owner.add_publisher("p1").await.unwrap();
    subscriber.add_subscriber("p1").await.unwrap();

    rejected_with(
        intruder.remove_publisher("p1").await,
        ErrorCode::PermissionError,
    );
    assert_eq!(owner.remove_publisher("p1").await.unwrap(), port);

    let removed = expect_notification(&mut subscriber, CommandCode::PublisherRemoved).await;
    assert_eq!(removed.key_str(), Some("p1"));
    assert_eq!(removed.sensor_type(), 5);
    subscriber.acknowledge(removed.transaction_id()).await.unwrap();

    // The key is free again
    owner.add_publisher("p1").await.unwrap();

    broker.stop().await;
}

#[tokio::test]
async fn test_unacknowledged_notification_sent_three_times() {
    // Long enough liveness that the silent raw publisher outlives the retries
    let broker = Broker::start(ServerConfig {
        timeout_limit: 20,
        ..fast_config()
    })
    .await;
    let publisher = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut subscriber = broker.client(0).await;

    let register = Command::with_key(CommandCode::AddPublisher, 1, 0, "p1");
    publisher
        .send_to(&register.encode(), broker.addr)
        .await
        .unwrap();
    let mut buf = [0u8; 64];
    let (len, _) = publisher.recv_from(&mut buf).await.unwrap();
    assert_eq!(Command::decode(&buf[..len]).unwrap().code(), CommandCode::Success);

    subscriber.add_subscriber("p1").await.unwrap();

    let mut starts = Vec::new();
    while let Ok(Ok((len, _))) =
        tokio::time::timeout(Duration::from_millis(300), publisher.recv_from(&mut buf)).await
    {
        let command = Command::decode(&buf[..len]).unwrap();
        if command.code() == CommandCode::StartPublishing {
            starts.push(command);
        }
    }

    assert_eq!(starts.len(), 3);
    assert!(starts.windows(2).all(|pair| pair[0] == pair[1]));

    broker.stop().await;
}

#[tokio::test]
async fn test_rejected_notification_is_resent() {
    // One-second tick: the resend must come from the FAILURE, not a retry tick
    let broker = Broker::start(ServerConfig::default()).await;
    let mut publisher = broker.client(0).await;
    let mut subscriber = broker.client(0).await;

    publisher.add_publisher("p1").await.unwrap();
    subscriber.add_subscriber("p1").await.unwrap();
    let start = expect_notification(&mut publisher, CommandCode::StartPublishing).await;

    publisher
        .reject(start.transaction_id(), ErrorCode::CrcCheckFailure)
        .await
        .unwrap();
    let resent = publisher
        .next_notification(Duration::from_millis(300))
        .await
        .unwrap()
        .expect("notification not resent");
    assert_eq!(resent, start);
    publisher.acknowledge(resent.transaction_id()).await.unwrap();

    broker.stop().await;
}

#[tokio::test]
async fn test_corrupted_packet_answered_with_crc_failure() {
    let broker = Broker::start(ServerConfig::default()).await;
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let mut packet = Command::with_key(CommandCode::AddPublisher, 99, 0, "p1").encode();
    let last = packet.len() - 1;
    packet[last] ^= 0xff;
    peer.send_to(&packet, broker.addr).await.unwrap();

    let mut buf = [0u8; 64];
    let (len, _) = tokio::time::timeout(WAIT, peer.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let response = Command::decode(&buf[..len]).unwrap();
    assert_eq!(response.code(), CommandCode::Failure);
    assert_eq!(response.transaction_id(), 99);
    assert_eq!(response.error_code(), Some(ErrorCode::CrcCheckFailure));

    broker.stop().await;
}

#[tokio::test]
async fn test_oversized_datagram_dropped_with_smallest_buffer() {
    let broker = Broker::start(ServerConfig {
        recv_buffer_size: MAX_PACKET_LEN + 1,
        ..Default::default()
    })
    .await;
    let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut buf = [0u8; 64];

    let oversized = Command::with_key(
        CommandCode::AddPublisher,
        7,
        0,
        "k".repeat(MAX_KEY_LEN + 1),
    );
    let packet = oversized.encode();
    assert_eq!(packet.len(), MAX_PACKET_LEN + 1);
    peer.send_to(&packet, broker.addr).await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(200), peer.recv_from(&mut buf))
            .await
            .is_err(),
        "oversized datagram was answered"
    );

    let largest = Command::with_key(CommandCode::AddPublisher, 8, 0, "k".repeat(MAX_KEY_LEN));
    peer.send_to(&largest.encode(), broker.addr).await.unwrap();
    let (len, _) = tokio::time::timeout(WAIT, peer.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let response = Command::decode(&buf[..len]).unwrap();
    assert_eq!(response.code(), CommandCode::Success);
    assert_eq!(response.transaction_id(), 8);

    broker.stop().await;
}

#[tokio::test]
async fn test_silent_publisher_is_evicted() {
    let broker = Broker::start(fast_config()).await;
    let mut publisher = broker.client(0).await;
    let mut subscriber = broker.client(0).await;

    publisher.add_publisher("p1").await.unwrap();
    subscriber.add_subscriber("p1").await.unwrap();

    // The subscriber keeps itself alive while the publisher goes quiet.
    let deadline = tokio::time::Instant::now() + WAIT;
    let removed = loop {
        assert!(tokio::time::Instant::now() < deadline, "publisher never evicted");
        subscriber.keep_alive("p1").await.unwrap();
        if let Some(command) = subscriber
            .next_notification(Duration::from_millis(20))
            .await
            .unwrap()
        {
            if command.code() == CommandCode::PublisherRemoved {
                break command;
            }
        }
    };
    assert_eq!(removed.key_str(), Some("p1"));
    subscriber.acknowledge(removed.transaction_id()).await.unwrap();

    rejected_with(
        subscriber.add_subscriber("p1").await,
        ErrorCode::PubDoesNotExist,
    );

    broker.stop().await;
}
