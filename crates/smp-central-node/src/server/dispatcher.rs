// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Command dispatcher.
//!
//! [`CentralNode`] owns the registry and the transaction table and turns one
//! inbound datagram into at most one response. Notifications it originates
//! are queued in an outbox that the broker loop drains after every step.

use super::registry::{Registry, StateError};
use super::transaction::TransactionTable;
use crate::config::ServerConfig;
use smp_protocol::{
    peek_transaction_id, Command, CommandCode, DecodeError, ErrorCode, MAX_PACKET_LEN,
    MIN_PACKET_LEN,
};
use std::net::SocketAddr;
use std::ops::Range;
use tracing::{debug, info, trace, warn};

/// Sensor type carried by every response the central node sends.
pub const CENTRAL_NODE_SENSOR_TYPE: u32 = 0;

/// A command queued for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub destination: SocketAddr,
    pub command: Command,
}

/// Tunables of the central node state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSettings {
    /// Ticks without a keep-alive before eviction
    pub timeout_limit: u32,

    /// Retransmissions beyond the first send
    pub max_retransmissions: u32,

    /// Broadcast ports handed to publishers
    pub port_range: Range<u16>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for NodeSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            timeout_limit: config.timeout_limit,
            max_retransmissions: config.max_retransmissions,
            port_range: config.port_range(),
        }
    }
}

/// Central node state: registry, outstanding transactions and outbox.
#[derive(Debug)]
pub struct CentralNode {
    pub(super) registry: Registry,
    pub(super) transactions: TransactionTable,
    pub(super) settings: NodeSettings,
    outbox: Vec<Outbound>,
}

impl Default for CentralNode {
    fn default() -> Self {
        Self::new(NodeSettings::default())
    }
}

impl CentralNode {
    pub fn new(settings: NodeSettings) -> Self {
        Self {
            registry: Registry::new(settings.port_range.clone()),
            transactions: TransactionTable::new(),
            settings,
            outbox: Vec::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn transactions(&self) -> &TransactionTable {
        &self.transactions
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    /// Take every command queued since the last call.
    pub fn drain_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    /// Send a tracked notification carrying `key`.
    pub(super) fn notify(
        &mut self,
        code: CommandCode,
        key: &str,
        sensor_type: u32,
        destination: SocketAddr,
    ) {
        let command = self.transactions.open(code, sensor_type, key, destination);
        debug!("Opened transaction {} to {}", command, destination);
        self.outbox.push(Outbound {
            destination,
            command,
        });
    }

    /// Queue an untracked send of an already recorded command.
    pub(super) fn resend(&mut self, destination: SocketAddr, command: Command) {
        self.outbox.push(Outbound {
            destination,
            command,
        });
    }

    /// Handle one received datagram.
    ///
    /// Returns the response to send back to `from`, if any.
    pub fn handle(&mut self, packet: &[u8], from: SocketAddr) -> Option<Command> {
        if !(MIN_PACKET_LEN..=MAX_PACKET_LEN).contains(&packet.len()) {
            trace!("Dropping {}-byte datagram from {}", packet.len(), from);
            return None;
        }

        let command = match Command::decode(packet) {
            Ok(command) => command,
            Err(e) => {
                warn!("Bad packet from {}: {}", from, e);
                let error = match e {
                    DecodeError::Format(_) => ErrorCode::InvalidCommand,
                    DecodeError::Integrity { .. } => ErrorCode::CrcCheckFailure,
                };
                let transaction_id = peek_transaction_id(packet).unwrap_or(0);
                return Some(failure(transaction_id, error));
            }
        };

        trace!("Received {} from {}", command, from);
        self.dispatch(&command, from)
    }

    fn dispatch(&mut self, command: &Command, from: SocketAddr) -> Option<Command> {
        let transaction_id = command.transaction_id();
        let result = match command.code() {
            CommandCode::KeepAlive => {
                let refreshed = self.registry.touch(from);
                trace!("Keep-alive from {} refreshed {} entries", from, refreshed);
                return None;
            }
            CommandCode::AddPublisher => self.add_publisher(command, from),
            CommandCode::RemovePublisher => self.remove_publisher(command, from),
            CommandCode::AddSubscriber => self.add_subscriber(command, from),
            CommandCode::RemoveSubscriber => self.remove_subscriber(command, from),
            CommandCode::Success => match self.acknowledge(transaction_id, from) {
                Ok(()) => return None,
                Err(e) => Err(e),
            },
            CommandCode::Failure => {
                self.retransmit_on_failure(command, from);
                return None;
            }
            CommandCode::PublisherRemoved
            | CommandCode::StartPublishing
            | CommandCode::StopPublishing => {
                debug!("{} is not a request, rejecting from {}", command.code(), from);
                return Some(failure(transaction_id, ErrorCode::InvalidCommand));
            }
        };

        Some(match result {
            Ok(value) => Command::success(transaction_id, CENTRAL_NODE_SENSOR_TYPE, value),
            Err(e) => {
                debug!("{} from {} rejected: {}", command.code(), from, e);
                failure(transaction_id, e.error_code())
            }
        })
    }

    fn add_publisher(&mut self, command: &Command, from: SocketAddr) -> Result<u32, StateError> {
        let key = key_of(command)?;
        let publisher = self
            .registry
            .add_publisher(key, from, command.sensor_type())?;

        info!(
            "Publisher {:?} registered by {} on port {}",
            key, from, publisher.broadcast_port
        );
        Ok(u32::from(publisher.broadcast_port))
    }

    fn remove_publisher(&mut self, command: &Command, from: SocketAddr) -> Result<u32, StateError> {
        let key = key_of(command)?;
        let publisher = self.registry.remove_publisher(key, from)?;

        for subscriber in publisher.subscribers() {
            self.notify(
                CommandCode::PublisherRemoved,
                &publisher.key,
                subscriber.sensor_type,
                subscriber.address,
            );
        }
        info!(
            "Publisher {:?} removed by owner, {} subscribers notified",
            publisher.key,
            publisher.subscriber_count()
        );
        Ok(u32::from(publisher.broadcast_port))
    }

    fn add_subscriber(&mut self, command: &Command, from: SocketAddr) -> Result<u32, StateError> {
        let key = key_of(command)?;
        let change = self
            .registry
            .add_subscriber(key, from, command.sensor_type())?;

        if change.notify_publisher {
            self.notify(
                CommandCode::StartPublishing,
                key,
                change.publisher_sensor_type,
                change.publisher_address,
            );
        }
        info!("{} subscribed to {:?}", from, key);
        Ok(u32::from(change.broadcast_port))
    }

    fn remove_subscriber(&mut self, command: &Command, from: SocketAddr) -> Result<u32, StateError> {
        let key = key_of(command)?;
        let change = self.registry.remove_subscriber(key, from)?;

        if change.notify_publisher {
            self.notify(
                CommandCode::StopPublishing,
                key,
                change.publisher_sensor_type,
                change.publisher_address,
            );
        }
        info!("{} unsubscribed from {:?}", from, key);
        Ok(u32::from(change.broadcast_port))
    }

    /// Close an outstanding transaction.
    ///
    /// Any sender may acknowledge; an ack from an address other than the
    /// destination is logged.
    fn acknowledge(&mut self, transaction_id: i16, from: SocketAddr) -> Result<(), StateError> {
        let tx = self
            .transactions
            .acknowledge(transaction_id)
            .ok_or(StateError::UnknownTransaction(transaction_id))?;

        if tx.destination == from {
            debug!("Transaction {} acknowledged by {}", tx.command, from);
        } else {
            debug!(
                "Transaction {} sent to {} acknowledged by {}",
                tx.command, tx.destination, from
            );
        }
        Ok(())
    }

    /// A peer reported a failure for one of our transactions: resend it now.
    ///
    /// The retry budget is left untouched.
    fn retransmit_on_failure(&mut self, command: &Command, from: SocketAddr) {
        let transaction_id = command.transaction_id();
        let Some(tx) = self.transactions.get(transaction_id) else {
            debug!("Ignoring {} from {} for unknown transaction", command, from);
            return;
        };

        debug!("Peer {} reported {}, resending", from, command);
        let (destination, original) = (tx.destination, tx.command.clone());
        self.resend(destination, original);
    }
}

fn failure(transaction_id: i16, error: ErrorCode) -> Command {
    Command::failure(transaction_id, CENTRAL_NODE_SENSOR_TYPE, error)
}

/// Publisher key carried by a request.
fn key_of(command: &Command) -> Result<&str, StateError> {
    command.key_str().ok_or(StateError::InvalidKey)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smp_protocol::{Payload, MAX_KEY_LEN};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 10], port))
    }

    fn request(code: CommandCode, tx: i16, key: &str) -> Vec<u8> {
        Command::with_key(code, tx, 4, key).encode()
    }

    fn ack(tx: i16) -> Vec<u8> {
        Command::success(tx, 0, 0).encode()
    }

    fn assert_failure(response: Option<Command>, tx: i16, error: ErrorCode) {
        let response = response.expect("expected a response");
        assert_eq!(response.code(), CommandCode::Failure);
        assert_eq!(response.transaction_id(), tx);
        assert_eq!(response.error_code(), Some(error));
    }

    fn assert_success(response: Option<Command>, tx: i16) -> u32 {
        let response = response.expect("expected a response");
        assert_eq!(response.code(), CommandCode::Success, "got {}", response);
        assert_eq!(response.transaction_id(), tx);
        assert_eq!(response.sensor_type(), CENTRAL_NODE_SENSOR_TYPE);
        response.value().unwrap()
    }

    #[test]
    fn test_length_bounds_are_silent() {
        let mut node = CentralNode::default();
        assert!(node.handle(&[0u8; 12], addr(1)).is_none());
        assert!(node.handle(&[0u8; 45], addr(1)).is_none());
        assert!(node.drain_outbound().is_empty());
    }

    #[test]
    fn test_length_bounds_are_inclusive() {
        let mut node = CentralNode::default();

        let shortest = request(CommandCode::AddPublisher, 1, "a");
        assert_eq!(shortest.len(), MIN_PACKET_LEN);
        assert_eq!(assert_success(node.handle(&shortest, addr(1)), 1), 15002);

        let longest_key = "k".repeat(MAX_KEY_LEN);
        let longest = request(CommandCode::AddPublisher, 2, &longest_key);
        assert_eq!(longest.len(), MAX_PACKET_LEN);
        assert_eq!(assert_success(node.handle(&longest, addr(1)), 2), 15003);
        assert!(node.registry().publisher(&longest_key).is_some());
    }

    #[test]
    fn test_corrupted_packet_gets_crc_failure() {
        let mut node = CentralNode::default();
        let mut packet = request(CommandCode::AddPublisher, 17, "p1");
        packet[9] ^= 0x01;

        assert_failure(node.handle(&packet, addr(1)), 17, ErrorCode::CrcCheckFailure);
        assert_eq!(node.registry().publisher_count(), 0);
    }

    #[test]
    fn test_unknown_code_gets_invalid_command() {
        let mut node = CentralNode::default();
        let mut packet = request(CommandCode::AddPublisher, 3, "p1");
        packet[0] = 42;

        assert_failure(node.handle(&packet, addr(1)), 3, ErrorCode::InvalidCommand);
    }

    #[test]
    fn test_ack_with_wrong_payload_length_gets_invalid_command() {
        let mut node = CentralNode::default();
        // 13 bytes cannot hold a 4-byte SUCCESS value
        let mut packet = request(CommandCode::AddPublisher, 5, "x");
        packet[0] = CommandCode::Success as u8;
        assert_failure(node.handle(&packet, addr(1)), 5, ErrorCode::InvalidCommand);
    }

    #[test]
    fn test_keep_alive_has_no_response() {
        let mut node = CentralNode::default();
        let packet = request(CommandCode::KeepAlive, 0, "p1");
        assert!(node.handle(&packet, addr(1)).is_none());
    }

    #[test]
    fn test_add_publisher_once() {
        let mut node = CentralNode::default();

        let port = assert_success(
            node.handle(&request(CommandCode::AddPublisher, 1, "p1"), addr(1)),
            1,
        );
        assert_eq!(port, 15002);

        for from in [addr(1), addr(2)] {
            assert_failure(
                node.handle(&request(CommandCode::AddPublisher, 2, "p1"), from),
                2,
                ErrorCode::PubAlreadyExists,
            );
        }
        assert_eq!(node.registry().publisher_count(), 1);
    }

    #[test]
    fn test_add_publisher_records_sensor_type() {
        let mut node = CentralNode::default();
        node.handle(&request(CommandCode::AddPublisher, 1, "p1"), addr(1));
        assert_eq!(node.registry().publisher("p1").unwrap().sensor_type, 4);
    }

    #[test]
    fn test_non_utf8_key_is_invalid() {
        let mut node = CentralNode::default();
        let packet = Command::with_key(CommandCode::AddPublisher, 8, 0, vec![0xff, 0xfe]).encode();
        assert_failure(node.handle(&packet, addr(1)), 8, ErrorCode::InvalidCommand);
    }

    #[test]
    fn test_remove_publisher_permission() {
        let mut node = CentralNode::default();
        node.handle(&request(CommandCode::AddPublisher, 1, "p1"), addr(1));

        assert_failure(
            node.handle(&request(CommandCode::RemovePublisher, 2, "p1"), addr(2)),
            2,
            ErrorCode::PermissionError,
        );
        assert!(node.registry().publisher("p1").is_some());

        let port = assert_success(
            node.handle(&request(CommandCode::RemovePublisher, 3, "p1"), addr(1)),
            3,
        );
        assert_eq!(port, 15002);
        assert!(node.registry().publisher("p1").is_none());
    }

    #[test]
    fn test_remove_unknown_publisher() {
        let mut node = CentralNode::default();
        assert_failure(
            node.handle(&request(CommandCode::RemovePublisher, 2, "p1"), addr(1)),
            2,
            ErrorCode::PubDoesNotExist,
        );
    }

    #[test]
    fn test_remove_publisher_notifies_subscribers() {
        let mut node = CentralNode::default();
        node.handle(&request(CommandCode::AddPublisher, 1, "p1"), addr(1));
        node.handle(&request(CommandCode::AddSubscriber, 2, "p1"), addr(2));
        node.handle(&request(CommandCode::AddSubscriber, 3, "p1"), addr(3));
        node.drain_outbound();

        node.handle(&request(CommandCode::RemovePublisher, 4, "p1"), addr(1));
        let sent = node.drain_outbound();

        assert_eq!(sent.len(), 2);
        for (out, to) in sent.iter().zip([addr(2), addr(3)]) {
            assert_eq!(out.destination, to);
            assert_eq!(out.command.code(), CommandCode::PublisherRemoved);
            assert_eq!(out.command.key_str(), Some("p1"));
            assert!(out.command.transaction_id() < 0);
            assert!(node.transactions().contains(out.command.transaction_id()));
        }
    }

    #[test]
    fn test_add_subscriber_unknown_publisher() {
        let mut node = CentralNode::default();
        assert_failure(
            node.handle(&request(CommandCode::AddSubscriber, 9, "zzz"), addr(2)),
            9,
            ErrorCode::PubDoesNotExist,
        );
        assert!(node.drain_outbound().is_empty());
    }

    #[test]
    fn test_first_subscriber_starts_publisher() {
        let mut node = CentralNode::default();
        node.handle(&request(CommandCode::AddPublisher, 1, "p1"), addr(1));

        let port = assert_success(
            node.handle(&request(CommandCode::AddSubscriber, 2, "p1"), addr(2)),
            2,
        );
        assert_eq!(port, 15002);

        let sent = node.drain_outbound();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, addr(1));
        assert_eq!(sent[0].command.code(), CommandCode::StartPublishing);
        assert_eq!(sent[0].command.sensor_type(), 4);

        node.handle(&request(CommandCode::AddSubscriber, 3, "p1"), addr(3));
        node.handle(&request(CommandCode::AddSubscriber, 4, "p1"), addr(2));
        assert!(node.drain_outbound().is_empty());
    }

    #[test]
    fn test_last_unsubscribe_stops_publisher() {
        let mut node = CentralNode::default();
        node.handle(&request(CommandCode::AddPublisher, 1, "p1"), addr(1));
        node.handle(&request(CommandCode::AddSubscriber, 2, "p1"), addr(2));
        node.handle(&request(CommandCode::AddSubscriber, 3, "p1"), addr(3));
        node.drain_outbound();

        assert_success(
            node.handle(&request(CommandCode::RemoveSubscriber, 4, "p1"), addr(2)),
            4,
        );
        assert!(node.drain_outbound().is_empty());

        assert_success(
            node.handle(&request(CommandCode::RemoveSubscriber, 5, "p1"), addr(3)),
            5,
        );
        let sent = node.drain_outbound();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, addr(1));
        assert_eq!(sent[0].command.code(), CommandCode::StopPublishing);
    }

    #[test]
    fn test_remove_subscriber_not_subscribed() {
        let mut node = CentralNode::default();
        node.handle(&request(CommandCode::AddPublisher, 1, "p1"), addr(1));
        assert_failure(
            node.handle(&request(CommandCode::RemoveSubscriber, 2, "p1"), addr(2)),
            2,
            ErrorCode::PubDoesNotExist,
        );
    }

    #[test]
    fn test_success_closes_transaction() {
        let mut node = CentralNode::default();
        node.handle(&request(CommandCode::AddPublisher, 1, "p1"), addr(1));
        node.handle(&request(CommandCode::AddSubscriber, 2, "p1"), addr(2));
        let tx = node.drain_outbound()[0].command.transaction_id();

        assert!(node.handle(&ack(tx), addr(1)).is_none());
        assert!(node.transactions().is_empty());
    }

    #[test]
    fn test_success_from_other_address_still_closes() {
        let mut node = CentralNode::default();
        node.handle(&request(CommandCode::AddPublisher, 1, "p1"), addr(1));
        node.handle(&request(CommandCode::AddSubscriber, 2, "p1"), addr(2));
        let tx = node.drain_outbound()[0].command.transaction_id();

        assert!(node.handle(&ack(tx), addr(9)).is_none());
        assert!(!node.transactions().contains(tx));
        assert_failure(node.handle(&ack(tx), addr(1)), tx, ErrorCode::InvalidCommand);
    }

    #[test]
    fn test_success_for_unknown_transaction() {
        let mut node = CentralNode::default();
        assert_failure(node.handle(&ack(-7), addr(1)), -7, ErrorCode::InvalidCommand);
    }

    #[test]
    fn test_failure_resends_without_spending_retries() {
        let mut node = CentralNode::default();
        node.handle(&request(CommandCode::AddPublisher, 1, "p1"), addr(1));
        node.handle(&request(CommandCode::AddSubscriber, 2, "p1"), addr(2));
        let original = node.drain_outbound().remove(0);
        let tx = original.command.transaction_id();

        let nack = Command::failure(tx, 0, ErrorCode::CrcCheckFailure).encode();
        assert!(node.handle(&nack, addr(1)).is_none());

        let sent = node.drain_outbound();
        assert_eq!(sent, vec![original]);
        assert_eq!(node.transactions().get(tx).unwrap().retry_count, 0);
    }

    #[test]
    fn test_failure_for_unknown_transaction_is_ignored() {
        let mut node = CentralNode::default();
        let nack = Command::failure(-3, 0, ErrorCode::CrcCheckFailure).encode();
        assert!(node.handle(&nack, addr(1)).is_none());
        assert!(node.drain_outbound().is_empty());
    }

    #[test]
    fn test_notification_codes_are_rejected() {
        let mut node = CentralNode::default();
        assert_failure(
            node.handle(&request(CommandCode::StartPublishing, 6, "p1"), addr(1)),
            6,
            ErrorCode::InvalidCommand,
        );
    }

    #[test]
    fn test_response_payload_shapes() {
        let mut node = CentralNode::default();
        let response = node
            .handle(&request(CommandCode::AddPublisher, 1, "p1"), addr(1))
            .unwrap();
        assert_eq!(response.payload(), &Payload::Unsigned(15002));
    }
}
