// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control-plane client used by publisher and subscriber peers.
//!
//! Requests are sent once and answered by a SUCCESS/FAILURE carrying the
//! same transaction ID. Broker-originated commands (START_PUBLISHING,
//! STOP_PUBLISHING, PUBLISHER_REMOVED) that arrive while a request is
//! outstanding are queued and handed out by [`CentralNodeClient::next_notification`].

use crate::command::{Command, CommandCode, DecodeError, ErrorCode, MAX_KEY_LEN};
use std::collections::VecDeque;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Well-known control port of the central node.
pub const CENTRAL_NODE_PORT: u16 = 15001;

/// Time to wait for a response before counting one timeout.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Number of response timeouts before a request is abandoned.
pub const RESPONSE_ATTEMPTS: u32 = 3;

const RECV_BUFFER_SIZE: usize = 1024;

/// Draw a client-side transaction ID.
///
/// Client IDs cover `0..=i16::MAX`; the central node only issues negative IDs.
pub fn next_transaction_id() -> i16 {
    fastrand::i16(0..=i16::MAX)
}

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no response to {code} (tx {transaction_id}) from the central node")]
    Timeout {
        code: CommandCode,
        transaction_id: i16,
    },

    #[error("central node rejected {code}: {error}")]
    Rejected { code: CommandCode, error: ErrorCode },

    #[error("publisher key must be 1..=32 bytes, got {0}")]
    InvalidKey(usize),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

/// UDP client for the central node's control endpoint.
pub struct CentralNodeClient {
    socket: UdpSocket,
    central_node: SocketAddr,
    sensor_type: u32,
    response_timeout: Duration,
    response_attempts: u32,
    notifications: VecDeque<Command>,
}

impl CentralNodeClient {
    /// Bind an ephemeral local port of the same address family as `central_node`.
    pub async fn connect(central_node: SocketAddr, sensor_type: u32) -> Result<Self, ClientError> {
        let local: SocketAddr = if central_node.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;

        Ok(Self {
            socket,
            central_node,
            sensor_type,
            response_timeout: RESPONSE_TIMEOUT,
            response_attempts: RESPONSE_ATTEMPTS,
            notifications: VecDeque::new(),
        })
    }

    /// Override the response timeout and the number of timeouts tolerated.
    pub fn with_response_timeout(mut self, timeout: Duration, attempts: u32) -> Self {
        self.response_timeout = timeout;
        self.response_attempts = attempts.max(1);
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn central_node(&self) -> SocketAddr {
        self.central_node
    }

    /// Register a publisher. Returns its broadcast port.
    pub async fn add_publisher(&mut self, key: &str) -> Result<u16, ClientError> {
        let value = self.request(CommandCode::AddPublisher, key).await?;
        to_port(value)
    }

    /// Remove a publisher this client owns.
    pub async fn remove_publisher(&mut self, key: &str) -> Result<u16, ClientError> {
        let value = self.request(CommandCode::RemovePublisher, key).await?;
        to_port(value)
    }

    /// Subscribe to a publisher. Returns the broadcast port to join.
    pub async fn add_subscriber(&mut self, key: &str) -> Result<u16, ClientError> {
        let value = self.request(CommandCode::AddSubscriber, key).await?;
        to_port(value)
    }

    /// Unsubscribe from a publisher.
    pub async fn remove_subscriber(&mut self, key: &str) -> Result<u16, ClientError> {
        let value = self.request(CommandCode::RemoveSubscriber, key).await?;
        to_port(value)
    }

    /// Heartbeat. The key only pads the packet past the minimum length.
    pub async fn keep_alive(&self, key: &str) -> Result<(), ClientError> {
        validate_key(key)?;
        let command = Command::with_key(CommandCode::KeepAlive, 0, self.sensor_type, key);
        self.send(&command).await
    }

    /// Acknowledge a broker-originated command.
    pub async fn acknowledge(&self, transaction_id: i16) -> Result<(), ClientError> {
        self.send(&Command::success(transaction_id, self.sensor_type, 0))
            .await
    }

    /// Answer a broker-originated command with a failure.
    pub async fn reject(&self, transaction_id: i16, error: ErrorCode) -> Result<(), ClientError> {
        self.send(&Command::failure(transaction_id, self.sensor_type, error))
            .await
    }

    /// Next broker-originated command, waiting at most `timeout`.
    ///
    /// Commands that fail the checksum are answered with CRC_CHECK_FAILURE so
    /// the broker retransmits them.
    pub async fn next_notification(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Command>, ClientError> {
        if let Some(command) = self.notifications.pop_front() {
            return Ok(Some(command));
        }

        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        self.recv_until(deadline, &mut buf).await
    }

    async fn request(&mut self, code: CommandCode, key: &str) -> Result<u32, ClientError> {
        validate_key(key)?;
        let transaction_id = next_transaction_id();
        let command = Command::with_key(code, transaction_id, self.sensor_type, key);
        self.send(&command).await?;
        debug!("Sent {}", command);

        let response = self.await_response(code, transaction_id).await?;
        match response.code() {
            CommandCode::Success => response
                .value()
                .ok_or_else(|| ClientError::UnexpectedResponse(response.to_string())),
            CommandCode::Failure => match response.error_code() {
                Some(error) => Err(ClientError::Rejected { code, error }),
                None => Err(ClientError::UnexpectedResponse(response.to_string())),
            },
            _ => Err(ClientError::UnexpectedResponse(response.to_string())),
        }
    }

    async fn await_response(
        &mut self,
        code: CommandCode,
        transaction_id: i16,
    ) -> Result<Command, ClientError> {
        let deadline = Instant::now() + self.response_timeout * self.response_attempts;
        let mut buf = [0u8; RECV_BUFFER_SIZE];

        loop {
            let received = self.recv_until(deadline, &mut buf).await?;
            let Some(command) = received else {
                break;
            };
            let is_ack = matches!(command.code(), CommandCode::Success | CommandCode::Failure);
            if is_ack && command.transaction_id() == transaction_id {
                return Ok(command);
            }
            if command.transaction_id() < 0 && !is_ack {
                self.queue_notification(command);
            } else {
                debug!("Ignoring stray {}", command);
            }
        }

        Err(ClientError::Timeout {
            code,
            transaction_id,
        })
    }

    /// Queue a broker notification unless a retransmission of it is already queued.
    fn queue_notification(&mut self, command: Command) {
        let transaction_id = command.transaction_id();
        if self
            .notifications
            .iter()
            .any(|queued| queued.transaction_id() == transaction_id)
        {
            debug!("Dropping duplicate {}", command);
            return;
        }
        self.notifications.push_back(command);
    }

    /// Receive one decodable command from the central node before `deadline`.
    async fn recv_until(
        &self,
        deadline: Instant,
        buf: &mut [u8],
    ) -> Result<Option<Command>, ClientError> {
        loop {
            let (len, from) =
                match tokio::time::timeout_at(deadline, self.socket.recv_from(buf)).await {
                    Err(_) => return Ok(None),
                    Ok(result) => result?,
                };

            if from != self.central_node {
                debug!("Ignoring packet from unknown sender {}", from);
                continue;
            }

            match Command::decode(&buf[..len]) {
                Ok(command) => return Ok(Some(command)),
                Err(DecodeError::Integrity { transaction_id, .. }) => {
                    warn!("Checksum mismatch on tx {}, requesting resend", transaction_id);
                    self.reject(transaction_id, ErrorCode::CrcCheckFailure)
                        .await?;
                }
                Err(e) => warn!("Discarding malformed packet: {}", e),
            }
        }
    }

    async fn send(&self, command: &Command) -> Result<(), ClientError> {
        self.socket
            .send_to(&command.encode(), self.central_node)
            .await?;
        Ok(())
    }
}

fn validate_key(key: &str) -> Result<(), ClientError> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(ClientError::InvalidKey(key.len()));
    }
    Ok(())
}

fn to_port(value: u32) -> Result<u16, ClientError> {
    u16::try_from(value)
        .map_err(|_| ClientError::UnexpectedResponse(format!("port {} out of range", value)))
}
