// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bulk data frames multicast by publishers on their broadcast port.
//!
//! ```text
//! +-------------------------+------------------+
//! | Timestamp ms (8B BE)    | Opaque payload   |
//! +-------------------------+------------------+
//! ```
//!
//! The central node never inspects frames; only peers use this module.

use byteorder::{BigEndian, ByteOrder};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::UdpSocket;

/// Multicast group every publisher sends its frames to.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 3, 29, 71);

/// Size of the timestamp prefix.
pub const TIMESTAMP_LEN: usize = 8;

/// Largest payload that fits in one UDP datagram after the timestamp.
pub const MAX_FRAME_PAYLOAD: usize = 65_507 - TIMESTAMP_LEN;

/// Frame errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame of {0} bytes has no room for the 8-byte timestamp")]
    TooShort(usize),

    #[error("payload of {0} bytes exceeds a single datagram")]
    TooLarge(usize),
}

/// One timestamped data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub timestamp_ms: u64,
    pub payload: Vec<u8>,
}

impl DataFrame {
    /// Stamp `payload` with the current wall-clock time.
    pub fn now(payload: impl Into<Vec<u8>>) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            timestamp_ms,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(FrameError::TooLarge(self.payload.len()));
        }
        let mut buf = vec![0u8; TIMESTAMP_LEN + self.payload.len()];
        BigEndian::write_u64(&mut buf[..TIMESTAMP_LEN], self.timestamp_ms);
        buf[TIMESTAMP_LEN..].copy_from_slice(&self.payload);
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < TIMESTAMP_LEN {
            return Err(FrameError::TooShort(bytes.len()));
        }
        Ok(Self {
            timestamp_ms: BigEndian::read_u64(&bytes[..TIMESTAMP_LEN]),
            payload: bytes[TIMESTAMP_LEN..].to_vec(),
        })
    }
}

/// Multicast destination for a publisher's broadcast port.
pub fn broadcast_destination(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(MULTICAST_GROUP, port))
}

/// Socket a publisher sends frames from. Frames stay on the local segment.
pub async fn publisher_socket() -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_multicast_ttl_v4(1)?;
    Ok(socket)
}

/// Socket a subscriber receives frames on, joined to [`MULTICAST_GROUP`].
pub async fn subscriber_socket(port: u16) -> std::io::Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await?;
    socket.join_multicast_v4(MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED)?;
    Ok(socket)
}
