// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Control command PDU and its binary codec.
//!
//! Wire format (big-endian):
//! ```text
//! +----------+-----------+--------------+----------------+-----------+--------------+
//! | Code (1) | TxId (2)  | Reserved (1) | SensorType (4) | Payload   | Checksum (4) |
//! +----------+-----------+--------------+----------------+-----------+--------------+
//! ```
//!
//! SUCCESS carries a `u32` payload, FAILURE an `i32` error code. Every other
//! code carries an opaque byte string filling the rest of the datagram
//! (`len - 12` bytes). The checksum covers every byte before it.

use crate::checksum::checksum;
use byteorder::{BigEndian, ByteOrder};
use std::fmt;
use thiserror::Error;

/// Size of all fixed-width fields (everything except a variable payload).
pub const HEADER_LEN: usize = 12;

/// Smallest datagram the broker accepts.
pub const MIN_PACKET_LEN: usize = 13;

/// Largest datagram the broker accepts.
pub const MAX_PACKET_LEN: usize = 44;

/// Longest publisher key that fits in a [`MAX_PACKET_LEN`] datagram.
pub const MAX_KEY_LEN: usize = MAX_PACKET_LEN - HEADER_LEN;

const PAYLOAD_OFFSET: usize = 8;
const INTEGER_PAYLOAD_LEN: usize = 4;
const CHECKSUM_LEN: usize = 4;

/// Command codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum CommandCode {
    KeepAlive = 0,
    AddPublisher = 1,
    RemovePublisher = 2,
    AddSubscriber = 3,
    RemoveSubscriber = 4,
    Success = 5,
    Failure = 6,
    PublisherRemoved = 7,
    StartPublishing = 8,
    StopPublishing = 9,
}

impl CommandCode {
    /// Protocol name of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeepAlive => "KEEP_ALIVE",
            Self::AddPublisher => "ADD_PUBLISHER",
            Self::RemovePublisher => "REMOVE_PUBLISHER",
            Self::AddSubscriber => "ADD_SUBSCRIBER",
            Self::RemoveSubscriber => "REMOVE_SUBSCRIBER",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::PublisherRemoved => "PUBLISHER_REMOVED",
            Self::StartPublishing => "START_PUBLISHING",
            Self::StopPublishing => "STOP_PUBLISHING",
        }
    }

    /// Whether the payload is a fixed 4-byte integer rather than a byte string.
    pub fn has_integer_payload(self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

impl TryFrom<u8> for CommandCode {
    type Error = FormatError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::KeepAlive,
            1 => Self::AddPublisher,
            2 => Self::RemovePublisher,
            3 => Self::AddSubscriber,
            4 => Self::RemoveSubscriber,
            5 => Self::Success,
            6 => Self::Failure,
            7 => Self::PublisherRemoved,
            8 => Self::StartPublishing,
            9 => Self::StopPublishing,
            other => return Err(FormatError::UnknownCode(other)),
        })
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes carried in FAILURE payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    InvalidCommand = 1,
    CrcCheckFailure = 2,
    PubDoesNotExist = 3,
    PubAlreadyExists = 4,
    PermissionError = 5,
}

impl ErrorCode {
    /// Protocol name of the error code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidCommand => "INVALID_COMMAND",
            Self::CrcCheckFailure => "CRC_CHECK_FAILURE",
            Self::PubDoesNotExist => "PUB_DOES_NOT_EXIST",
            Self::PubAlreadyExists => "PUB_ALREADY_EXISTS",
            Self::PermissionError => "PERMISSION_ERROR",
        }
    }
}

impl TryFrom<i32> for ErrorCode {
    /// The unrecognised raw value.
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::InvalidCommand,
            2 => Self::CrcCheckFailure,
            3 => Self::PubDoesNotExist,
            4 => Self::PubAlreadyExists,
            5 => Self::PermissionError,
            other => return Err(other),
        })
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command payload. The variant is fixed by the command code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Opaque byte string (publisher key for every non-acknowledgement code).
    Bytes(Vec<u8>),
    /// SUCCESS value (usually a broadcast port).
    Unsigned(u32),
    /// FAILURE error code.
    Signed(i32),
}

impl Payload {
    fn wire_len(&self) -> usize {
        match self {
            Self::Bytes(bytes) => bytes.len(),
            Self::Unsigned(_) | Self::Signed(_) => INTEGER_PAYLOAD_LEN,
        }
    }
}

/// Malformed packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("packet of {len} bytes is shorter than the 12-byte command header")]
    TooShort { len: usize },

    #[error("unknown command code {0}")]
    UnknownCode(u8),

    #[error("{code} expects a {expected}-byte payload, got {actual}")]
    PayloadLength {
        code: CommandCode,
        expected: usize,
        actual: usize,
    },
}

/// Failure to decode a received packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed command: {0}")]
    Format(#[from] FormatError),

    #[error(
        "checksum mismatch on transaction {transaction_id}: received {received:#010x}, computed {computed:#010x}"
    )]
    Integrity {
        transaction_id: i16,
        received: u32,
        computed: u32,
    },
}

/// A single control command PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    code: CommandCode,
    transaction_id: i16,
    sensor_type: u32,
    payload: Payload,
}

impl Command {
    /// Build a command whose payload is a publisher key.
    ///
    /// Meant for every code except SUCCESS and FAILURE, which have their own
    /// constructors.
    pub fn with_key(
        code: CommandCode,
        transaction_id: i16,
        sensor_type: u32,
        key: impl Into<Vec<u8>>,
    ) -> Self {
        debug_assert!(!code.has_integer_payload(), "{} takes an integer payload", code);
        Self {
            code,
            transaction_id,
            sensor_type,
            payload: Payload::Bytes(key.into()),
        }
    }

    /// Build a SUCCESS acknowledgement.
    pub fn success(transaction_id: i16, sensor_type: u32, value: u32) -> Self {
        Self {
            code: CommandCode::Success,
            transaction_id,
            sensor_type,
            payload: Payload::Unsigned(value),
        }
    }

    /// Build a FAILURE response.
    pub fn failure(transaction_id: i16, sensor_type: u32, error: ErrorCode) -> Self {
        Self {
            code: CommandCode::Failure,
            transaction_id,
            sensor_type,
            payload: Payload::Signed(error as i32),
        }
    }

    pub fn code(&self) -> CommandCode {
        self.code
    }

    pub fn transaction_id(&self) -> i16 {
        self.transaction_id
    }

    pub fn sensor_type(&self) -> u32 {
        self.sensor_type
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Raw byte-string payload, if this code carries one.
    pub fn key(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Byte-string payload as UTF-8. `None` for integer payloads and invalid UTF-8.
    pub fn key_str(&self) -> Option<&str> {
        self.key().and_then(|bytes| std::str::from_utf8(bytes).ok())
    }

    /// SUCCESS value.
    pub fn value(&self) -> Option<u32> {
        match self.payload {
            Payload::Unsigned(value) => Some(value),
            _ => None,
        }
    }

    /// FAILURE error code, if it is one this protocol defines.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self.payload {
            Payload::Signed(raw) => ErrorCode::try_from(raw).ok(),
            _ => None,
        }
    }

    /// Total serialized length.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.wire_len()
    }

    /// Serialize, filling in the checksum trailer.
    pub fn encode(&self) -> Vec<u8> {
        let len = self.wire_len();
        let mut buf = vec![0u8; len];

        buf[0] = self.code as u8;
        BigEndian::write_i16(&mut buf[1..3], self.transaction_id);
        // buf[3] is reserved and stays zero
        BigEndian::write_u32(&mut buf[4..PAYLOAD_OFFSET], self.sensor_type);

        let payload_end = len - CHECKSUM_LEN;
        match &self.payload {
            Payload::Bytes(bytes) => buf[PAYLOAD_OFFSET..payload_end].copy_from_slice(bytes),
            Payload::Unsigned(value) => {
                BigEndian::write_u32(&mut buf[PAYLOAD_OFFSET..payload_end], *value)
            }
            Payload::Signed(value) => {
                BigEndian::write_i32(&mut buf[PAYLOAD_OFFSET..payload_end], *value)
            }
        }

        let crc = checksum(&buf[..payload_end]);
        BigEndian::write_u32(&mut buf[payload_end..], crc);
        buf
    }

    /// Parse a received packet and verify its checksum.
    pub fn decode(packet: &[u8]) -> Result<Self, DecodeError> {
        if packet.len() < HEADER_LEN {
            return Err(FormatError::TooShort { len: packet.len() }.into());
        }

        let code = CommandCode::try_from(packet[0])?;
        let payload_len = packet.len() - HEADER_LEN;
        if code.has_integer_payload() && payload_len != INTEGER_PAYLOAD_LEN {
            return Err(FormatError::PayloadLength {
                code,
                expected: INTEGER_PAYLOAD_LEN,
                actual: payload_len,
            }
            .into());
        }

        let transaction_id = BigEndian::read_i16(&packet[1..3]);
        let sensor_type = BigEndian::read_u32(&packet[4..PAYLOAD_OFFSET]);
        let payload_end = packet.len() - CHECKSUM_LEN;
        let raw_payload = &packet[PAYLOAD_OFFSET..payload_end];
        let payload = match code {
            CommandCode::Success => Payload::Unsigned(BigEndian::read_u32(raw_payload)),
            CommandCode::Failure => Payload::Signed(BigEndian::read_i32(raw_payload)),
            _ => Payload::Bytes(raw_payload.to_vec()),
        };

        let received = BigEndian::read_u32(&packet[payload_end..]);
        let computed = checksum(&packet[..payload_end]);
        if received != computed {
            return Err(DecodeError::Integrity {
                transaction_id,
                received,
                computed,
            });
        }

        Ok(Self {
            code,
            transaction_id,
            sensor_type,
            payload,
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tx={} sensor={} payload=",
            self.code, self.transaction_id, self.sensor_type
        )?;
        match &self.payload {
            Payload::Bytes(bytes) => write!(f, "{:?}", String::from_utf8_lossy(bytes)),
            Payload::Unsigned(value) => write!(f, "{}", value),
            Payload::Signed(raw) => match ErrorCode::try_from(*raw) {
                Ok(code) => write!(f, "{}", code),
                Err(raw) => write!(f, "{}", raw),
            },
        }
    }
}

/// Read the transaction ID of a packet without validating anything else.
///
/// Returns `None` when the packet is too short to hold one.
pub fn peek_transaction_id(packet: &[u8]) -> Option<i16> {
    packet.get(1..3).map(BigEndian::read_i16)
}
