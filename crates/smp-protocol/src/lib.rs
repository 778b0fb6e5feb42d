// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SMP sensor mesh wire protocol.
//!
//! Shared by the central node and its peers:
//! - [`checksum`]: CRC-32 integrity trailer
//! - [`command`]: fixed binary control PDU (KEEP_ALIVE, ADD_PUBLISHER, ...)
//! - [`frame`]: timestamped bulk data frames sent over multicast
//! - [`client`]: async control-plane client for publisher/subscriber peers
//!
//! # Example
//!
//! ```
//! use smp_protocol::{Command, CommandCode};
//!
//! let cmd = Command::with_key(CommandCode::AddPublisher, 12, 0, "thermo-1");
//! let bytes = cmd.encode();
//! assert_eq!(Command::decode(&bytes).unwrap(), cmd);
//! ```

pub mod checksum;
pub mod client;
pub mod command;
pub mod frame;

pub use checksum::checksum;
pub use client::{next_transaction_id, CentralNodeClient, ClientError, CENTRAL_NODE_PORT};
pub use command::{
    peek_transaction_id, Command, CommandCode, DecodeError, ErrorCode, FormatError, Payload,
    HEADER_LEN, MAX_KEY_LEN, MAX_PACKET_LEN, MIN_PACKET_LEN,
};
pub use frame::{DataFrame, FrameError, MULTICAST_GROUP};
