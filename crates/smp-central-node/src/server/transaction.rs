// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Outstanding broker-originated commands awaiting acknowledgement.
//!
//! The central node issues negative transaction IDs only, counting down from
//! -1 to -32767 and wrapping back to -1. Client-originated IDs are
//! non-negative, so the two namespaces never collide.

use smp_protocol::{Command, CommandCode};
use std::collections::BTreeMap;
use std::net::SocketAddr;

/// Most negative ID the central node hands out.
pub const MIN_TRANSACTION_ID: i16 = -i16::MAX;

/// A command sent by the central node that has not been acknowledged yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub id: i16,

    /// Exact command to retransmit
    pub command: Command,

    pub destination: SocketAddr,

    /// Retransmissions so far, not counting the first send
    pub retry_count: u32,
}

impl Transaction {
    pub fn record_retransmission(&mut self) {
        self.retry_count = self.retry_count.saturating_add(1);
    }
}

/// Table of outstanding transactions, keyed by ID.
#[derive(Debug)]
pub struct TransactionTable {
    pending: BTreeMap<i16, Transaction>,
    last_id: i16,
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionTable {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            last_id: 0,
        }
    }

    /// Next free negative ID.
    ///
    /// IDs still pending are skipped. With every ID in flight the entry
    /// under the next ID is overwritten.
    fn allocate_id(&mut self) -> i16 {
        for _ in 0..i16::MAX {
            self.last_id = if self.last_id <= MIN_TRANSACTION_ID {
                -1
            } else {
                self.last_id - 1
            };
            if !self.pending.contains_key(&self.last_id) {
                return self.last_id;
            }
        }
        self.last_id
    }

    /// Build a keyed command under a fresh ID and record it as outstanding.
    pub fn open(
        &mut self,
        code: CommandCode,
        sensor_type: u32,
        key: &str,
        destination: SocketAddr,
    ) -> Command {
        let id = self.allocate_id();
        let command = Command::with_key(code, id, sensor_type, key);
        self.pending.insert(
            id,
            Transaction {
                id,
                command: command.clone(),
                destination,
                retry_count: 0,
            },
        );
        command
    }

    /// Close a transaction. Returns it if it was outstanding.
    pub fn acknowledge(&mut self, id: i16) -> Option<Transaction> {
        self.pending.remove(&id)
    }

    pub fn get(&self, id: i16) -> Option<&Transaction> {
        self.pending.get(&id)
    }

    pub fn contains(&self, id: i16) -> bool {
        self.pending.contains_key(&id)
    }

    /// Outstanding transactions in ID order.
    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.pending.values()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Transaction> {
        self.pending.values_mut()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
