// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publisher and subscriber registry for the central node.
//!
//! Pure state: no I/O happens here. Every mutating operation validates
//! first and only then commits, so a failed call leaves the registry as it
//! was.

use smp_protocol::ErrorCode;
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::ops::Range;
use thiserror::Error;

/// Registry state errors. Each maps to the FAILURE code sent back to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("publisher key is empty or not valid UTF-8")]
    InvalidKey,

    #[error("publisher {0:?} already exists")]
    PublisherExists(String),

    #[error("publisher {0:?} does not exist")]
    PublisherNotFound(String),

    #[error("{address} is not subscribed to {key:?}")]
    NotSubscribed { key: String, address: SocketAddr },

    #[error("{requester} does not own publisher {key:?} (owner {owner})")]
    PermissionDenied {
        key: String,
        owner: SocketAddr,
        requester: SocketAddr,
    },

    #[error("broadcast port pool exhausted")]
    PortsExhausted,

    #[error("no outstanding transaction {0}")]
    UnknownTransaction(i16),
}

impl StateError {
    /// Wire error code reported to the peer.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidKey | Self::PortsExhausted | Self::UnknownTransaction(_) => {
                ErrorCode::InvalidCommand
            }
            Self::PublisherExists(_) => ErrorCode::PubAlreadyExists,
            Self::PublisherNotFound(_) | Self::NotSubscribed { .. } => ErrorCode::PubDoesNotExist,
            Self::PermissionDenied { .. } => ErrorCode::PermissionError,
        }
    }
}

/// A subscription held by one remote address on one publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    /// Remote address, also the subscription key
    pub address: SocketAddr,

    /// Sensor type announced in ADD_SUBSCRIBER
    pub sensor_type: u32,

    /// Maintenance ticks since the last keep-alive
    pub timeout_count: u32,
}

impl Subscriber {
    pub fn new(address: SocketAddr, sensor_type: u32) -> Self {
        Self {
            address,
            sensor_type,
            timeout_count: 0,
        }
    }

    /// Add one tick and return the new count.
    pub fn age(&mut self) -> u32 {
        self.timeout_count = self.timeout_count.saturating_add(1);
        self.timeout_count
    }

    pub fn touch(&mut self) {
        self.timeout_count = 0;
    }
}

/// A registered publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publisher {
    /// Unique publisher key
    pub key: String,

    /// Address that registered the publisher and owns it
    pub client_address: SocketAddr,

    /// Multicast port the publisher broadcasts its data on
    pub broadcast_port: u16,

    /// Sensor type announced in ADD_PUBLISHER
    pub sensor_type: u32,

    /// Maintenance ticks since the last keep-alive
    pub timeout_count: u32,

    subscribers: BTreeMap<SocketAddr, Subscriber>,
}

impl Publisher {
    pub fn new(
        key: impl Into<String>,
        client_address: SocketAddr,
        broadcast_port: u16,
        sensor_type: u32,
    ) -> Self {
        Self {
            key: key.into(),
            client_address,
            broadcast_port,
            sensor_type,
            timeout_count: 0,
            subscribers: BTreeMap::new(),
        }
    }

    /// Add one tick and return the new count.
    pub fn age(&mut self) -> u32 {
        self.timeout_count = self.timeout_count.saturating_add(1);
        self.timeout_count
    }

    pub fn touch(&mut self) {
        self.timeout_count = 0;
    }

    /// Subscribers in address order.
    pub fn subscribers(&self) -> impl Iterator<Item = &Subscriber> {
        self.subscribers.values()
    }

    pub(crate) fn subscribers_mut(&mut self) -> impl Iterator<Item = &mut Subscriber> {
        self.subscribers.values_mut()
    }

    pub fn subscriber(&self, address: &SocketAddr) -> Option<&Subscriber> {
        self.subscribers.get(address)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.is_empty()
    }

    pub(crate) fn drop_subscriber(&mut self, address: &SocketAddr) -> Option<Subscriber> {
        self.subscribers.remove(address)
    }
}

/// Outcome of a subscribe/unsubscribe that the dispatcher needs to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionChange {
    /// Broadcast port of the publisher
    pub broadcast_port: u16,

    /// Publisher's owning address
    pub publisher_address: SocketAddr,

    /// Publisher's sensor type
    pub publisher_sensor_type: u32,

    /// The subscriber set went from empty to non-empty, or the reverse
    pub notify_publisher: bool,
}

impl SubscriptionChange {
    fn of(publisher: &Publisher, notify_publisher: bool) -> Self {
        Self {
            broadcast_port: publisher.broadcast_port,
            publisher_address: publisher.client_address,
            publisher_sensor_type: publisher.sensor_type,
            notify_publisher,
        }
    }
}

/// FIFO free-list of broadcast ports.
///
/// Released ports go to the back, so the most recently freed port is the
/// last one handed out again.
#[derive(Debug, Clone)]
pub struct PortPool {
    range: Range<u16>,
    available: VecDeque<u16>,
}

impl PortPool {
    pub fn new(range: Range<u16>) -> Self {
        Self {
            available: range.clone().collect(),
            range,
        }
    }

    pub fn acquire(&mut self) -> Option<u16> {
        self.available.pop_front()
    }

    /// Return a port. Ports outside the range or already free are ignored.
    pub fn release(&mut self, port: u16) {
        if self.range.contains(&port) && !self.available.contains(&port) {
            self.available.push_back(port);
        }
    }

    pub fn available(&self) -> usize {
        self.available.len()
    }
}

/// Registry of all publishers and their subscribers.
#[derive(Debug)]
pub struct Registry {
    /// Publishers indexed by key, iterated in key order
    publishers: BTreeMap<String, Publisher>,

    ports: PortPool,
}

impl Registry {
    /// Create an empty registry handing out ports from `port_range`.
    pub fn new(port_range: Range<u16>) -> Self {
        Self {
            publishers: BTreeMap::new(),
            ports: PortPool::new(port_range),
        }
    }

    /// Register a new publisher owned by `owner`.
    pub fn add_publisher(
        &mut self,
        key: &str,
        owner: SocketAddr,
        sensor_type: u32,
    ) -> Result<&Publisher, StateError> {
        if key.is_empty() {
            return Err(StateError::InvalidKey);
        }
        if self.publishers.contains_key(key) {
            return Err(StateError::PublisherExists(key.to_string()));
        }
        let port = self.ports.acquire().ok_or(StateError::PortsExhausted)?;

        let publisher = Publisher::new(key, owner, port, sensor_type);
        Ok(self.publishers.entry(key.to_string()).or_insert(publisher))
    }

    /// Remove a publisher on behalf of `requester`, who must own it.
    pub fn remove_publisher(
        &mut self,
        key: &str,
        requester: SocketAddr,
    ) -> Result<Publisher, StateError> {
        let publisher = self
            .publishers
            .get(key)
            .ok_or_else(|| StateError::PublisherNotFound(key.to_string()))?;

        if publisher.client_address != requester {
            return Err(StateError::PermissionDenied {
                key: key.to_string(),
                owner: publisher.client_address,
                requester,
            });
        }

        self.evict_publisher(key)
            .ok_or_else(|| StateError::PublisherNotFound(key.to_string()))
    }

    /// Remove a publisher unconditionally, returning its port to the pool.
    pub fn evict_publisher(&mut self, key: &str) -> Option<Publisher> {
        let publisher = self.publishers.remove(key)?;
        self.ports.release(publisher.broadcast_port);
        Some(publisher)
    }

    /// Subscribe `address` to publisher `key`.
    ///
    /// Re-subscribing refreshes the existing entry.
    pub fn add_subscriber(
        &mut self,
        key: &str,
        address: SocketAddr,
        sensor_type: u32,
    ) -> Result<SubscriptionChange, StateError> {
        let publisher = self
            .publishers
            .get_mut(key)
            .ok_or_else(|| StateError::PublisherNotFound(key.to_string()))?;

        let first = !publisher.has_subscribers();
        publisher
            .subscribers
            .insert(address, Subscriber::new(address, sensor_type));

        Ok(SubscriptionChange::of(publisher, first))
    }

    /// Unsubscribe `address` from publisher `key`.
    pub fn remove_subscriber(
        &mut self,
        key: &str,
        address: SocketAddr,
    ) -> Result<SubscriptionChange, StateError> {
        let publisher = self
            .publishers
            .get_mut(key)
            .ok_or_else(|| StateError::PublisherNotFound(key.to_string()))?;

        if publisher.drop_subscriber(&address).is_none() {
            return Err(StateError::NotSubscribed {
                key: key.to_string(),
                address,
            });
        }

        let last = !publisher.has_subscribers();
        Ok(SubscriptionChange::of(publisher, last))
    }

    /// Reset the timeout of every entry recorded under `address`.
    ///
    /// Returns the number of entries refreshed.
    pub fn touch(&mut self, address: SocketAddr) -> usize {
        let mut refreshed = 0;
        for publisher in self.publishers.values_mut() {
            if publisher.client_address == address {
                publisher.touch();
                refreshed += 1;
            }
            if let Some(subscriber) = publisher.subscribers.get_mut(&address) {
                subscriber.touch();
                refreshed += 1;
            }
        }
        refreshed
    }

    pub fn publisher(&self, key: &str) -> Option<&Publisher> {
        self.publishers.get(key)
    }

    /// All publishers in key order.
    pub fn publishers(&self) -> impl Iterator<Item = &Publisher> {
        self.publishers.values()
    }

    pub(crate) fn publishers_mut(&mut self) -> impl Iterator<Item = &mut Publisher> {
        self.publishers.values_mut()
    }

    pub fn publisher_count(&self) -> usize {
        self.publishers.len()
    }

    /// Total subscriptions across all publishers.
    pub fn subscription_count(&self) -> usize {
        self.publishers.values().map(Publisher::subscriber_count).sum()
    }

    pub fn available_ports(&self) -> usize {
        self.ports.available()
    }
}
