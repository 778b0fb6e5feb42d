// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Periodic maintenance: transaction retry/expiry and liveness eviction.

use super::dispatcher::CentralNode;
use smp_protocol::CommandCode;
use std::collections::HashSet;
use std::net::SocketAddr;
use tracing::{debug, info};

/// What one maintenance tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Transactions resent this tick
    pub retransmitted: Vec<i16>,

    /// Transactions dropped after exhausting their retries
    pub expired: Vec<i16>,

    /// Keys of publishers evicted for silence
    pub evicted_publishers: Vec<String>,

    /// (publisher key, subscriber address) pairs evicted for silence
    pub evicted_subscriptions: Vec<(String, SocketAddr)>,
}

impl MaintenanceReport {
    /// True when the tick changed nothing worth logging.
    pub fn is_idle(&self) -> bool {
        self.retransmitted.is_empty()
            && self.expired.is_empty()
            && self.evicted_publishers.is_empty()
            && self.evicted_subscriptions.is_empty()
    }
}

/// A notification decided during the sweep, sent once the sweep is done.
struct Notice {
    code: CommandCode,
    key: String,
    sensor_type: u32,
    destination: SocketAddr,
}

impl CentralNode {
    /// Run one maintenance tick.
    ///
    /// Retries run first, so notifications created by this tick's evictions
    /// are not resent until the next one.
    pub fn run_maintenance(&mut self) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        self.retry_transactions(&mut report);
        self.sweep_liveness(&mut report);

        if !report.is_idle() {
            debug!(
                "Maintenance: {} resent, {} expired, {} publishers and {} subscriptions evicted",
                report.retransmitted.len(),
                report.expired.len(),
                report.evicted_publishers.len(),
                report.evicted_subscriptions.len()
            );
        }
        report
    }

    fn retry_transactions(&mut self, report: &mut MaintenanceReport) {
        let max_retransmissions = self.settings.max_retransmissions;
        let mut resend = Vec::new();

        for tx in self.transactions.iter_mut() {
            if tx.retry_count < max_retransmissions {
                tx.record_retransmission();
                resend.push((tx.destination, tx.command.clone()));
                report.retransmitted.push(tx.id);
            } else {
                report.expired.push(tx.id);
            }
        }

        for id in &report.expired {
            if let Some(tx) = self.transactions.acknowledge(*id) {
                info!(
                    "Transaction {} to {} expired after {} retransmissions",
                    tx.command, tx.destination, tx.retry_count
                );
            }
        }
        for (destination, command) in resend {
            debug!("Retransmitting {} to {}", command, destination);
            self.resend(destination, command);
        }
    }

    /// Age every publisher and subscription by one tick and evict the silent ones.
    ///
    /// An address subscribed under several publishers is aged only under the
    /// first of them in key order. Its entries under later publishers keep
    /// their count until a keep-alive resets them all.
    fn sweep_liveness(&mut self, report: &mut MaintenanceReport) {
        let limit = self.settings.timeout_limit;
        let mut aged: HashSet<SocketAddr> = HashSet::new();
        let mut dead = Vec::new();
        let mut notices = Vec::new();

        for publisher in self.registry.publishers_mut() {
            if publisher.age() > limit {
                dead.push(publisher.key.clone());
                continue;
            }

            let had_subscribers = publisher.has_subscribers();
            let expired: Vec<SocketAddr> = publisher
                .subscribers_mut()
                .filter(|subscriber| aged.insert(subscriber.address))
                .filter_map(|subscriber| (subscriber.age() > limit).then_some(subscriber.address))
                .collect();

            for address in expired {
                publisher.drop_subscriber(&address);
                info!("Subscriber {} of {:?} timed out", address, publisher.key);
                report
                    .evicted_subscriptions
                    .push((publisher.key.clone(), address));
            }

            if had_subscribers && !publisher.has_subscribers() {
                notices.push(Notice {
                    code: CommandCode::StopPublishing,
                    key: publisher.key.clone(),
                    sensor_type: publisher.sensor_type,
                    destination: publisher.client_address,
                });
            }
        }

        for key in dead {
            let Some(publisher) = self.registry.evict_publisher(&key) else {
                continue;
            };
            info!(
                "Publisher {:?} at {} timed out, notifying {} subscribers",
                key,
                publisher.client_address,
                publisher.subscriber_count()
            );
            notices.extend(publisher.subscribers().map(|subscriber| Notice {
                code: CommandCode::PublisherRemoved,
                key: key.clone(),
                sensor_type: subscriber.sensor_type,
                destination: subscriber.address,
            }));
            report.evicted_publishers.push(key);
        }

        for notice in notices {
            self.notify(notice.code, &notice.key, notice.sensor_type, notice.destination);
        }
    }
}
