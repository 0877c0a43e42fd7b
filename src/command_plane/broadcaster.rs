//! Periodic channel broadcasts
//!
//! One ticker per channel, each at its own cadence, publishing into a shared
//! `tokio::sync::broadcast` bus. Connections filter the bus by their own
//! subscription set. Sequence numbers are per channel and strictly
//! increasing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::executor::CommandExecutor;
use super::protocol::Channel;
use crate::config::CommandPlaneConfig;

const BUS_CAPACITY: usize = 64;

/// One published frame
#[derive(Debug, Clone, PartialEq)]
pub struct Broadcast {
    pub channel: Channel,
    pub seq: u64,
    pub data: Value,
}

/// Tick interval per channel
#[derive(Debug, Clone, Copy)]
pub struct BroadcastIntervals {
    pub status: Duration,
    pub metrics: Duration,
    pub health: Duration,
}

impl Default for BroadcastIntervals {
    fn default() -> Self {
        Self {
            status: Duration::from_millis(1000),
            metrics: Duration::from_millis(3000),
            health: Duration::from_millis(5000),
        }
    }
}

impl BroadcastIntervals {
    pub fn from_config(config: &CommandPlaneConfig) -> Self {
        Self {
            status: Duration::from_millis(config.status_interval_ms),
            metrics: Duration::from_millis(config.metrics_interval_ms),
            health: Duration::from_millis(config.health_interval_ms),
        }
    }

    pub fn of(&self, channel: Channel) -> Duration {
        match channel {
            Channel::Status => self.status,
            Channel::Metrics => self.metrics,
            Channel::Health => self.health,
        }
    }
}

#[derive(Debug)]
pub struct Broadcaster {
    tx: broadcast::Sender<Broadcast>,
    seqs: [AtomicU64; 3],
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            seqs: [AtomicU64::new(0), AtomicU64::new(0), AtomicU64::new(0)],
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Broadcast> {
        self.tx.subscribe()
    }

    /// Publish one frame; returns its sequence number.
    ///
    /// Publishing with no connected receivers is not an error.
    pub fn publish(&self, channel: Channel, data: Value) -> u64 {
        let seq = self.seqs[channel.index()].fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.tx.send(Broadcast { channel, seq, data });
        seq
    }

    /// Spawn one ticker per channel.
    pub fn spawn(
        self: &Arc<Self>,
        executor: Arc<CommandExecutor>,
        intervals: BroadcastIntervals,
    ) -> Vec<JoinHandle<()>> {
        Channel::ALL
            .iter()
            .map(|&channel| {
                let broadcaster = Arc::clone(self);
                let executor = Arc::clone(&executor);
                let period = intervals.of(channel);
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        if broadcaster.tx.receiver_count() == 0 {
                            continue;
                        }
                        let data = executor.channel_payload(channel).await;
                        broadcaster.publish(channel, data);
                    }
                })
            })
            .collect()
    }
}
