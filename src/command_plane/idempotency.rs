//! Command idempotency cache
//!
//! Bounded, time-limited map from command id to outcome. A reconnecting
//! client resends every command whose result it has not seen; the cache
//! makes the resend observe the original outcome instead of executing the
//! action a second time.
//!
//! An id is claimed before execution starts, so a duplicate that arrives
//! while the first execution is still running waits on the same result
//! rather than racing it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use super::protocol::CommandOutcome;

pub const DEFAULT_CAPACITY: usize = 200;
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

enum Slot {
    Processing(watch::Receiver<Option<CommandOutcome>>),
    Done(CommandOutcome),
}

struct Entry {
    slot: Slot,
    inserted: Instant,
}

/// Result of claiming a command id
pub enum Claim {
    /// Caller owns execution and must call `IdempotencyCache::complete`
    Execute(Completion),
    /// Another caller is executing the same id
    InFlight(watch::Receiver<Option<CommandOutcome>>),
    /// Already executed within the TTL
    Cached(CommandOutcome),
}

/// Execution ticket for a claimed id
pub struct Completion {
    id: String,
    tx: watch::Sender<Option<CommandOutcome>>,
}

impl Completion {
    pub fn id(&self) -> &str {
        &self.id
    }
}

pub struct IdempotencyCache {
    capacity: usize,
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl IdempotencyCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Claim `id` for execution, or observe its existing execution.
    pub fn claim(&self, id: &str) -> Claim {
        let now = Instant::now();
        let mut entries = self.lock_entries();
        self.purge_expired(&mut entries, now);

        if let Some(entry) = entries.get(id) {
            match &entry.slot {
                Slot::Done(outcome) => return Claim::Cached(outcome.clone()),
                Slot::Processing(rx) => return Claim::InFlight(rx.clone()),
            }
        }

        if entries.len() >= self.capacity {
            self.evict_oldest(&mut entries);
        }

        let (tx, rx) = watch::channel(None);
        entries.insert(
            id.to_string(),
            Entry {
                slot: Slot::Processing(rx),
                inserted: now,
            },
        );
        Claim::Execute(Completion {
            id: id.to_string(),
            tx,
        })
    }

    /// Record the outcome of a claimed id and wake any waiters.
    pub fn complete(&self, completion: Completion, outcome: CommandOutcome) {
        {
            let mut entries = self.lock_entries();
            if let Some(entry) = entries.get_mut(&completion.id) {
                entry.slot = Slot::Done(outcome.clone());
            }
        }
        let _ = completion.tx.send(Some(outcome));
    }

    /// Wait for an in-flight execution to finish.
    pub async fn wait(mut rx: watch::Receiver<Option<CommandOutcome>>) -> CommandOutcome {
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                if let Some(outcome) = rx.borrow().clone() {
                    return outcome;
                }
                return CommandOutcome::failed(
                    "internal_error",
                    "command execution ended without a result",
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn purge_expired(&self, entries: &mut HashMap<String, Entry>, now: Instant) {
        entries.retain(|_, entry| match entry.slot {
            Slot::Processing(_) => true,
            Slot::Done(_) => now.duration_since(entry.inserted) < self.ttl,
        });
    }

    /// Drop the oldest completed entry, or the oldest entry if none completed
    fn evict_oldest(&self, entries: &mut HashMap<String, Entry>) {
        let victim = entries
            .iter()
            .filter(|(_, e)| matches!(e.slot, Slot::Done(_)))
            .min_by_key(|(_, e)| e.inserted)
            .or_else(|| entries.iter().min_by_key(|(_, e)| e.inserted))
            .map(|(id, _)| id.clone());
        if let Some(id) = victim {
            entries.remove(&id);
        }
    }
}
