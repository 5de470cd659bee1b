use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use time::OffsetDateTime;

use keygate_channel::FailureKind;
use keygate_store::{KeyRecord, KeyStatus};

mod manager;
mod state_sink;

pub use manager::{KeysByGroup, PoolManager};
pub use state_sink::{KeyStateConfig, KeyStateEvent, KeyStateSink, KeyStateWorker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    NoActiveKeys,
}

#[derive(Debug, Clone)]
pub struct AcquiredKey {
    pub id: i64,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct PoolKey {
    pub id: i64,
    pub value: String,
}

/// Immutable active/inactive partition, both slices ordered by key id.
#[derive(Debug)]
pub struct PoolSnapshot {
    pub active: Arc<[PoolKey]>,
    pub inactive: Arc<[PoolKey]>,
}

impl PoolSnapshot {
    fn empty() -> Self {
        Self {
            active: Arc::from(Vec::new()),
            inactive: Arc::from(Vec::new()),
        }
    }
}

struct KeyEntry {
    value: String,
    status: KeyStatus,
    failure_count: i64,
}

/// One group's rotation state.
///
/// Writers serialize on the state mutex and replace the snapshot wholesale;
/// readers never lock. The round-robin cursor is independent and may briefly
/// index across a replaced snapshot, which the modulo keeps valid.
pub struct KeyPool {
    group_id: i64,
    snapshot: ArcSwap<PoolSnapshot>,
    cursor: AtomicU64,
    state: Mutex<BTreeMap<i64, KeyEntry>>,
    sink: KeyStateSink,
}

impl KeyPool {
    pub fn new(group_id: i64, sink: KeyStateSink) -> Self {
        Self {
            group_id,
            snapshot: ArcSwap::from_pointee(PoolSnapshot::empty()),
            cursor: AtomicU64::new(0),
            state: Mutex::new(BTreeMap::new()),
            sink,
        }
    }

    pub fn group_id(&self) -> i64 {
        self.group_id
    }

    /// Replaces the pool contents from a source-of-truth reload.
    pub fn rebuild(&self, records: &[KeyRecord]) {
        let mut state = self.state.lock().expect("pool state lock");
        state.clear();
        for record in records {
            state.insert(
                record.id,
                KeyEntry {
                    value: record.value.clone(),
                    status: record.status,
                    failure_count: record.failure_count,
                },
            );
        }
        self.publish_locked(&state);
    }

    /// Round-robin over the active partition.
    pub fn acquire(&self) -> Result<AcquiredKey, AcquireError> {
        let snapshot = self.snapshot.load();
        if snapshot.active.is_empty() {
            return Err(AcquireError::NoActiveKeys);
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) as usize % snapshot.active.len();
        let key = &snapshot.active[index];
        Ok(AcquiredKey {
            id: key.id,
            value: key.value.clone(),
        })
    }

    pub fn report_success(&self, key_id: i64) {
        {
            let mut state = self.state.lock().expect("pool state lock");
            if let Some(entry) = state.get_mut(&key_id) {
                entry.failure_count = 0;
            }
        }
        self.sink.touch(key_id, OffsetDateTime::now_utc());
    }

    /// Counts a failed attempt; returns true when the key was demoted.
    ///
    /// A credential failure carries full threshold weight, so a single
    /// occurrence demotes whenever demotion is enabled. Threshold 0 disables
    /// demotion entirely.
    pub fn report_failure(&self, key_id: i64, kind: FailureKind, threshold: u32) -> bool {
        if kind == FailureKind::Ignorable {
            return false;
        }
        let mut state = self.state.lock().expect("pool state lock");
        let Some(entry) = state.get_mut(&key_id) else {
            return false;
        };
        if entry.status == KeyStatus::Inactive {
            return false;
        }

        entry.failure_count = match kind {
            FailureKind::Retriable => entry.failure_count.saturating_add(1),
            FailureKind::CredentialFailure => entry
                .failure_count
                .saturating_add(i64::from(threshold.max(1))),
            FailureKind::Ignorable => entry.failure_count,
        };
        let failure_count = entry.failure_count;

        if threshold > 0 && failure_count >= i64::from(threshold) {
            entry.status = KeyStatus::Inactive;
            self.publish_locked(&state);
            self.sink.status_change(
                key_id,
                self.group_id,
                KeyStatus::Inactive,
                failure_count,
                None,
            );
            true
        } else {
            self.sink.failure(key_id, failure_count);
            false
        }
    }

    /// Moves a key back to the active partition; returns false when the key
    /// is unknown or already active.
    pub fn promote(&self, key_id: i64, validated_at: OffsetDateTime) -> bool {
        let mut state = self.state.lock().expect("pool state lock");
        let Some(entry) = state.get_mut(&key_id) else {
            return false;
        };
        if entry.status == KeyStatus::Active {
            return false;
        }
        entry.status = KeyStatus::Active;
        entry.failure_count = 0;
        self.publish_locked(&state);
        self.sink
            .status_change(key_id, self.group_id, KeyStatus::Active, 0, Some(validated_at));
        true
    }

    pub fn snapshot(&self) -> Arc<PoolSnapshot> {
        self.snapshot.load_full()
    }

    fn publish_locked(&self, state: &BTreeMap<i64, KeyEntry>) {
        let mut active = Vec::new();
        let mut inactive = Vec::new();
        for (id, entry) in state {
            let key = PoolKey {
                id: *id,
                value: entry.value.clone(),
            };
            match entry.status {
                KeyStatus::Active => active.push(key),
                KeyStatus::Inactive => inactive.push(key),
            }
        }
        self.snapshot.store(Arc::new(PoolSnapshot {
            active: Arc::from(active),
            inactive: Arc::from(inactive),
        }));
    }
}
