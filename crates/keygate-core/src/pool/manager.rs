use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;

use keygate_store::KeyRecord;

use crate::groups::GroupMap;

use super::{KeyPool, KeyStateSink};

/// Key rows partitioned by owning group, as loaded from the store.
#[derive(Debug, Clone, Default)]
pub struct KeysByGroup {
    by_group: HashMap<i64, Vec<KeyRecord>>,
}

impl KeysByGroup {
    pub fn from_records(records: Vec<KeyRecord>) -> Self {
        let mut by_group: HashMap<i64, Vec<KeyRecord>> = HashMap::new();
        for record in records {
            by_group.entry(record.group_id).or_default().push(record);
        }
        for records in by_group.values_mut() {
            records.sort_by_key(|record| record.id);
        }
        Self { by_group }
    }

    pub fn get(&self, group_id: i64) -> &[KeyRecord] {
        self.by_group
            .get(&group_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Process-level owner of every [`KeyPool`], keyed by group id.
///
/// Pools are reconciled from whichever snapshot reloads last; a deleted
/// group loses its pool entry here and nothing else holds one.
pub struct PoolManager {
    pools: ArcSwap<HashMap<i64, Arc<KeyPool>>>,
    latest: Mutex<ReconcileState>,
    sink: KeyStateSink,
}

#[derive(Default)]
struct ReconcileState {
    group_ids: Vec<i64>,
    keys: Arc<KeysByGroup>,
}

impl PoolManager {
    pub fn new(sink: KeyStateSink) -> Self {
        Self {
            pools: ArcSwap::from_pointee(HashMap::new()),
            latest: Mutex::new(ReconcileState::default()),
            sink,
        }
    }

    pub fn pool(&self, group_id: i64) -> Option<Arc<KeyPool>> {
        self.pools.load().get(&group_id).cloned()
    }

    /// Applies a fresh group snapshot: drops pools for vanished groups and
    /// seeds pools for new ones from the last seen key rows.
    pub fn apply_groups(&self, groups: &GroupMap) {
        let mut latest = self.latest.lock().expect("pool manager lock");
        latest.group_ids = groups.ids();

        let mut pools = self.pools.load().as_ref().clone();
        pools.retain(|group_id, _| latest.group_ids.contains(group_id));
        for group_id in &latest.group_ids {
            if !pools.contains_key(group_id) {
                let pool = Arc::new(KeyPool::new(*group_id, self.sink.clone()));
                pool.rebuild(latest.keys.get(*group_id));
                pools.insert(*group_id, pool);
            }
        }
        self.pools.store(Arc::new(pools));
    }

    /// Applies a fresh key snapshot to every known pool.
    pub fn apply_keys(&self, keys: &KeysByGroup) {
        let mut latest = self.latest.lock().expect("pool manager lock");
        latest.keys = Arc::new(keys.clone());

        let pools = self.pools.load();
        for (group_id, pool) in pools.iter() {
            pool.rebuild(latest.keys.get(*group_id));
        }
    }
}
