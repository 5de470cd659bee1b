use std::collections::HashMap;
use std::sync::Arc;

use keygate_channel::Group;
use keygate_store::GroupRecord;

/// Immutable snapshot of every configured group, indexed both ways.
#[derive(Debug, Default)]
pub struct GroupMap {
    by_name: HashMap<String, Arc<Group>>,
    by_id: HashMap<i64, Arc<Group>>,
}

impl GroupMap {
    pub fn from_records(records: Vec<GroupRecord>) -> Self {
        let mut by_name = HashMap::with_capacity(records.len());
        let mut by_id = HashMap::with_capacity(records.len());
        for record in records {
            let group = Arc::new(Group {
                id: record.id,
                name: record.name,
                display_name: record.display_name,
                channel_type: record.channel_type,
                upstreams: record.upstreams,
                config: record.config,
            });
            by_name.insert(group.name.clone(), group.clone());
            by_id.insert(group.id, group);
        }
        Self { by_name, by_id }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Group>> {
        self.by_name.get(name).cloned()
    }

    pub fn get_by_id(&self, id: i64) -> Option<Arc<Group>> {
        self.by_id.get(&id).cloned()
    }

    pub fn ids(&self) -> Vec<i64> {
        self.by_id.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Group>> {
        self.by_id.values()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
