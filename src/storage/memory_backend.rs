use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::commands::{CommandRecord, Priority};
use crate::queue::Lane;

use super::{StorageBackend, StorageError};

type OrderKey = (Lane, Priority, i64, String);

#[derive(Default)]
struct MemoryState {
    records: HashMap<String, CommandRecord>,
    order: BTreeMap<OrderKey, ()>,
    paused_lanes: HashMap<Lane, bool>,
}

/// Non-durable backend for tests and throwaway hosts.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn order_key(record: &CommandRecord) -> OrderKey {
    let (priority, updated_at_micros, command_id) = record.order_key();
    (record.lane, priority, updated_at_micros, command_id.to_owned())
}

fn lane_range(
    order: &BTreeMap<OrderKey, ()>,
    lane: Lane,
) -> impl Iterator<Item = &OrderKey> + '_ {
    order
        .range((lane, Priority::MIN, i64::MIN, String::new())..)
        .map(|(key, _)| key)
        .take_while(move |key| key.0 == lane)
}

impl StorageBackend for MemoryStorage {
    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn save(&self, record: &CommandRecord) -> Result<bool, StorageError> {
        let mut state = self.lock();
        if state.records.contains_key(&record.command_id) {
            return Ok(false);
        }
        state.order.insert(order_key(record), ());
        state
            .records
            .insert(record.command_id.clone(), record.clone());
        Ok(true)
    }

    fn fetch_next_matching(
        &self,
        lane: Lane,
        eligible: &dyn Fn(&CommandRecord) -> bool,
    ) -> Result<Option<CommandRecord>, StorageError> {
        let state = self.lock();
        let next = lane_range(&state.order, lane)
            .filter_map(|key| state.records.get(&key.3))
            .find(|record| eligible(record))
            .cloned();
        Ok(next)
    }

    fn get(&self, command_id: &str) -> Result<Option<CommandRecord>, StorageError> {
        Ok(self.lock().records.get(command_id).cloned())
    }

    fn delete(&self, command_id: &str) -> Result<bool, StorageError> {
        let mut state = self.lock();
        let Some(record) = state.records.remove(command_id) else {
            return Ok(false);
        };
        state.order.remove(&order_key(&record));
        Ok(true)
    }

    fn delete_lane(&self, lane: Lane) -> Result<usize, StorageError> {
        let mut state = self.lock();
        let keys = lane_range(&state.order, lane).cloned().collect::<Vec<_>>();
        for key in &keys {
            state.order.remove(key);
            state.records.remove(&key.3);
        }
        Ok(keys.len())
    }

    fn count(&self, lane: Lane) -> Result<usize, StorageError> {
        Ok(lane_range(&self.lock().order, lane).count())
    }

    fn list_lane(&self, lane: Lane) -> Result<Vec<CommandRecord>, StorageError> {
        let state = self.lock();
        Ok(lane_range(&state.order, lane)
            .filter_map(|key| state.records.get(&key.3))
            .cloned()
            .collect())
    }

    fn load_lane_paused(&self, lane: Lane) -> Result<Option<bool>, StorageError> {
        Ok(self.lock().paused_lanes.get(&lane).copied())
    }

    fn save_lane_paused(&self, lane: Lane, paused: bool) -> Result<(), StorageError> {
        self.lock().paused_lanes.insert(lane, paused);
        Ok(())
    }
}
