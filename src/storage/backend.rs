use crate::commands::CommandRecord;
use crate::queue::Lane;

use super::StorageError;

/// Persistence operations the queue engine relies on. Implementations must make
/// each call atomic with respect to a single record.
pub trait StorageBackend: Send + Sync {
    fn flush(&self) -> Result<(), StorageError>;

    /// Inserts the record unless one with the same `command_id` exists.
    /// Returns `true` when the record was inserted.
    fn save(&self, record: &CommandRecord) -> Result<bool, StorageError>;

    /// First record of `lane` in `(priority, updated_at)` order accepted by `eligible`.
    fn fetch_next_matching(
        &self,
        lane: Lane,
        eligible: &dyn Fn(&CommandRecord) -> bool,
    ) -> Result<Option<CommandRecord>, StorageError>;

    fn get(&self, command_id: &str) -> Result<Option<CommandRecord>, StorageError>;
    fn delete(&self, command_id: &str) -> Result<bool, StorageError>;
    fn delete_lane(&self, lane: Lane) -> Result<usize, StorageError>;
    fn count(&self, lane: Lane) -> Result<usize, StorageError>;
    fn list_lane(&self, lane: Lane) -> Result<Vec<CommandRecord>, StorageError>;
    fn load_lane_paused(&self, lane: Lane) -> Result<Option<bool>, StorageError>;
    fn save_lane_paused(&self, lane: Lane, paused: bool) -> Result<(), StorageError>;

    fn fetch_next(&self, lane: Lane) -> Result<Option<CommandRecord>, StorageError> {
        self.fetch_next_matching(lane, &|_| true)
    }

    fn exists(&self, command_id: &str) -> Result<bool, StorageError> {
        Ok(self.get(command_id)?.is_some())
    }
}
