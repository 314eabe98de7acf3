use std::path::Path;

use serde::{Deserialize, Serialize};
use sled::transaction::{TransactionError, TransactionResult};

use crate::commands::CommandRecord;
use crate::queue::Lane;

use super::{SledMode, StorageBackend, StorageError};

pub struct SledStorage {
    db: sled::Db,
}

const RECORD_PREFIX: &[u8] = b"v1:c:";
const ORDER_PREFIX: &[u8] = b"v1:o:";
const LANE_STATE_PREFIX: &[u8] = b"v1:q:";

#[derive(Debug, Serialize, Deserialize)]
struct LaneState {
    lane: Lane,
    paused: bool,
}

impl SledStorage {
    pub fn open(
        data_path: &Path,
        cache_capacity: Option<u64>,
        mode: Option<SledMode>,
    ) -> Result<Self, StorageError> {
        let mut config = sled::Config::new().path(data_path);

        if let Some(cache_capacity) = cache_capacity {
            config = config.cache_capacity(cache_capacity);
        }

        if let Some(mode) = mode {
            config = config.mode(match mode {
                SledMode::LowSpace => sled::Mode::LowSpace,
                SledMode::HighThroughput => sled::Mode::HighThroughput,
            });
        }

        let db = config.open()?;
        Ok(Self { db })
    }

    fn read_record(&self, command_id: &[u8]) -> Result<Option<CommandRecord>, StorageError> {
        let Some(raw) = self.db.get(record_key_bytes(command_id))? else {
            return Ok(None);
        };
        serde_json::from_slice(raw.as_ref())
            .map(Some)
            .map_err(StorageError::DeserializeRecord)
    }

    /// Index entries whose record vanished or no longer parses are dropped so a
    /// single bad row cannot wedge its lane.
    fn purge_index_entry(&self, index_key: &[u8], command_id: &[u8]) -> Result<(), StorageError> {
        let mut batch = sled::Batch::default();
        batch.remove(index_key);
        batch.remove(record_key_bytes(command_id));
        self.db.apply_batch(batch)?;
        Ok(())
    }
}

fn record_key(command_id: &str) -> Vec<u8> {
    record_key_bytes(command_id.as_bytes())
}

fn record_key_bytes(command_id: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(RECORD_PREFIX.len() + command_id.len());
    key.extend_from_slice(RECORD_PREFIX);
    key.extend_from_slice(command_id);
    key
}

fn lane_order_prefix(lane: Lane) -> Vec<u8> {
    let mut key = Vec::with_capacity(ORDER_PREFIX.len() + lane.as_str().len() + 1);
    key.extend_from_slice(ORDER_PREFIX);
    key.extend_from_slice(lane.as_str().as_bytes());
    key.push(b':');
    key
}

fn lane_state_key(lane: Lane) -> Vec<u8> {
    let mut key = LANE_STATE_PREFIX.to_vec();
    key.extend_from_slice(lane.as_str().as_bytes());
    key
}

/// Big-endian with the sign bit flipped, so byte order equals numeric order.
fn sortable_i64(value: i64) -> [u8; 8] {
    ((value as u64) ^ (1 << 63)).to_be_bytes()
}

fn order_key(record: &CommandRecord) -> Vec<u8> {
    let (priority, updated_at_micros, command_id) = record.order_key();
    let mut key = lane_order_prefix(record.lane);
    key.extend_from_slice(&sortable_i64(i64::from(priority)));
    key.extend_from_slice(&sortable_i64(updated_at_micros));
    key.extend_from_slice(command_id.as_bytes());
    key
}

fn map_transaction_error(error: TransactionError<()>) -> StorageError {
    match error {
        TransactionError::Storage(source) => StorageError::Sled(source),
        TransactionError::Abort(()) => {
            StorageError::Sled(sled::Error::Unsupported("transaction aborted".to_owned()))
        }
    }
}

impl StorageBackend for SledStorage {
    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    fn save(&self, record: &CommandRecord) -> Result<bool, StorageError> {
        let value = serde_json::to_vec(record).map_err(StorageError::SerializeRecord)?;
        let primary = record_key(&record.command_id);
        let index = order_key(record);

        let outcome: TransactionResult<bool> = self.db.transaction(|tx| {
            if tx.get(primary.as_slice())?.is_some() {
                return Ok(false);
            }
            tx.insert(primary.as_slice(), value.as_slice())?;
            tx.insert(index.as_slice(), record.command_id.as_bytes())?;
            Ok(true)
        });
        outcome.map_err(map_transaction_error)
    }

    fn fetch_next_matching(
        &self,
        lane: Lane,
        eligible: &dyn Fn(&CommandRecord) -> bool,
    ) -> Result<Option<CommandRecord>, StorageError> {
        for entry in self.db.scan_prefix(lane_order_prefix(lane)) {
            let (index_key, command_id) = entry?;
            match self.read_record(command_id.as_ref()) {
                Ok(Some(record)) => {
                    if eligible(&record) {
                        return Ok(Some(record));
                    }
                }
                Ok(None) | Err(StorageError::DeserializeRecord(_)) => {
                    self.purge_index_entry(index_key.as_ref(), command_id.as_ref())?;
                }
                Err(error) => return Err(error),
            }
        }
        Ok(None)
    }

    fn get(&self, command_id: &str) -> Result<Option<CommandRecord>, StorageError> {
        self.read_record(command_id.as_bytes())
    }

    fn delete(&self, command_id: &str) -> Result<bool, StorageError> {
        let Some(record) = self.get(command_id)? else {
            return Ok(false);
        };
        let primary = record_key(command_id);
        let index = order_key(&record);

        let outcome: TransactionResult<bool> = self.db.transaction(|tx| {
            let removed = tx.remove(primary.as_slice())?.is_some();
            tx.remove(index.as_slice())?;
            Ok(removed)
        });
        outcome.map_err(map_transaction_error)
    }

    fn delete_lane(&self, lane: Lane) -> Result<usize, StorageError> {
        let mut batch = sled::Batch::default();
        let mut removed = 0usize;
        for entry in self.db.scan_prefix(lane_order_prefix(lane)) {
            let (index_key, command_id) = entry?;
            batch.remove(index_key);
            batch.remove(record_key_bytes(command_id.as_ref()));
            removed += 1;
        }
        self.db.apply_batch(batch)?;
        Ok(removed)
    }

    fn count(&self, lane: Lane) -> Result<usize, StorageError> {
        let mut count = 0usize;
        for entry in self.db.scan_prefix(lane_order_prefix(lane)) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    fn list_lane(&self, lane: Lane) -> Result<Vec<CommandRecord>, StorageError> {
        let mut records = Vec::new();
        for entry in self.db.scan_prefix(lane_order_prefix(lane)) {
            let (_, command_id) = entry?;
            if let Some(record) = self.read_record(command_id.as_ref())? {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn load_lane_paused(&self, lane: Lane) -> Result<Option<bool>, StorageError> {
        let Some(raw) = self.db.get(lane_state_key(lane))? else {
            return Ok(None);
        };
        let state: LaneState =
            serde_json::from_slice(raw.as_ref()).map_err(StorageError::DeserializeLaneState)?;
        Ok(Some(state.paused))
    }

    fn save_lane_paused(&self, lane: Lane, paused: bool) -> Result<(), StorageError> {
        let value = serde_json::to_vec(&LaneState { lane, paused })
            .map_err(StorageError::SerializeLaneState)?;
        self.db.insert(lane_state_key(lane), value)?;
        self.db.flush()?;
        Ok(())
    }
}
