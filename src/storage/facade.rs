use std::fs;
use std::path::PathBuf;

use serde_json::json;

use crate::commands::CommandRecord;
use crate::config::StorageConfig;
use crate::logging::{LogLevel, Logger};
use crate::queue::Lane;

use super::{
    expand_home_path, MemoryStorage, SledMode, SledStorage, StorageBackend, StorageEngine,
    StorageError,
};

/// Engine-agnostic entry point shared by every lane.
pub struct StorageFacade {
    engine: StorageEngine,
    data_path: Option<PathBuf>,
    backend: Box<dyn StorageBackend>,
}

impl StorageFacade {
    pub fn initialize(config: &StorageConfig, logger: &Logger) -> Result<Self, StorageError> {
        let Some(engine) = StorageEngine::parse(&config.engine) else {
            return Err(StorageError::UnsupportedEngine {
                engine: config.engine.clone(),
            });
        };

        if engine == StorageEngine::Memory {
            logger.warn(
                Some("storage::init"),
                "Memory storage engine selected; queued commands will not survive a restart",
            );
            return Ok(Self::in_memory());
        }

        let data_path = expand_home_path(&config.path)?;
        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Initializing storage facade",
            Some(json!({
                "engine": engine.as_str(),
                "configured_path": config.path,
                "resolved_path": data_path.display().to_string(),
                "sled": {
                    "cache_capacity": config.sled.cache_capacity,
                    "mode": config.sled.mode
                }
            })),
        );

        fs::create_dir_all(&data_path).map_err(|source| StorageError::CreateDataDir {
            path: data_path.clone(),
            source,
        })?;

        let mode = match config.sled.mode.as_deref() {
            Some(raw) => {
                let Some(mode) = SledMode::parse(raw) else {
                    return Err(StorageError::InvalidSledMode {
                        mode: raw.to_owned(),
                    });
                };
                Some(mode)
            }
            None => None,
        };
        let backend = SledStorage::open(&data_path, config.sled.cache_capacity, mode)?;

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Storage facade initialized",
            Some(json!({
                "engine": engine.as_str(),
                "resolved_path": data_path.display().to_string(),
            })),
        );

        Ok(Self {
            engine,
            data_path: Some(data_path),
            backend: Box::new(backend),
        })
    }

    pub fn in_memory() -> Self {
        Self::with_backend(StorageEngine::Memory, Box::new(MemoryStorage::new()))
    }

    pub fn with_backend(engine: StorageEngine, backend: Box<dyn StorageBackend>) -> Self {
        Self {
            engine,
            data_path: None,
            backend,
        }
    }

    pub fn engine(&self) -> StorageEngine {
        self.engine
    }

    pub fn data_path(&self) -> Option<&PathBuf> {
        self.data_path.as_ref()
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.backend.flush()
    }

    pub fn save(&self, record: &CommandRecord) -> Result<bool, StorageError> {
        self.backend.save(record)
    }

    pub fn fetch_next(&self, lane: Lane) -> Result<Option<CommandRecord>, StorageError> {
        self.backend.fetch_next(lane)
    }

    pub fn fetch_next_matching(
        &self,
        lane: Lane,
        eligible: &dyn Fn(&CommandRecord) -> bool,
    ) -> Result<Option<CommandRecord>, StorageError> {
        self.backend.fetch_next_matching(lane, eligible)
    }

    pub fn get(&self, command_id: &str) -> Result<Option<CommandRecord>, StorageError> {
        self.backend.get(command_id)
    }

    pub fn exists(&self, command_id: &str) -> Result<bool, StorageError> {
        self.backend.exists(command_id)
    }

    pub fn delete(&self, command_id: &str) -> Result<bool, StorageError> {
        self.backend.delete(command_id)
    }

    pub fn delete_lane(&self, lane: Lane) -> Result<usize, StorageError> {
        self.backend.delete_lane(lane)
    }

    pub fn count(&self, lane: Lane) -> Result<usize, StorageError> {
        self.backend.count(lane)
    }

    pub fn list_lane(&self, lane: Lane) -> Result<Vec<CommandRecord>, StorageError> {
        self.backend.list_lane(lane)
    }

    pub fn load_lane_paused(&self, lane: Lane) -> Result<Option<bool>, StorageError> {
        self.backend.load_lane_paused(lane)
    }

    pub fn save_lane_paused(&self, lane: Lane, paused: bool) -> Result<(), StorageError> {
        self.backend.save_lane_paused(lane, paused)
    }
}
