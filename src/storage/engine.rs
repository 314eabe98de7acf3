use std::fmt;

/// Where lane records live. `Memory` keeps nothing across restarts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageEngine {
    Sled,
    Memory,
}

const ENGINE_NAMES: [(&str, StorageEngine); 2] = [
    ("sled", StorageEngine::Sled),
    ("memory", StorageEngine::Memory),
];

impl StorageEngine {
    pub fn parse(raw: &str) -> Option<Self> {
        ENGINE_NAMES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(raw.trim()))
            .map(|(_, engine)| *engine)
    }

    pub fn as_str(self) -> &'static str {
        ENGINE_NAMES
            .iter()
            .find(|(_, engine)| *engine == self)
            .map_or("sled", |(name, _)| name)
    }

    pub fn allowed_values() -> Vec<&'static str> {
        ENGINE_NAMES.iter().map(|(name, _)| *name).collect()
    }
}

impl fmt::Display for StorageEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// sled tuning hint from `[storage.sled] mode`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SledMode {
    LowSpace,
    HighThroughput,
}

impl SledMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "low_space" => Some(Self::LowSpace),
            "high_throughput" => Some(Self::HighThroughput),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{SledMode, StorageEngine};

    #[test]
    fn engine_names_parse_case_insensitively() {
        assert_eq!(StorageEngine::parse(" Memory "), Some(StorageEngine::Memory));
        assert_eq!(StorageEngine::parse("sled"), Some(StorageEngine::Sled));
        assert_eq!(StorageEngine::parse("rocksdb"), None);
        assert_eq!(StorageEngine::allowed_values(), vec!["sled", "memory"]);
        assert_eq!(StorageEngine::Memory.to_string(), "memory");
    }

    #[test]
    fn sled_mode_accepts_dashed_spelling() {
        assert_eq!(SledMode::parse("high-throughput"), Some(SledMode::HighThroughput));
        assert_eq!(SledMode::parse("low_space"), Some(SledMode::LowSpace));
        assert_eq!(SledMode::parse("fast"), None);
    }
}
