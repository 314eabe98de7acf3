use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the independent command backlogs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    General,
    Hashing,
    Image,
}

impl Lane {
    pub const ALL: [Lane; 3] = [Lane::General, Lane::Hashing, Lane::Image];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::Hashing => "hashing",
            Self::Image => "image",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "general" => Some(Self::General),
            "hashing" => Some(Self::Hashing),
            "image" => Some(Self::Image),
            _ => None,
        }
    }

    /// Logger context tag, e.g. `queue::hashing`.
    pub fn log_context(self) -> &'static str {
        match self {
            Self::General => "queue::general",
            Self::Hashing => "queue::hashing",
            Self::Image => "queue::image",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
