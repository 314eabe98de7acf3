//! Persistent, priority-ordered command lanes and the ban-aware metadata
//! protocol connections their commands run through.

pub mod commands;
pub mod config;
pub mod connection;
pub mod events;
pub mod logging;
pub mod queue;
pub mod shutdown;
pub mod storage;
pub mod utils;
