//! Whole-site backup, restore and migration engine.
//!
//! A backup snapshots the site database and file tree into one archive and
//! ships it to any number of storage destinations. A restore fetches it
//! back, replays it and rewrites URLs for the installation it lands on.

pub mod backup;
pub mod catalog;
pub mod config;
pub mod database;
pub mod engine;
pub mod errors;
pub mod migration;
pub mod restore;
pub mod scheduler;
pub mod storage;
pub mod utils;

pub use engine::{Engine, EngineContext};
pub use errors::{AppError, Result};
