//! External permission file access.
//!
//! [`ConfigStore`] is the only component that touches the settings file
//! shared with the privileged tool. The cache and coordinator depend on the
//! [`FlagStore`] trait so they can be exercised against in-memory stores.

pub mod config_store;
pub mod document;
pub mod watcher;

use async_trait::async_trait;
use std::sync::Arc;

use crate::core::error::Result;

pub use config_store::{
    ConfigStore, DEFAULT_PARSE_RETRIES, DEFAULT_PARSE_RETRY_DELAY, DEFAULT_POLL_INTERVAL,
    StoreOptions,
};
pub use document::{DEFAULT_FLAG_FIELD, FlagDocument};
pub use watcher::PollWatcher;

pub type WatchCallback = Arc<dyn Fn() + Send + Sync>;

#[async_trait]
pub trait FlagStore: Send + Sync {
    /// Current value of the flag. Missing, unreadable or corrupt files read
    /// as `false`.
    async fn read(&self) -> bool;

    /// Sets the flag, preserving every other field of the document.
    async fn write(&self, value: bool) -> Result<()>;

    /// Registers `callback` to fire on every detected external modification.
    fn watch(&self, callback: WatchCallback) -> Result<()>;

    /// Stops watching. Safe to call more than once.
    fn dispose(&self);
}
