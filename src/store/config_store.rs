use async_trait::async_trait;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::document::{DEFAULT_FLAG_FIELD, FlagDocument};
use super::watcher::PollWatcher;
use super::{FlagStore, WatchCallback};
use crate::core::error::Result;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_PARSE_RETRIES: u32 = 3;
pub const DEFAULT_PARSE_RETRY_DELAY: Duration = Duration::from_millis(50);

const DEFAULT_FLAG_FILE_NAME: &str = ".privgate.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    pub path: PathBuf,
    pub flag_field: String,
    pub poll_interval: Duration,
    /// Extra parse attempts made on a corrupt document before a write falls
    /// back to an empty one.
    pub parse_retries: u32,
    pub parse_retry_delay: Duration,
}

impl StoreOptions {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            flag_field: DEFAULT_FLAG_FIELD.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            parse_retries: DEFAULT_PARSE_RETRIES,
            parse_retry_delay: DEFAULT_PARSE_RETRY_DELAY,
        }
    }

    #[must_use]
    pub fn with_flag_field(mut self, field: impl Into<String>) -> Self {
        self.flag_field = field.into();
        self
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_parse_retries(mut self, retries: u32) -> Self {
        self.parse_retries = retries;
        self
    }

    #[must_use]
    pub const fn with_parse_retry_delay(mut self, delay: Duration) -> Self {
        self.parse_retry_delay = delay;
        self
    }

    #[must_use]
    pub fn default_flag_file() -> Option<PathBuf> {
        #[cfg(target_os = "windows")]
        let home = std::env::var_os("USERPROFILE");
        #[cfg(not(target_os = "windows"))]
        let home = std::env::var_os("HOME");

        home.map(|h| PathBuf::from(h).join(DEFAULT_FLAG_FILE_NAME))
    }
}

pub struct ConfigStore {
    options: StoreOptions,
    write_lock: Mutex<()>,
    watcher: PollWatcher,
}

impl ConfigStore {
    #[must_use]
    pub fn new(options: StoreOptions) -> Self {
        Self {
            options,
            write_lock: Mutex::new(()),
            watcher: PollWatcher::new(),
        }
    }

    #[must_use]
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self::new(StoreOptions::new(path))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.options.path
    }

    #[must_use]
    pub const fn options(&self) -> &StoreOptions {
        &self.options
    }

    #[must_use]
    pub fn is_watching(&self) -> bool {
        self.watcher.is_running()
    }

    async fn read_existing_document(&self) -> Result<FlagDocument> {
        let mut attempt = 0;
        loop {
            let content = match fs::read(&self.options.path).await {
                Ok(content) => content,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Ok(FlagDocument::default());
                }
                Err(e) => return Err(e.into()),
            };

            match FlagDocument::parse(&content) {
                Ok(document) => return Ok(document),
                Err(e) if attempt < self.options.parse_retries => {
                    attempt += 1;
                    debug!(
                        path = %self.options.path.display(),
                        attempt,
                        error = %e,
                        "Settings document failed to parse, retrying"
                    );
                    tokio::time::sleep(self.options.parse_retry_delay).await;
                }
                Err(e) => {
                    warn!(
                        path = %self.options.path.display(),
                        attempts = attempt + 1,
                        error = %e,
                        "Settings document is corrupt, rewriting with only the permission flag"
                    );
                    return Ok(FlagDocument::default());
                }
            }
        }
    }

    async fn atomic_write(&self, document: &FlagDocument) -> Result<()> {
        if let Some(parent) = self.options.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }

        let content = document.to_pretty_string()?;

        let mut temp_path = OsString::from(self.options.path.as_os_str());
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);

        fs::write(&temp_path, &content).await?;

        if let Err(e) = fs::rename(&temp_path, &self.options.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        Ok(())
    }
}

#[async_trait]
impl FlagStore for ConfigStore {
    async fn read(&self) -> bool {
        let content = match fs::read(&self.options.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.options.path.display(), "Permission file not found");
                return false;
            }
            Err(e) => {
                warn!(
                    path = %self.options.path.display(),
                    error = %e,
                    "Failed to read permission file, treating flag as unset"
                );
                return false;
            }
        };

        match FlagDocument::parse(&content) {
            Ok(document) => document.flag(&self.options.flag_field),
            Err(e) => {
                warn!(
                    path = %self.options.path.display(),
                    error = %e,
                    "Permission file is not valid JSON, treating flag as unset"
                );
                false
            }
        }
    }

    async fn write(&self, value: bool) -> Result<()> {
        let _lock = self.write_lock.lock().await;

        let mut document = self.read_existing_document().await?;
        let previous = document.flag(&self.options.flag_field);
        document.set_flag(&self.options.flag_field, value);
        self.atomic_write(&document).await?;

        info!(
            path = %self.options.path.display(),
            field = %self.options.flag_field,
            old = previous,
            new = value,
            "Wrote permission flag"
        );
        Ok(())
    }

    fn watch(&self, callback: WatchCallback) -> Result<()> {
        self.watcher.start(
            self.options.path.clone(),
            self.options.poll_interval,
            callback,
        )
    }

    fn dispose(&self) {
        self.watcher.stop();
    }
}
