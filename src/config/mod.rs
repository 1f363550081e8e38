use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use std::{fs, io};

use crate::core::error::{GateError, Result};
use crate::store::StoreOptions;

pub fn get_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .map(|h| h.join("Library/Application Support/privgate"))
    }

    #[cfg(target_os = "linux")]
    {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
            .map(|c| c.join("privgate"))
    }

    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .map(|a| a.join("privgate"))
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .map(|h| h.join(".config/privgate"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct AppConfig {
    /// Settings file holding the permission flag.
    pub flag_file: Option<PathBuf>,
    pub flag_field: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub parse_retries: Option<u32>,
    /// Command that opens the privileged tool where the user can see it.
    pub launch_command: Option<Vec<String>>,
}

impl AppConfig {
    #[must_use]
    pub fn load() -> Self {
        let mut builder = Config::builder();

        if let Some(path) = Self::get_config_path() {
            builder = builder.add_source(File::from(path).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("PRIVGATE")
                .try_parsing(true)
                .list_separator(" ")
                .with_list_parse_key("launch_command"),
        );

        builder
            .build()
            .and_then(Config::try_deserialize)
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to load config: {e}");
                eprintln!("Warning: Failed to load config: {e}");
                Self::default()
            })
    }

    #[must_use]
    pub fn get_config_path() -> Option<PathBuf> {
        get_config_dir().map(|dir| dir.join("config.toml"))
    }

    pub fn init_default() -> std::result::Result<PathBuf, io::Error> {
        let path = Self::get_config_path().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                "Could not determine config directory",
            )
        })?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        if path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("Config file already exists at {}", path.display()),
            ));
        }

        fs::write(&path, include_str!("config.template.toml"))?;
        Ok(path)
    }

    /// Builds store options, preferring `override_path` over the configured
    /// and default flag file locations.
    pub fn store_options(&self, override_path: Option<PathBuf>) -> Result<StoreOptions> {
        let path = override_path
            .or_else(|| self.flag_file.clone())
            .or_else(StoreOptions::default_flag_file)
            .ok_or_else(|| {
                GateError::Config("Could not determine the permission file location".to_string())
            })?;

        let mut options = StoreOptions::new(path);
        if let Some(field) = self.flag_field.as_deref().filter(|f| !f.is_empty()) {
            options = options.with_flag_field(field);
        }
        if let Some(ms) = self.poll_interval_ms {
            if ms == 0 {
                return Err(GateError::Config(
                    "poll_interval_ms must be greater than zero".to_string(),
                ));
            }
            options = options.with_poll_interval(Duration::from_millis(ms));
        }
        if let Some(retries) = self.parse_retries {
            options = options.with_parse_retries(retries);
        }
        Ok(options)
    }

    #[must_use]
    pub fn launch_command(&self) -> Option<&[String]> {
        self.launch_command
            .as_deref()
            .filter(|command| !command.is_empty())
    }
}
