//! Runtime settings and logging bootstrap.
//!
//! Settings are layered the usual way: built-in defaults, then an optional
//! file (format chosen by extension), then `AMBIT__*` environment variables,
//! e.g. `AMBIT__FETCH_SIZE=256` or `AMBIT__PERSISTENCE__MODE=file`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::error::{AmbitError, Result};

/// Where the data lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "path", rename_all = "snake_case")]
pub enum PersistenceMode {
    /// A private in-memory database (a named `memdb` store), alive as long as its `Database`.
    InMemory,
    File(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub persistence: PersistenceMode,
    /// `None` leaves the driver's own busy timeout in place.
    pub command_timeout_ms: Option<u64>,
    /// Rows fetched per page by lazy `find` sequences.
    pub fetch_size: usize,
    /// Directory of `<entity type>.json` mapping documents.
    pub mapping_dir: Option<PathBuf>,
    /// Audit user id stamped onto models when no acting user is set.
    pub system_user: i64,
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            persistence: PersistenceMode::InMemory,
            command_timeout_ms: None,
            fetch_size: 64,
            mapping_dir: None,
            system_user: 0,
            log_filter: "info".to_string(),
        }
    }
}

impl Settings {
    pub fn in_memory() -> Self {
        Self::default()
    }
    pub fn file(path: impl Into<String>) -> Self {
        Self { persistence: PersistenceMode::File(path.into()), ..Self::default() }
    }
    /// Loads settings from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("persistence.mode", "in_memory")?
            .set_default("fetch_size", 64i64)?
            .set_default("system_user", 0i64)?
            .set_default("log_filter", "info")?;
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        let settings: Settings = builder
            .add_source(Environment::with_prefix("AMBIT").separator("__"))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }
    pub fn validate(&self) -> Result<()> {
        if self.fetch_size == 0 {
            return Err(AmbitError::Configuration("fetch_size must be at least 1".into()));
        }
        if let PersistenceMode::File(path) = &self.persistence {
            if path.trim().is_empty() {
                return Err(AmbitError::Configuration("file persistence needs a path".into()));
            }
        }
        Ok(())
    }
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_ms.map(Duration::from_millis)
    }
    pub fn with_fetch_size(mut self, fetch_size: usize) -> Self {
        self.fetch_size = fetch_size;
        self
    }
    pub fn with_mapping_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.mapping_dir = Some(dir.into());
        self
    }
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, falling back to the
/// configured filter. Safe to call more than once; later calls are ignored.
pub fn init_logging(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_in_memory() {
        let s = Settings::load(None).unwrap();
        assert_eq!(s.persistence, PersistenceMode::InMemory);
        assert_eq!(s.fetch_size, 64);
        assert!(s.command_timeout().is_none());
    }

    #[test]
    fn file_layer_overrides_defaults() {
        let path = std::env::temp_dir().join("ambit_settings_test.toml");
        std::fs::write(
            &path,
            "fetch_size = 5\ncommand_timeout_ms = 250\n[persistence]\nmode = \"file\"\npath = \"data.db\"\n",
        )
        .unwrap();
        let s = Settings::load(Some(&path)).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(s.fetch_size, 5);
        assert_eq!(s.command_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(s.persistence, PersistenceMode::File("data.db".into()));
    }

    #[test]
    fn zero_fetch_size_is_rejected() {
        let s = Settings::in_memory().with_fetch_size(0);
        assert!(matches!(s.validate(), Err(AmbitError::Configuration(_))));
    }
}
