use thiserror::Error;

#[derive(Error, Debug)]
pub enum AmbitError {
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Write conflict: {0}")]
    Conflict(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Cardinality violation: {origin} matched {found} rows where exactly one was required")]
    Cardinality { origin: String, found: usize },
    #[error("Invalid argument: {0}")]
    Argument(String),
    #[error("Mapping error{}: {message}", .entity.as_deref().map(|e| format!(" ({e})")).unwrap_or_default())]
    Mapping { message: String, entity: Option<String> },
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Unit of work {0} has already been released")]
    Released(u64),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, AmbitError>;

impl AmbitError {
    pub fn mapping(message: impl Into<String>, entity: Option<&str>) -> Self {
        Self::Mapping { message: message.into(), entity: entity.map(str::to_owned) }
    }
    /// The only class the core turns into a normal return value.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
    /// Configuration and argument errors are bugs in the calling code, never data problems.
    pub fn is_programming_error(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Argument(_) | Self::Released(_))
    }
}

// Helper conversions
impl From<rusqlite::Error> for AmbitError {
    fn from(e: rusqlite::Error) -> Self { Self::Persistence(e.to_string()) }
}
impl From<config::ConfigError> for AmbitError {
    fn from(e: config::ConfigError) -> Self { Self::Configuration(e.to_string()) }
}
impl From<serde_json::Error> for AmbitError {
    fn from(e: serde_json::Error) -> Self { Self::mapping(e.to_string(), None) }
}
impl<T> From<std::sync::PoisonError<T>> for AmbitError {
    fn from(e: std::sync::PoisonError<T>) -> Self { Self::Lock(e.to_string()) }
}
