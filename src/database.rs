use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// used for the audit stamps handed to models
use chrono::Utc;

// used for persistence
use rusqlite::Connection;

use tracing::info;

// our own stuff that we need
use crate::config::{PersistenceMode, Settings};
use crate::dispatch::ContractRegistry;
use crate::error::{AmbitError, Result};
use crate::mapping::MappingStore;
use crate::model::AuditStamp;
use crate::scope::{self, Scope};
use crate::unit_of_work::{Begin, UnitOfWork};

// the busy timeout rusqlite installs on every fresh connection
const DRIVER_DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_DATABASE: AtomicU64 = AtomicU64::new(1);

struct Inner {
    settings: Settings,
    location: String,
    // in-memory data lives only as long as some connection to it is open
    keeper: Mutex<Option<Connection>>,
    mappings: MappingStore,
    contracts: ContractRegistry,
}

/// The shared entry point: hands out units of work against one store.
///
/// Cloning is cheap and every clone sees the same store, mapping store and
/// contract registry. `Database` is `Send + Sync`; the units of work it opens
/// are not, since they belong to the call chain that opened them.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Inner>,
    actor: Option<i64>,
}

impl Database {
    pub fn open(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let (location, keeper) = match &settings.persistence {
            PersistenceMode::InMemory => {
                let n = NEXT_DATABASE.fetch_add(1, Ordering::Relaxed);
                // a named memdb store is shared by every connection of the process and
                // locks like a file, so contending units wait out the busy timeout
                let uri = format!("file:/ambit-{}-{}?vfs=memdb", std::process::id(), n);
                let keeper = Connection::open(&uri)?;
                (uri, Some(keeper))
            }
            PersistenceMode::File(path) => (path.clone(), None),
        };
        info!(location = %location, "database opened");
        let mappings = MappingStore::new(settings.mapping_dir.clone());
        Ok(Self {
            inner: Arc::new(Inner {
                settings,
                location,
                keeper: Mutex::new(keeper),
                mappings,
                contracts: ContractRegistry::new(),
            }),
            actor: None,
        })
    }
    pub fn in_memory() -> Result<Self> {
        Self::open(Settings::in_memory())
    }
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }
    /// The file path or in-memory URI all connections are opened against.
    pub fn location(&self) -> &str {
        &self.inner.location
    }
    pub fn mappings(&self) -> &MappingStore {
        &self.inner.mappings
    }
    pub fn contracts(&self) -> &ContractRegistry {
        &self.inner.contracts
    }
    fn default_timeout(&self) -> Duration {
        self.inner.settings.command_timeout().unwrap_or(DRIVER_DEFAULT_TIMEOUT)
    }
    /// A fresh physical connection; every unit of work gets its own.
    pub fn open_connection(&self) -> Result<Connection> {
        let connection = Connection::open(&self.inner.location)?;
        if let Some(timeout) = self.inner.settings.command_timeout() {
            connection.busy_timeout(timeout)?;
        }
        Ok(connection)
    }
    /// Opens a unit of work that nothing else can see. Prefer [`Database::scope`].
    pub fn begin(&self) -> Result<UnitOfWork> {
        self.begin_with(Begin::Deferred)
    }
    /// Like [`Database::begin`], but the unit holds the write lock from the start.
    pub fn begin_immediate(&self) -> Result<UnitOfWork> {
        self.begin_with(Begin::Immediate)
    }
    pub(crate) fn begin_with(&self, begin: Begin) -> Result<UnitOfWork> {
        UnitOfWork::open_with(self.open_connection()?, self.location(), Some(begin), self.default_timeout())
    }
    /// Joins the ambient unit of work, or creates and owns a new one.
    pub fn scope(&self) -> Result<Scope> {
        Scope::join_or_create(self, Begin::Deferred)
    }
    /// Like [`Database::scope`], but a unit it creates holds the write lock from
    /// the start. Use it for call chains that read and then write.
    pub fn write_scope(&self) -> Result<Scope> {
        Scope::join_or_create(self, Begin::Immediate)
    }
    /// Creates a new ambient unit of work; fails if one is already active.
    pub fn create_new(&self) -> Result<Scope> {
        Scope::create_new(self, Begin::Deferred)
    }
    /// The ambient unit of work of this call chain, if it belongs to this database.
    pub fn current(&self) -> Option<Rc<UnitOfWork>> {
        scope::current().filter(|unit| unit.origin() == self.location())
    }
    /// Runs schema or seed statements outside of any unit of work.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let keeper = self.inner.keeper.lock()?;
        match keeper.as_ref() {
            Some(connection) => connection.execute_batch(sql)?,
            None => self.open_connection()?.execute_batch(sql)?,
        }
        Ok(())
    }

    // ------------- Audit -------------
    /// A handle whose writes are stamped with `user` instead of the system user.
    pub fn acting_as(&self, user: i64) -> Self {
        Self { inner: Arc::clone(&self.inner), actor: Some(user) }
    }
    pub fn actor(&self) -> i64 {
        self.actor.unwrap_or(self.inner.settings.system_user)
    }
    pub fn stamp(&self) -> AuditStamp {
        AuditStamp { at: Utc::now().naive_utc(), user: self.actor() }
    }
    pub(crate) fn ensure_owns(&self, unit: &UnitOfWork) -> Result<()> {
        if unit.origin() != self.location() {
            return Err(AmbitError::Configuration(format!(
                "unit of work {} belongs to '{}', not '{}'",
                unit.id(),
                unit.origin(),
                self.location()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("location", &self.inner.location).field("actor", &self.actor).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::value::Value;

    #[test]
    fn in_memory_databases_are_private_and_shared_between_units() {
        let a = Database::in_memory().unwrap();
        let b = Database::in_memory().unwrap();
        assert_ne!(a.location(), b.location());
        a.execute_batch("create table t (v integer); insert into t values (1);").unwrap();
        let unit = a.begin().unwrap();
        let n: i64 = unit.connection().unwrap().query_row("select count(*) from t", [], |r| r.get(0)).unwrap();
        assert_eq!(n, 1);
        assert!(b.execute_batch("select * from t").is_err());
    }

    #[test]
    fn an_immediate_unit_keeps_other_units_waiting() {
        let db = Database::open(Settings::in_memory().with_command_timeout(Duration::from_millis(20))).unwrap();
        db.execute_batch("create table t (v integer); insert into t values (1);").unwrap();
        let writer = db.begin_immediate().unwrap();
        let reader = db.begin().unwrap();
        let mut count = Command::new("select count(*) from t");
        assert!(matches!(reader.execute_scalar(&mut count), Err(AmbitError::Persistence(_))));
        writer.release().unwrap();
        assert_eq!(reader.execute_scalar(&mut count).unwrap(), Value::Integer(1));
    }

    #[test]
    fn acting_user_overrides_the_system_user() {
        let db = Database::open(Settings { system_user: 7, ..Settings::in_memory() }).unwrap();
        assert_eq!(db.stamp().user, 7);
        assert_eq!(db.acting_as(42).stamp().user, 42);
        assert_eq!(db.acting_as(42).location(), db.location());
    }
}
