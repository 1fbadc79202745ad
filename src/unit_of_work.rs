//! The leaf of the core: one physical connection and at most one transaction.
//!
//! A [`UnitOfWork`] begins a transaction when it is opened and ends it
//! exactly once, when it is released: committed if [`UnitOfWork::complete`] was
//! called, rolled back otherwise. Release happens on drop at the latest, so it
//! runs on every exit path. Units opened to write begin `immediate`: they wait
//! for the write lock up front instead of failing to upgrade a read lock later.
//!
//! Sessions, cursors and anything else that outlives a single call only ever
//! hold a [`ConnectionLink`], a weak handle that stops resolving once the unit
//! has been released.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, warn};

use crate::command::{Command, DataTable, Direction, Executor, Parameter};
use crate::error::{AmbitError, Result};
use crate::session::{Session, SessionMultiplexer};
use crate::value::{DbType, Value};

static NEXT_UNIT: AtomicU64 = AtomicU64::new(1);

/// When a unit's transaction takes the write lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Begin {
    /// On the first write; reads share the store until then.
    Deferred,
    /// Right away, waiting for other writers to finish first.
    Immediate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Active,
    Completed,
    Committed,
    RolledBack,
}

pub struct UnitOfWork {
    id: u64,
    origin: String,
    connection: RefCell<Option<Rc<Connection>>>,
    transactional: bool,
    state: Cell<UnitState>,
    context: RefCell<Option<Rc<dyn Any>>>,
    default_timeout: Duration,
    savepoints: Cell<u32>,
}

impl UnitOfWork {
    /// Takes ownership of `connection`, beginning a deferred transaction when `transactional`.
    pub fn open(
        connection: Connection,
        origin: impl Into<String>,
        transactional: bool,
        default_timeout: Duration,
    ) -> Result<Self> {
        Self::open_with(connection, origin, transactional.then_some(Begin::Deferred), default_timeout)
    }
    /// Takes ownership of `connection`, beginning a transaction of the given kind, if any.
    pub fn open_with(
        connection: Connection,
        origin: impl Into<String>,
        begin: Option<Begin>,
        default_timeout: Duration,
    ) -> Result<Self> {
        let transactional = begin.is_some();
        match begin {
            Some(Begin::Deferred) => connection.execute_batch("begin deferred")?,
            Some(Begin::Immediate) => connection.execute_batch("begin immediate")?,
            None => {}
        }
        let id = NEXT_UNIT.fetch_add(1, Ordering::Relaxed);
        debug!(unit = id, ?begin, "unit of work opened");
        Ok(Self {
            id,
            origin: origin.into(),
            connection: RefCell::new(Some(Rc::new(connection))),
            transactional,
            state: Cell::new(UnitState::Active),
            context: RefCell::new(None),
            default_timeout,
            savepoints: Cell::new(0),
        })
    }
    pub fn id(&self) -> u64 {
        self.id
    }
    /// Identifies the database the connection was opened against.
    pub fn origin(&self) -> &str {
        &self.origin
    }
    pub fn state(&self) -> UnitState {
        self.state.get()
    }
    pub fn is_transactional(&self) -> bool {
        self.transactional
    }
    pub fn is_completed(&self) -> bool {
        self.state.get() == UnitState::Completed
    }
    pub fn is_released(&self) -> bool {
        matches!(self.state.get(), UnitState::Committed | UnitState::RolledBack)
    }
    /// Marks the unit successful; the transaction commits on release.
    pub fn complete(&self) {
        if self.state.get() == UnitState::Active {
            self.state.set(UnitState::Completed);
        }
    }
    /// Ends the transaction and closes the connection. Idempotent.
    pub fn release(&self) -> Result<()> {
        let Some(connection) = self.connection.borrow_mut().take() else {
            return Ok(());
        };
        // drop sessions before the connection goes away
        self.context.borrow_mut().take();
        let commit = self.state.get() == UnitState::Completed;
        let outcome = if !self.transactional || connection.is_autocommit() {
            Ok(())
        } else if commit {
            connection.execute_batch("commit")
        } else {
            connection.execute_batch("rollback")
        };
        self.state.set(if commit && outcome.is_ok() { UnitState::Committed } else { UnitState::RolledBack });
        debug!(unit = self.id, committed = commit && outcome.is_ok(), "unit of work released");
        if outcome.is_err() && commit {
            // a failed commit leaves the transaction open; make sure nothing half-done survives
            let _ = connection.execute_batch("rollback");
        }
        outcome.map_err(AmbitError::from)
    }
    /// The live connection, or `Released` once the unit has ended.
    pub fn connection(&self) -> Result<Rc<Connection>> {
        self.connection.borrow().clone().ok_or(AmbitError::Released(self.id))
    }
    pub fn link(&self) -> ConnectionLink {
        let connection = self.connection.borrow().as_ref().map(Rc::downgrade).unwrap_or_default();
        ConnectionLink { unit: self.id, connection, default_timeout: self.default_timeout }
    }

    // ------------- Context slot -------------
    pub fn context(&self) -> Option<Rc<dyn Any>> {
        self.context.borrow().clone()
    }
    /// Installs an arbitrary context object. Replacing an existing one is refused.
    pub fn set_context(&self, context: Rc<dyn Any>) -> Result<()> {
        if self.is_released() {
            return Err(AmbitError::Released(self.id));
        }
        let mut slot = self.context.borrow_mut();
        if slot.is_some() {
            return Err(AmbitError::Configuration(format!("unit of work {} already carries a context", self.id)));
        }
        *slot = Some(context);
        Ok(())
    }
    /// The session of type `S` bound to this unit; see [`SessionMultiplexer`].
    pub fn session<S: Session>(&self) -> Result<Rc<S>> {
        SessionMultiplexer::get_session::<S>(self)
    }

    // ------------- Driver surface -------------
    #[allow(clippy::too_many_arguments)]
    pub fn create_parameter(
        &self,
        direction: Direction,
        db_type: DbType,
        size: Option<u32>,
        precision: Option<u8>,
        scale: Option<u8>,
        nullable: bool,
        name: &str,
        value: Value,
    ) -> Parameter {
        let value = if direction.is_input() { value } else { Value::Null };
        Parameter { name: name.to_string(), direction, db_type, size, precision, scale, nullable, value }
    }
    pub fn execute_non_query(&self, command: &mut Command) -> Result<i64> {
        let connection = self.connection()?;
        Executor::new(&connection, self.default_timeout).non_query(command)
    }
    pub fn execute_scalar(&self, command: &mut Command) -> Result<Value> {
        let connection = self.connection()?;
        Executor::new(&connection, self.default_timeout).scalar(command)
    }
    pub fn execute_reader(&self, command: &mut Command) -> Result<DataTable> {
        let connection = self.connection()?;
        Executor::new(&connection, self.default_timeout).reader(command)
    }
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        Ok(self.connection()?.execute_batch(sql)?)
    }

    /// Runs `work` inside a savepoint: everything it wrote is undone if it fails.
    pub fn atomically<T>(&self, work: impl FnOnce() -> Result<T>) -> Result<T> {
        let connection = self.connection()?;
        let depth = self.savepoints.get() + 1;
        let name = format!("ambit_{}_{}", self.id, depth);
        connection.execute_batch(&format!("savepoint {name}"))?;
        self.savepoints.set(depth);
        let result = work();
        self.savepoints.set(depth - 1);
        match &result {
            Ok(_) => connection.execute_batch(&format!("release {name}"))?,
            Err(_) => connection.execute_batch(&format!("rollback to {name}; release {name}"))?,
        }
        result
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(unit = self.id, error = %e, "unit of work release failed");
        }
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .field("state", &self.state.get())
            .finish()
    }
}

/// A weak handle on a unit's connection.
#[derive(Clone, Debug)]
pub struct ConnectionLink {
    unit: u64,
    connection: Weak<Connection>,
    default_timeout: Duration,
}

impl ConnectionLink {
    pub fn unit(&self) -> u64 {
        self.unit
    }
    pub fn is_alive(&self) -> bool {
        self.connection.strong_count() > 0
    }
    pub fn connection(&self) -> Result<Rc<Connection>> {
        self.connection.upgrade().ok_or(AmbitError::Released(self.unit))
    }
    pub fn execute_non_query(&self, command: &mut Command) -> Result<i64> {
        let connection = self.connection()?;
        Executor::new(&connection, self.default_timeout).non_query(command)
    }
    pub fn execute_reader(&self, command: &mut Command) -> Result<DataTable> {
        let connection = self.connection()?;
        Executor::new(&connection, self.default_timeout).reader(command)
    }
}
