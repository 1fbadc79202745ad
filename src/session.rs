//! Typed sessions sharing one unit of work.
//!
//! A [`SessionMultiplexer`] lives in the context slot of a [`UnitOfWork`] and
//! caches at most one session per session type, so any number of distinctly
//! typed sessions run on the unit's single connection and transaction.
//!
//! [`DataContext`] is the session the repositories use: it reads rows of a
//! [`Record`] type, tracks the ones handed out, and writes pending inserts,
//! updates and deletes in one atomic submit that detects write conflicts.

use std::any::{Any, TypeId};
use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::marker::PhantomData;
use std::rc::Rc;

// we will use a fast hashing algo for the session cache
use seahash::SeaHasher;

use tracing::{debug, warn};

use crate::command::{Command, DataTable, quote_ident};
use crate::cursor::Cursor;
use crate::error::{AmbitError, Result};
use crate::filter::Filter;
use crate::model::Entity;
use crate::unit_of_work::{ConnectionLink, UnitOfWork};
use crate::value::Value;

pub type SessionHasher = BuildHasherDefault<SeaHasher>;

/// A typed data-access handle bound to one unit of work.
pub trait Session: Any + Sized {
    fn open(link: &ConnectionLink) -> Result<Self>;
}

/// Caches one session per session type for the unit of work it is attached to.
#[derive(Default)]
pub struct SessionMultiplexer {
    sessions: RefCell<HashMap<TypeId, Rc<dyn Any>, SessionHasher>>,
}

impl SessionMultiplexer {
    /// Returns the unit's session of type `S`, opening and caching it on first use.
    pub fn get_session<S: Session>(unit: &UnitOfWork) -> Result<Rc<S>> {
        let context = match unit.context() {
            Some(context) => context,
            None => {
                let multiplexer: Rc<dyn Any> = Rc::new(SessionMultiplexer::default());
                unit.set_context(Rc::clone(&multiplexer))?;
                multiplexer
            }
        };
        let multiplexer = context.downcast::<SessionMultiplexer>().map_err(|_| {
            AmbitError::Configuration(format!(
                "unit of work {} carries a context that is not a session multiplexer",
                unit.id()
            ))
        })?;
        let cached = multiplexer.sessions.borrow().get(&TypeId::of::<S>()).cloned();
        if let Some(session) = cached {
            return session
                .downcast::<S>()
                .map_err(|_| AmbitError::Configuration("session cache holds a mistyped entry".into()));
        }
        let session = Rc::new(S::open(&unit.link())?);
        debug!(unit = unit.id(), session = std::any::type_name::<S>(), "session opened");
        multiplexer.sessions.borrow_mut().insert(TypeId::of::<S>(), Rc::clone(&session) as Rc<dyn Any>);
        Ok(session)
    }
    pub fn len(&self) -> usize {
        self.sessions.borrow().len()
    }
    pub fn is_empty(&self) -> bool {
        self.sessions.borrow().is_empty()
    }
    pub fn contains<S: Session>(&self) -> bool {
        self.sessions.borrow().contains_key(&TypeId::of::<S>())
    }
}

// ------------- Records -------------

/// A row type a [`DataContext`] can read and write.
///
/// `KEY` names an integer key column the database generates when the key is
/// null on insert. With a `VERSION` column, updates and deletes check the
/// version the row carries and updates bump it; without one, every column must
/// still hold the value it was read with.
pub trait Record: Entity + Default + Clone + 'static {
    const TABLE: &'static str;
    const KEY: &'static str;
    const VERSION: Option<&'static str> = None;
}

/// Which schema a data context reads and writes.
pub trait ContextKind: 'static {
    const SCHEMA: &'static str;
}

pub struct MainContext;
impl ContextKind for MainContext {
    const SCHEMA: &'static str = "main";
}

/// Connection-private tables; only the unit of work that created them sees them.
pub struct TempContext;
impl ContextKind for TempContext {
    const SCHEMA: &'static str = "temp";
}

/// A row handed out by a data context, with the values it was read with.
#[derive(Debug)]
pub struct Tracked<R> {
    current: RefCell<R>,
    original: RefCell<R>,
}

impl<R: Clone> Tracked<R> {
    fn new(row: R) -> Rc<Self> {
        Rc::new(Self { original: RefCell::new(row.clone()), current: RefCell::new(row) })
    }
    pub fn get(&self) -> Ref<'_, R> {
        self.current.borrow()
    }
    pub fn get_mut(&self) -> RefMut<'_, R> {
        self.current.borrow_mut()
    }
    pub fn original(&self) -> Ref<'_, R> {
        self.original.borrow()
    }
    pub fn snapshot(&self) -> R {
        self.current.borrow().clone()
    }
    fn accept(&self) {
        let current = self.current.borrow().clone();
        *self.original.borrow_mut() = current;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictMode {
    /// Stop at the first conflicting change.
    FailOnFirstConflict,
    /// Attempt every change and report all conflicts; nothing is kept if any occurred.
    ContinueOnConflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

trait PendingChange {
    fn kind(&self) -> ChangeKind;
    fn apply(&self, link: &ConnectionLink, schema: &str) -> Result<()>;
    fn accept(&self);
}

struct Change<R: Record> {
    kind: ChangeKind,
    row: Rc<Tracked<R>>,
}

impl<R: Record> Change<R> {
    fn insert(&self, link: &ConnectionLink, table: &str) -> Result<()> {
        let mut command = Command::new("");
        let mut columns = Vec::new();
        let mut names = Vec::new();
        {
            let row = self.row.get();
            for (i, property) in R::properties().iter().enumerate() {
                let mut value = row.property(property)?;
                if *property == R::KEY && value == Value::Null {
                    continue;
                }
                if Some(*property) == R::VERSION {
                    value = Value::Integer(1);
                }
                let name = format!(":c{i}");
                columns.push(quote_ident(property));
                names.push(name.clone());
                command = command.bind(name, value);
            }
        }
        command.text = if columns.is_empty() {
            format!("insert into {table} default values returning *")
        } else {
            format!("insert into {table} ({}) values ({}) returning *", columns.join(", "), names.join(", "))
        };
        let written = link.execute_reader(&mut command)?;
        self.refresh(&written)
    }

    fn update(&self, link: &ConnectionLink, table: &str) -> Result<()> {
        let mut command = Command::new("");
        let mut assignments = Vec::new();
        {
            let row = self.row.get();
            for (i, property) in R::properties().iter().enumerate() {
                if *property == R::KEY || Some(*property) == R::VERSION {
                    continue;
                }
                let name = format!(":c{i}");
                assignments.push(format!("{} = {name}", quote_ident(property)));
                command = command.bind(name, row.property(property)?);
            }
        }
        if let Some(version) = R::VERSION {
            assignments.push(format!("{0} = coalesce({0}, 0) + 1", quote_ident(version)));
        }
        if assignments.is_empty() {
            // nothing to write, but the row must still be there as it was read
            assignments.push(format!("{0} = {0}", quote_ident(R::KEY)));
        }
        let (predicate, command) = self.expected_state(command)?;
        let mut command = command;
        command.text = format!("update {table} set {} where {predicate} returning *", assignments.join(", "));
        let written = link.execute_reader(&mut command)?;
        if written.is_empty() {
            return Err(self.conflict());
        }
        self.refresh(&written)
    }

    fn delete(&self, link: &ConnectionLink, table: &str) -> Result<()> {
        let (predicate, mut command) = self.expected_state(Command::new(""))?;
        command.text = format!("delete from {table} where {predicate}");
        if link.execute_non_query(&mut command)? == 0 {
            return Err(self.conflict());
        }
        Ok(())
    }

    /// The `where` clause that only matches the row in the state the caller expects.
    fn expected_state(&self, mut command: Command) -> Result<(String, Command)> {
        let original = self.row.original();
        let mut predicate = vec![format!("{} = :k", quote_ident(R::KEY))];
        command = command.bind(":k", original.property(R::KEY)?);
        match R::VERSION {
            // the version the caller carries, which may be older than what was read
            Some(version) => {
                predicate.push(format!("{} is :v", quote_ident(version)));
                command = command.bind(":v", self.row.get().property(version)?);
            }
            None => {
                for (i, property) in R::properties().iter().enumerate() {
                    if *property == R::KEY {
                        continue;
                    }
                    let name = format!(":o{i}");
                    predicate.push(format!("{} is {name}", quote_ident(property)));
                    command = command.bind(name, original.property(property)?);
                }
            }
        }
        Ok((predicate.join(" and "), command))
    }

    fn refresh(&self, written: &DataTable) -> Result<()> {
        let Some(values) = written.rows.first() else {
            return Err(self.conflict());
        };
        let mut row = self.row.get_mut();
        for (column, value) in written.columns.iter().zip(values) {
            if let Some(property) = R::resolve_property(column) {
                row.set_property(property, value)?;
            }
        }
        Ok(())
    }

    fn conflict(&self) -> AmbitError {
        let key = self.row.original().property(R::KEY).unwrap_or(Value::Null);
        AmbitError::Conflict(format!(
            "{} row {:?} was changed or removed since it was read",
            R::TABLE,
            key
        ))
    }
}

impl<R: Record> PendingChange for Change<R> {
    fn kind(&self) -> ChangeKind {
        self.kind
    }
    fn apply(&self, link: &ConnectionLink, schema: &str) -> Result<()> {
        let table = format!("{}.{}", quote_ident(schema), quote_ident(R::TABLE));
        match self.kind {
            ChangeKind::Insert => self.insert(link, &table),
            ChangeKind::Update => self.update(link, &table),
            ChangeKind::Delete => self.delete(link, &table),
        }
    }
    fn accept(&self) {
        self.row.accept();
    }
}

// ------------- Data context -------------

/// Row-level session over the tables of one schema.
pub struct DataContext<K: ContextKind = MainContext> {
    link: ConnectionLink,
    pending: RefCell<Vec<Box<dyn PendingChange>>>,
    _kind: PhantomData<K>,
}

impl<K: ContextKind> Session for DataContext<K> {
    fn open(link: &ConnectionLink) -> Result<Self> {
        Ok(Self { link: link.clone(), pending: RefCell::new(Vec::new()), _kind: PhantomData })
    }
}

impl<K: ContextKind> DataContext<K> {
    pub fn link(&self) -> &ConnectionLink {
        &self.link
    }
    pub fn schema(&self) -> &'static str {
        K::SCHEMA
    }

    fn select_command<R: Record>(&self, filter: &Filter, limit: Option<usize>) -> Result<Command> {
        let (predicate, parameters) = filter.render(R::properties())?;
        let mut text = format!(
            "select * from {}.{} where {predicate} order by {}",
            quote_ident(K::SCHEMA),
            quote_ident(R::TABLE),
            quote_ident(R::KEY)
        );
        if let Some(limit) = limit {
            text.push_str(&format!(" limit {limit}"));
        }
        let mut command = Command::new(text);
        command.parameters = parameters;
        Ok(command)
    }

    pub fn select<R: Record>(&self, filter: &Filter) -> Result<Vec<Rc<Tracked<R>>>> {
        self.select_limit(filter, None)
    }
    pub fn select_limit<R: Record>(&self, filter: &Filter, limit: Option<usize>) -> Result<Vec<Rc<Tracked<R>>>> {
        let mut command = self.select_command::<R>(filter, limit)?;
        let table = self.link.execute_reader(&mut command)?;
        let columns = &table.columns;
        table
            .rows
            .into_iter()
            .map(|values| materialize::<R>(columns, values).map(Tracked::new))
            .collect()
    }
    /// Exactly one row, or `NotFound` / `Cardinality`.
    pub fn single<R: Record>(&self, filter: &Filter) -> Result<Rc<Tracked<R>>> {
        let mut rows = self.select::<R>(filter)?;
        match rows.len() {
            0 => Err(AmbitError::NotFound(format!("no {} row matches {filter:?}", R::TABLE))),
            1 => Ok(rows.remove(0)),
            found => Err(AmbitError::Cardinality { origin: R::TABLE.to_string(), found }),
        }
    }
    pub fn count<R: Record>(&self, filter: &Filter) -> Result<i64> {
        let (predicate, parameters) = filter.render(R::properties())?;
        let mut command = Command::new(format!(
            "select count(*) as n from {}.{} where {predicate}",
            quote_ident(K::SCHEMA),
            quote_ident(R::TABLE)
        ));
        command.parameters = parameters;
        let table = self.link.execute_reader(&mut command)?;
        table.get(0, "n")
    }
    /// A lazy read paged by the record key; see [`Cursor`].
    pub fn cursor<R: Record>(&self, filter: &Filter, page_size: usize) -> Result<Cursor<Rc<Tracked<R>>>> {
        let (predicate, parameters) = filter.render(R::properties())?;
        let mut command = Command::new(format!(
            "select * from {}.{} where {predicate}",
            quote_ident(K::SCHEMA),
            quote_ident(R::TABLE)
        ));
        command.parameters = parameters;
        Ok(Cursor::keyset(self.link.clone(), command, R::KEY, page_size, |columns, values| {
            materialize::<R>(columns, values).map(Tracked::new)
        }))
    }

    pub fn insert_on_submit<R: Record>(&self, row: R) -> Rc<Tracked<R>> {
        let tracked = Tracked::new(row);
        self.register(ChangeKind::Insert, &tracked);
        tracked
    }
    pub fn update_on_submit<R: Record>(&self, row: &Rc<Tracked<R>>) {
        self.register(ChangeKind::Update, row);
    }
    pub fn delete_on_submit<R: Record>(&self, row: &Rc<Tracked<R>>) {
        self.register(ChangeKind::Delete, row);
    }
    fn register<R: Record>(&self, kind: ChangeKind, row: &Rc<Tracked<R>>) {
        self.pending.borrow_mut().push(Box::new(Change { kind, row: Rc::clone(row) }));
    }
    pub fn pending(&self) -> usize {
        self.pending.borrow().len()
    }
    pub fn pending_kinds(&self) -> Vec<ChangeKind> {
        self.pending.borrow().iter().map(|c| c.kind()).collect()
    }
    pub fn discard_changes(&self) {
        self.pending.borrow_mut().clear();
    }

    /// Writes every pending change atomically. A conflict undoes the whole
    /// submit and surfaces as [`AmbitError::Conflict`]. Pending changes are
    /// consumed either way.
    pub fn submit_changes(&self, mode: ConflictMode) -> Result<usize> {
        let changes: Vec<Box<dyn PendingChange>> = self.pending.borrow_mut().drain(..).collect();
        if changes.is_empty() {
            return Ok(0);
        }
        let connection = self.link.connection()?;
        connection.execute_batch("savepoint ambit_submit")?;
        let mut conflicts = Vec::new();
        for change in &changes {
            match change.apply(&self.link, K::SCHEMA) {
                Ok(()) => {}
                Err(e) if e.is_conflict() => {
                    conflicts.push(e.to_string());
                    if mode == ConflictMode::FailOnFirstConflict {
                        break;
                    }
                }
                Err(e) => {
                    connection.execute_batch("rollback to ambit_submit; release ambit_submit")?;
                    return Err(e);
                }
            }
        }
        if !conflicts.is_empty() {
            connection.execute_batch("rollback to ambit_submit; release ambit_submit")?;
            warn!(unit = self.link.unit(), conflicts = conflicts.len(), "submit rolled back on conflict");
            return Err(AmbitError::Conflict(conflicts.join("; ")));
        }
        connection.execute_batch("release ambit_submit")?;
        for change in &changes {
            change.accept();
        }
        debug!(unit = self.link.unit(), changes = changes.len(), "changes submitted");
        Ok(changes.len())
    }
}

/// Builds a record from a result row, ignoring columns it has no property for.
pub fn materialize<R: Record>(columns: &[String], values: Vec<Value>) -> Result<R> {
    let mut row = R::default();
    for (column, value) in columns.iter().zip(values) {
        if let Some(property) = R::resolve_property(column) {
            row.set_property(property, &value)?;
        }
    }
    Ok(row)
}
