//! Ambit – ambient units of work, session multiplexing, repositories and
//! declarative command dispatch over SQLite.
//!
//! Everything hangs off one idea: an *ambient* [`UnitOfWork`] per thread.
//! The first operation that needs the database opens a unit and owns it;
//! every operation it calls along the way joins that same unit, sharing its
//! connection and transaction. Only the owner may complete and release it.
//!
//! ## Modules
//! * [`unit_of_work`] – The [`UnitOfWork`] itself: one connection, an optional
//!   transaction, a context slot and thin command execution helpers.
//! * [`scope`] – Join-or-create resolution of the ambient unit ([`Scope`]).
//! * [`database`] – The [`Database`] handle: settings, connections, the mapping
//!   store and the contract registry.
//! * [`session`] – The [`session::SessionMultiplexer`] that hands out one data
//!   context per type per unit, and the change-tracking [`session::DataContext`].
//! * [`repository`] – The save/discard/find/load/fill protocol with hooks and
//!   write-conflict handling.
//! * [`mapping`] and [`mapped`] – JSON mapping documents and the repository
//!   that runs them.
//! * [`dispatch`] – Contracts whose methods are bound to commands and executed
//!   by the [`dispatch::Dispatcher`].
//! * [`command`], [`value`], [`filter`], [`cursor`] – Commands and parameters,
//!   typed values, row filters and lazy result sequences.
//! * [`config`] and [`error`] – [`Settings`] plus the [`AmbitError`] taxonomy.
//!
//! ## Quick Start
//! ```
//! use ambit::{Database, Filter, Repository};
//! use ambit::value::Value;
//!
//! let db = Database::in_memory().unwrap();
//! db.execute_batch("create table note (id integer primary key, body text not null, version integer)").unwrap();
//!
//! #[derive(Debug, Clone, Default, PartialEq)]
//! struct Note { id: Option<i64>, body: String, version: Option<i64> }
//! ambit::entity!(Note as "note" => { id, body, version });
//! impl ambit::session::Record for Note {
//!     const TABLE: &'static str = "note";
//!     const KEY: &'static str = "id";
//!     const VERSION: Option<&'static str> = Some("version");
//! }
//!
//! #[derive(Debug, Clone, Default)]
//! struct NoteModel { id: Option<i64>, body: String, version: Option<i64> }
//! impl ambit::Model for NoteModel {
//!     fn is_new(&self) -> bool { self.id.is_none() }
//!     fn set_new(&mut self, _: bool) {}
//! }
//!
//! let notes: Repository<NoteModel, Note> = Repository::new(
//!     db,
//!     |m: &NoteModel| Filter::eq("id", m.id),
//!     |m: &NoteModel, r: &mut Note| { r.id = m.id; r.body = m.body.clone(); r.version = m.version; },
//!     |r: &Note, m: &mut NoteModel| { m.id = r.id; m.body = r.body.clone(); m.version = r.version; },
//! );
//! let mut note = NoteModel { body: "hello".into(), ..NoteModel::default() };
//! assert!(notes.save(&mut note).unwrap());
//! assert_eq!(note.id, Some(1));
//! let found = notes.find(&Filter::value("body", Value::Text("hello".into()))).unwrap();
//! assert_eq!(found.into_vec().unwrap().len(), 1);
//! ```

pub mod command;
pub mod config;
pub mod cursor;
pub mod database;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod mapped;
pub mod mapping;
pub mod model;
pub mod repository;
pub mod scope;
pub mod session;
pub mod unit_of_work;
pub mod value;

pub use crate::config::{PersistenceMode, Settings};
pub use crate::cursor::Found;
pub use crate::database::Database;
pub use crate::dispatch::Dispatcher;
pub use crate::error::{AmbitError, Result};
pub use crate::filter::Filter;
pub use crate::mapped::MappedRepository;
pub use crate::model::{Audit, AuditStamp, Entity, Model};
pub use crate::repository::{NoHooks, Repository, RepositoryHooks};
pub use crate::scope::Scope;
pub use crate::session::{DataContext, SessionMultiplexer};
pub use crate::unit_of_work::UnitOfWork;
