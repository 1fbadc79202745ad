//! The repository protocol: save, discard, find, load and fill.
//!
//! A [`Repository`] maps between a model `M` and a row `R` with injected
//! closures and drives one lifecycle for every model type:
//!
//! * every operation has an ambient form and an `_in` form taking an explicit
//!   unit of work; the ambient form joins the current unit when there is one
//!   and otherwise owns a unit for the duration of the call,
//! * models are marked before every write and their new flag only ever
//!   changes on success,
//! * a write conflict is reported through a hook and a `false` return, with
//!   the model restored to its state before the call,
//! * `find` results are lazy inside an ambient unit and drained otherwise.
//!
//! ```
//! use ambit::{Database, Filter, Repository};
//! use ambit::model::Model;
//! use ambit::session::Record;
//!
//! #[derive(Debug, Default, Clone)]
//! struct Tag { id: Option<i64>, label: String }
//! ambit::entity!(Tag { id, label });
//! impl Record for Tag {
//!     const TABLE: &'static str = "tag";
//!     const KEY: &'static str = "id";
//! }
//!
//! #[derive(Debug, Default, Clone)]
//! struct TagModel { id: Option<i64>, label: String }
//! impl Model for TagModel {
//!     fn is_new(&self) -> bool { self.id.is_none() }
//!     fn set_new(&mut self, _: bool) {}
//! }
//!
//! let db = Database::in_memory().unwrap();
//! db.execute_batch("create table tag (id integer primary key, label text)").unwrap();
//! let tags: Repository<TagModel, Tag> = Repository::new(
//!     db,
//!     |m: &TagModel| Filter::eq("id", m.id),
//!     |m: &TagModel, r: &mut Tag| r.label = m.label.clone(),
//!     |r: &Tag, m: &mut TagModel| { m.id = r.id; m.label = r.label.clone(); },
//! );
//! let mut tag = TagModel { label: "urgent".into(), ..TagModel::default() };
//! assert!(tags.save(&mut tag).unwrap());
//! assert_eq!(tag.id, Some(1));
//! ```

use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cursor::Found;
use crate::database::Database;
use crate::error::{AmbitError, Result};
use crate::filter::Filter;
use crate::model::Model;
use crate::session::{ConflictMode, ContextKind, DataContext, MainContext, Record};
use crate::unit_of_work::UnitOfWork;

/// Lifecycle callbacks shared by every repository of a model type.
///
/// Pre hooks can veto the operation by returning an error; it propagates and
/// the model is restored.
pub trait RepositoryHooks<M>: Send + Sync {
    fn on_pre_insert(&self, _model: &mut M) -> Result<()> {
        Ok(())
    }
    fn on_post_insert(&self, _model: &M) {}
    fn on_pre_update(&self, _model: &mut M) -> Result<()> {
        Ok(())
    }
    fn on_post_update(&self, _model: &M) {}
    fn on_pre_delete(&self, _model: &M) -> Result<()> {
        Ok(())
    }
    fn on_post_delete(&self, _model: &M) {}
    /// Called for every model a read produces, before the caller sees it.
    fn on_select(&self, _model: &mut M) {}
    fn on_save_conflict(&self, _model: &M, _conflict: &AmbitError) {}
    fn on_discard_conflict(&self, _model: &M, _conflict: &AmbitError) {}
}

pub struct NoHooks;
impl<M> RepositoryHooks<M> for NoHooks {}

type Matcher<M> = Arc<dyn Fn(&M) -> Filter + Send + Sync>;
type ToRow<M, R> = Arc<dyn Fn(&M, &mut R) + Send + Sync>;
type ToModel<R, M> = Arc<dyn Fn(&R, &mut M) + Send + Sync>;

pub struct Repository<M, R, K = MainContext> {
    database: Database,
    matcher: Matcher<M>,
    to_row: ToRow<M, R>,
    to_model: ToModel<R, M>,
    hooks: Arc<dyn RepositoryHooks<M>>,
    _context: PhantomData<fn() -> K>,
}

impl<M, R, K> Clone for Repository<M, R, K> {
    fn clone(&self) -> Self {
        Self {
            database: self.database.clone(),
            matcher: Arc::clone(&self.matcher),
            to_row: Arc::clone(&self.to_row),
            to_model: Arc::clone(&self.to_model),
            hooks: Arc::clone(&self.hooks),
            _context: PhantomData,
        }
    }
}

impl<M, R, K> Repository<M, R, K>
where
    M: Model + Default + 'static,
    R: Record,
    K: ContextKind,
{
    /// `matcher` resolves the one row a persisted model lives in, `to_row`
    /// copies caller changes onto a row and `to_model` reflects a row,
    /// including generated values, back onto a model.
    pub fn new(
        database: Database,
        matcher: impl Fn(&M) -> Filter + Send + Sync + 'static,
        to_row: impl Fn(&M, &mut R) + Send + Sync + 'static,
        to_model: impl Fn(&R, &mut M) + Send + Sync + 'static,
    ) -> Self {
        Self {
            database,
            matcher: Arc::new(matcher),
            to_row: Arc::new(to_row),
            to_model: Arc::new(to_model),
            hooks: Arc::new(NoHooks),
            _context: PhantomData,
        }
    }
    pub fn with_hooks(mut self, hooks: impl RepositoryHooks<M> + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }
    pub fn with_matcher(mut self, matcher: impl Fn(&M) -> Filter + Send + Sync + 'static) -> Self {
        self.matcher = Arc::new(matcher);
        self
    }
    pub fn database(&self) -> &Database {
        &self.database
    }

    fn context(&self, unit: &UnitOfWork) -> Result<Rc<DataContext<K>>> {
        self.database.ensure_owns(unit)?;
        unit.session::<DataContext<K>>()
    }

    // ------------- Save -------------
    pub fn save(&self, model: &mut M) -> Result<bool> {
        let before = model.clone();
        let scope = self.database.write_scope()?;
        let saved = self.save_in(&scope, model)?;
        scope.complete();
        if let Err(e) = scope.close() {
            *model = before;
            return Err(e);
        }
        Ok(saved)
    }

    /// Inserts a new model or updates the row of a persisted one.
    pub fn save_in(&self, unit: &UnitOfWork, model: &mut M) -> Result<bool> {
        let before = model.clone();
        match self.write_save(unit, model) {
            Ok(()) => Ok(true),
            Err(e) => {
                *model = before;
                if !e.is_conflict() {
                    return Err(e);
                }
                warn!(unit = unit.id(), table = R::TABLE, error = %e, "save lost a write conflict");
                self.hooks.on_save_conflict(model, &e);
                Ok(false)
            }
        }
    }

    fn write_save(&self, unit: &UnitOfWork, model: &mut M) -> Result<()> {
        let context = self.context(unit)?;
        model.mark(&self.database.stamp());
        let inserting = model.is_new();
        let row = if inserting {
            self.hooks.on_pre_insert(model)?;
            let mut row = R::default();
            (self.to_row)(model, &mut row);
            context.insert_on_submit(row)
        } else {
            self.hooks.on_pre_update(model)?;
            let row = context.single::<R>(&(self.matcher)(model))?;
            (self.to_row)(model, &mut *row.get_mut());
            context.update_on_submit(&row);
            row
        };
        context.submit_changes(ConflictMode::FailOnFirstConflict)?;
        (self.to_model)(&*row.get(), model);
        if inserting {
            self.hooks.on_post_insert(model);
        } else {
            self.hooks.on_post_update(model);
        }
        model.set_new(false);
        debug!(unit = unit.id(), table = R::TABLE, inserted = inserting, "saved");
        Ok(())
    }

    // ------------- Discard -------------
    pub fn discard(&self, model: &mut M) -> Result<bool> {
        if model.is_new() {
            return Ok(true);
        }
        let before = model.clone();
        let scope = self.database.write_scope()?;
        let discarded = self.discard_in(&scope, model)?;
        scope.complete();
        if let Err(e) = scope.close() {
            *model = before;
            return Err(e);
        }
        Ok(discarded)
    }

    /// Deletes the row of a persisted model; `false` if there is none.
    pub fn discard_in(&self, unit: &UnitOfWork, model: &mut M) -> Result<bool> {
        if model.is_new() {
            return Ok(true);
        }
        let before = model.clone();
        match self.write_discard(unit, model) {
            Ok(true) => Ok(true),
            Ok(false) => {
                *model = before;
                Ok(false)
            }
            Err(e) => {
                *model = before;
                if !e.is_conflict() {
                    return Err(e);
                }
                warn!(unit = unit.id(), table = R::TABLE, error = %e, "discard lost a write conflict");
                self.hooks.on_discard_conflict(model, &e);
                Ok(false)
            }
        }
    }

    fn write_discard(&self, unit: &UnitOfWork, model: &mut M) -> Result<bool> {
        let context = self.context(unit)?;
        model.mark(&self.database.stamp());
        let mut rows = context.select::<R>(&(self.matcher)(model))?;
        let row = match rows.len() {
            0 => return Ok(false),
            1 => rows.remove(0),
            found => return Err(AmbitError::Cardinality { origin: R::TABLE.to_string(), found }),
        };
        self.hooks.on_pre_delete(model)?;
        // carries the caller's concurrency token onto the row
        (self.to_row)(model, &mut *row.get_mut());
        context.delete_on_submit(&row);
        context.submit_changes(ConflictMode::FailOnFirstConflict)?;
        self.hooks.on_post_delete(model);
        model.set_new(false);
        debug!(unit = unit.id(), table = R::TABLE, "discarded");
        Ok(true)
    }

    // ------------- Find -------------
    /// Every model matching `filter`; drained when this call owns the unit of work.
    pub fn find(&self, filter: &Filter) -> Result<Found<M>> {
        let to_model = Arc::clone(&self.to_model);
        self.find_projected(filter, move |row: &R| project(&*to_model, row))
    }
    pub fn find_in(&self, unit: &UnitOfWork, filter: &Filter) -> Result<Found<M>> {
        let to_model = Arc::clone(&self.to_model);
        self.find_projected_in(unit, filter, move |row: &R| project(&*to_model, row))
    }
    pub fn find_projected(&self, filter: &Filter, projector: impl Fn(&R) -> M + 'static) -> Result<Found<M>> {
        let scope = self.database.scope()?;
        let found = self.find_projected_in(&scope, filter, projector)?;
        if !scope.is_owner() {
            return Ok(found);
        }
        // the unit is about to go away; nothing may read through it afterwards
        let found = found.drained()?;
        scope.complete();
        scope.close()?;
        Ok(found)
    }
    /// A lazy sequence read through `unit`; it fails once `unit` is released.
    pub fn find_projected_in(
        &self,
        unit: &UnitOfWork,
        filter: &Filter,
        projector: impl Fn(&R) -> M + 'static,
    ) -> Result<Found<M>> {
        let context = self.context(unit)?;
        let cursor = context.cursor::<R>(filter, self.database.settings().fetch_size)?;
        let hooks = Arc::clone(&self.hooks);
        let models = cursor.map(move |row| {
            let row = row?;
            let mut model = projector(&*row.get());
            model.set_new(false);
            hooks.on_select(&mut model);
            Ok(model)
        });
        Ok(Found::Lazy(Box::new(models)))
    }

    // ------------- Load / Fill -------------
    /// Exactly one model; zero rows is `NotFound`, several a `Cardinality` error.
    pub fn load(&self, filter: &Filter) -> Result<M> {
        let scope = self.database.scope()?;
        let model = self.load_in(&scope, filter)?;
        scope.complete();
        scope.close()?;
        Ok(model)
    }
    /// Loads the row `prototype` would be saved to.
    pub fn load_like(&self, prototype: &M) -> Result<M> {
        self.load(&(self.matcher)(prototype))
    }
    pub fn load_in(&self, unit: &UnitOfWork, filter: &Filter) -> Result<M> {
        let row = self.context(unit)?.single::<R>(filter)?;
        let mut model = M::default();
        (self.to_model)(&*row.get(), &mut model);
        model.set_new(false);
        self.hooks.on_select(&mut model);
        Ok(model)
    }
    /// Refreshes `model` in place from its row; `false` unless exactly one row matches.
    pub fn fill(&self, model: &mut M) -> Result<bool> {
        let scope = self.database.scope()?;
        let filled = self.fill_in(&scope, model)?;
        scope.complete();
        scope.close()?;
        Ok(filled)
    }
    pub fn fill_in(&self, unit: &UnitOfWork, model: &mut M) -> Result<bool> {
        let rows = self.context(unit)?.select_limit::<R>(&(self.matcher)(model), Some(2))?;
        let [row] = rows.as_slice() else {
            return Ok(false);
        };
        (self.to_model)(&*row.get(), model);
        model.set_new(false);
        self.hooks.on_select(model);
        Ok(true)
    }
}

fn project<R, M: Default>(to_model: &(dyn Fn(&R, &mut M) + Send + Sync), row: &R) -> M {
    let mut model = M::default();
    to_model(row, &mut model);
    model
}
