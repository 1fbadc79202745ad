//! A repository driven entirely by a mapping document.
//!
//! Where [`Repository`](crate::Repository) works on rows through closures,
//! [`MappedRepository`] runs the select, insert, update and delete commands
//! of the entity's [`MappingDocument`](crate::mapping::MappingDocument),
//! sourcing parameters from model properties and mapping results back the
//! same way. Updates and deletes that touch no row lost a race: the command
//! text decides what "the row as the caller saw it" means, typically by
//! matching a version column.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cursor::{Cursor, Found};
use crate::database::Database;
use crate::error::{AmbitError, Result};
use crate::mapping::{CommandKind, EntityMapping, bind_parameters, copy_outputs, map_row};
use crate::model::{Entity, Model};
use crate::repository::{NoHooks, RepositoryHooks};
use crate::unit_of_work::UnitOfWork;

pub struct MappedRepository<M> {
    database: Database,
    mapping: Arc<EntityMapping>,
    hooks: Arc<dyn RepositoryHooks<M>>,
}

impl<M> Clone for MappedRepository<M> {
    fn clone(&self) -> Self {
        Self { database: self.database.clone(), mapping: Arc::clone(&self.mapping), hooks: Arc::clone(&self.hooks) }
    }
}

impl<M> MappedRepository<M>
where
    M: Entity + Model + Default + 'static,
{
    /// Resolves the mapping of `M` through the database's mapping store.
    pub fn new(database: Database) -> Result<Self> {
        let mapping = database.mappings().get::<M>()?;
        Ok(Self { database, mapping, hooks: Arc::new(NoHooks) })
    }
    pub fn with_hooks(mut self, hooks: impl RepositoryHooks<M> + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }
    pub fn mapping(&self) -> &EntityMapping {
        &self.mapping
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
    pub fn save_in(&self, unit: &UnitOfWork, model: &mut M) -> Result<bool> {
        self.database.ensure_owns(unit)?;
        let before = model.clone();
        match self.write_save(unit, model) {
            Ok(()) => Ok(true),
            Err(e) => {
                *model = before;
                if !e.is_conflict() {
                    return Err(e);
                }
                warn!(unit = unit.id(), entity = M::TYPE_NAME, error = %e, "save lost a write conflict");
                self.hooks.on_save_conflict(model, &e);
                Ok(false)
            }
        }
    }
    fn write_save(&self, unit: &UnitOfWork, model: &mut M) -> Result<()> {
        model.mark(&self.database.stamp());
        let inserting = model.is_new();
        let kind = if inserting {
            self.hooks.on_pre_insert(model)?;
            CommandKind::Insert
        } else {
            self.hooks.on_pre_update(model)?;
            CommandKind::Update
        };
        let descriptor = self.mapping.command(kind)?;
        let mut command = bind_parameters(descriptor, model)?;
        unit.atomically(|| {
            let affected = unit.execute_non_query(&mut command)?;
            if affected == 0 {
                return Err(AmbitError::Conflict(format!(
                    "{kind:?} of {} affected no row",
                    M::TYPE_NAME
                )));
            }
            Ok(())
        })?;
        copy_outputs(descriptor, &command, model)?;
        if inserting {
            self.hooks.on_post_insert(model);
        } else {
            self.hooks.on_post_update(model);
        }
        model.set_new(false);
        debug!(unit = unit.id(), entity = M::TYPE_NAME, inserted = inserting, "saved");
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
    pub fn discard_in(&self, unit: &UnitOfWork, model: &mut M) -> Result<bool> {
        if model.is_new() {
            return Ok(true);
        }
        self.database.ensure_owns(unit)?;
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
                warn!(unit = unit.id(), entity = M::TYPE_NAME, error = %e, "discard lost a write conflict");
                self.hooks.on_discard_conflict(model, &e);
                Ok(false)
            }
        }
    }
    fn write_discard(&self, unit: &UnitOfWork, model: &mut M) -> Result<bool> {
        model.mark(&self.database.stamp());
        match self.matching_rows(unit, model)? {
            0 => return Ok(false),
            1 => {}
            found => return Err(AmbitError::Cardinality { origin: M::TYPE_NAME.to_string(), found }),
        }
        self.hooks.on_pre_delete(model)?;
        let descriptor = self.mapping.command(CommandKind::Delete)?;
        let mut command = bind_parameters(descriptor, model)?;
        unit.atomically(|| {
            if unit.execute_non_query(&mut command)? == 0 {
                return Err(AmbitError::Conflict(format!("delete of {} affected no row", M::TYPE_NAME)));
            }
            Ok(())
        })?;
        copy_outputs(descriptor, &command, model)?;
        self.hooks.on_post_delete(model);
        model.set_new(false);
        Ok(true)
    }
    fn matching_rows(&self, unit: &UnitOfWork, prototype: &M) -> Result<usize> {
        let descriptor = self.mapping.command(CommandKind::Select)?;
        let mut command = bind_parameters(descriptor, prototype)?;
        Ok(unit.execute_reader(&mut command)?.row_count())
    }

    // ------------- Find -------------
    /// Every model the select command returns for the parameters `prototype` supplies.
    pub fn find(&self, prototype: &M) -> Result<Found<M>> {
        let scope = self.database.scope()?;
        let found = self.find_in(&scope, prototype)?;
        if !scope.is_owner() {
            return Ok(found);
        }
        let found = found.drained()?;
        scope.complete();
        scope.close()?;
        Ok(found)
    }
    pub fn find_in(&self, unit: &UnitOfWork, prototype: &M) -> Result<Found<M>> {
        self.database.ensure_owns(unit)?;
        let descriptor = self.mapping.command(CommandKind::Select)?;
        let command = bind_parameters(descriptor, prototype)?;
        let mapping = Arc::clone(&self.mapping);
        let hooks = Arc::clone(&self.hooks);
        // arbitrary command text has no key to resume after, so it is read in one go
        let cursor = Cursor::whole(unit.link(), command, move |columns, values| {
            let descriptor = mapping.command(CommandKind::Select)?;
            let mut model = M::default();
            map_row(descriptor, columns, &values, &mut model)?;
            model.set_new(false);
            hooks.on_select(&mut model);
            Ok(model)
        });
        Ok(Found::Lazy(Box::new(cursor)))
    }

    // ------------- Load / Fill -------------
    pub fn load(&self, prototype: &M) -> Result<M> {
        let scope = self.database.scope()?;
        let model = self.load_in(&scope, prototype)?;
        scope.complete();
        scope.close()?;
        Ok(model)
    }
    /// Exactly one model; zero rows is `NotFound`, several a `Cardinality` error.
    pub fn load_in(&self, unit: &UnitOfWork, prototype: &M) -> Result<M> {
        let mut models = self.find_in(unit, prototype)?.into_vec()?;
        match models.len() {
            0 => Err(AmbitError::NotFound(format!("no {} matches", M::TYPE_NAME))),
            1 => Ok(models.remove(0)),
            found => Err(AmbitError::Cardinality { origin: M::TYPE_NAME.to_string(), found }),
        }
    }
    pub fn fill(&self, model: &mut M) -> Result<bool> {
        let scope = self.database.scope()?;
        let filled = self.fill_in(&scope, model)?;
        scope.complete();
        scope.close()?;
        Ok(filled)
    }
    /// Refreshes `model` in place; `false` unless exactly one row matches.
    pub fn fill_in(&self, unit: &UnitOfWork, model: &mut M) -> Result<bool> {
        self.database.ensure_owns(unit)?;
        let descriptor = self.mapping.command(CommandKind::Select)?;
        let mut command = bind_parameters(descriptor, model)?;
        let table = unit.execute_reader(&mut command)?;
        let [values] = table.rows.as_slice() else {
            return Ok(false);
        };
        map_row(descriptor, &table.columns, values, model)?;
        model.set_new(false);
        self.hooks.on_select(model);
        Ok(true)
    }
}
