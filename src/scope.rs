//! The ambient unit of work.
//!
//! Each thread carries at most one ambient [`UnitOfWork`]. Entry points call
//! [`Database::scope`]: if nothing is ambient they create a unit, publish it
//! and own it; otherwise they join the ambient one. Only the owner completes
//! and releases, so the same repository call works standalone or nested in a
//! larger transactional operation.
//!
//! ```
//! use ambit::Database;
//! let db = Database::in_memory().unwrap();
//! db.execute_batch("create table t (v integer)").unwrap();
//! {
//!     let outer = db.scope().unwrap();
//!     outer.execute_batch("insert into t values (1)").unwrap();
//!     {
//!         let inner = db.scope().unwrap();
//!         assert!(!inner.is_owner());
//!         assert_eq!(inner.id(), outer.id());
//!     }
//!     outer.complete();
//! }
//! assert!(db.current().is_none());
//! ```

use std::cell::RefCell;
use std::ops::Deref;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::database::Database;
use crate::error::{AmbitError, Result};
use crate::unit_of_work::{Begin, UnitOfWork};

thread_local! {
    static AMBIENT: RefCell<Option<Rc<UnitOfWork>>> = const { RefCell::new(None) };
}

/// The ambient unit of work of the current thread, whichever database it belongs to.
pub fn current() -> Option<Rc<UnitOfWork>> {
    AMBIENT.with(|slot| slot.borrow().clone())
}

/// Access to a unit of work that is either owned or joined.
pub struct Scope {
    unit: Rc<UnitOfWork>,
    owner: bool,
    closed: bool,
}

impl Scope {
    pub(crate) fn join_or_create(database: &Database, begin: Begin) -> Result<Self> {
        match current() {
            Some(unit) => {
                database.ensure_owns(&unit)?;
                debug!(unit = unit.id(), "joined ambient unit of work");
                Ok(Self { unit, owner: false, closed: false })
            }
            None => Self::create_new(database, begin),
        }
    }
    pub(crate) fn create_new(database: &Database, begin: Begin) -> Result<Self> {
        if let Some(unit) = current() {
            return Err(AmbitError::Configuration(format!(
                "unit of work {} is already ambient on this thread",
                unit.id()
            )));
        }
        let unit = Rc::new(database.begin_with(begin)?);
        AMBIENT.with(|slot| *slot.borrow_mut() = Some(Rc::clone(&unit)));
        Ok(Self { unit, owner: true, closed: false })
    }
    pub fn is_owner(&self) -> bool {
        self.owner
    }
    pub fn unit(&self) -> &Rc<UnitOfWork> {
        &self.unit
    }
    /// Marks the unit successful. Joined scopes leave completion to the owner.
    pub fn complete(&self) {
        if self.owner {
            self.unit.complete();
        }
    }
    /// Ends the scope, surfacing commit errors that a drop could only log.
    pub fn close(mut self) -> Result<()> {
        self.finish()
    }
    fn finish(&mut self) -> Result<()> {
        if self.closed || !self.owner {
            self.closed = true;
            return Ok(());
        }
        self.closed = true;
        AMBIENT.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.as_ref().is_some_and(|ambient| Rc::ptr_eq(ambient, &self.unit)) {
                *slot = None;
            }
        });
        self.unit.release()
    }
}

impl Deref for Scope {
    type Target = UnitOfWork;
    fn deref(&self) -> &UnitOfWork {
        &self.unit
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(unit = self.unit.id(), error = %e, "scope release failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit_of_work::UnitState;

    #[test]
    fn owner_releases_and_clears_the_slot() {
        let db = Database::in_memory().unwrap();
        let unit = {
            let scope = db.scope().unwrap();
            assert!(scope.is_owner());
            assert!(Rc::ptr_eq(&db.current().unwrap(), scope.unit()));
            Rc::clone(scope.unit())
        };
        assert!(current().is_none());
        assert_eq!(unit.state(), UnitState::RolledBack);
    }

    #[test]
    fn joined_scope_neither_completes_nor_releases() {
        let db = Database::in_memory().unwrap();
        let outer = db.scope().unwrap();
        {
            let inner = db.scope().unwrap();
            inner.complete();
            inner.close().unwrap();
        }
        assert!(!outer.is_completed());
        assert!(!outer.is_released());
        outer.complete();
        outer.close().unwrap();
        assert!(current().is_none());
    }

    #[test]
    fn create_new_refuses_to_shadow_an_ambient_unit() {
        let db = Database::in_memory().unwrap();
        let _outer = db.create_new().unwrap();
        assert!(matches!(db.create_new(), Err(AmbitError::Configuration(_))));
    }

    #[test]
    fn foreign_ambient_unit_is_a_configuration_error() {
        let a = Database::in_memory().unwrap();
        let b = Database::in_memory().unwrap();
        let _outer = a.scope().unwrap();
        assert!(matches!(b.scope(), Err(AmbitError::Configuration(_))));
        assert!(b.current().is_none());
    }
}
