mod common;

use ambit::model::Model;
use ambit::{AmbitError, Filter, RepositoryHooks, Result};
use common::{Counting, Counts, User, by_name, database, users};

#[test]
fn saving_a_new_model_assigns_identity() {
    let db = database();
    let repo = users(&db);
    let mut alice = User::new("alice");
    assert!(repo.save(&mut alice).unwrap());
    assert_eq!(alice.id, Some(1));
    assert_eq!(alice.version, Some(1));
    assert!(!alice.is_new());
    assert!(alice.audit.created_at.is_some());
    assert_eq!(alice.audit.created_by, Some(0));

    alice.email = Some("alice@example.com".into());
    let editor = users(&db.acting_as(7));
    assert!(editor.save(&mut alice).unwrap());
    assert_eq!(alice.version, Some(2));
    assert_eq!(alice.audit.created_by, Some(0));
    assert_eq!(alice.audit.modified_by, Some(7));
    let stored = repo.load(&by_name("alice")).unwrap();
    assert_eq!(stored.email.as_deref(), Some("alice@example.com"));
}

#[test]
fn find_without_matches_is_an_empty_sequence() {
    let db = database();
    let repo = users(&db);
    let found = repo.find(&by_name("nobody")).unwrap();
    assert!(found.is_materialized());
    assert_eq!(found.count(), 0);
}

#[test]
fn load_requires_exactly_one_row() {
    let db = database();
    let repo = users(&db);
    assert!(matches!(repo.load(&by_name("alice")), Err(AmbitError::NotFound(_))));
    for name in ["alice", "alicia"] {
        repo.save(&mut User::new(name)).unwrap();
    }
    let both = Filter::like("user_name", "ali%");
    assert!(matches!(repo.load(&both), Err(AmbitError::Cardinality { found: 2, .. })));
    assert_eq!(repo.find(&both).unwrap().into_vec().unwrap().len(), 2);
    let alice = repo.load(&by_name("alice")).unwrap();
    assert!(!alice.is_new());
    assert_eq!(repo.load_like(&alice).unwrap().id, alice.id);
}

#[test]
fn discarding_a_new_model_touches_nothing() {
    let db = database();
    let counts = Counting::default();
    let repo = users(&db).with_hooks(counts.clone());
    let mut ghost = User::new("ghost");
    assert!(repo.discard(&mut ghost).unwrap());
    assert!(ghost.is_new());
    assert_eq!(Counts::get(&counts.0.deletes), 0);
    assert!(db.current().is_none());
}

#[test]
fn discard_then_fill_finds_nothing() {
    let db = database();
    let counts = Counting::default();
    let repo = users(&db).with_hooks(counts.clone());
    let mut alice = User::new("alice");
    repo.save(&mut alice).unwrap();
    let mut copy = alice.clone();
    assert!(repo.discard(&mut alice).unwrap());
    assert_eq!(Counts::get(&counts.0.deletes), 1);
    assert!(!repo.fill(&mut copy).unwrap());
    // the row is already gone: nothing to discard, no conflict either
    assert!(!repo.discard(&mut copy).unwrap());
    assert_eq!(Counts::get(&counts.0.discard_conflicts), 0);
}

#[test]
fn fill_refreshes_in_place_and_runs_the_select_hook() {
    let db = database();
    let counts = Counting::default();
    let repo = users(&db).with_hooks(counts.clone());
    let mut alice = User::new("alice");
    repo.save(&mut alice).unwrap();
    db.execute_batch("update users set email = 'new@example.com', version = version + 1").unwrap();
    let mut model = User { id: alice.id, ..User::default() };
    assert!(repo.fill(&mut model).unwrap());
    assert_eq!(model.name, "alice");
    assert_eq!(model.email.as_deref(), Some("new@example.com"));
    assert_eq!(model.version, Some(2));
    assert_eq!(Counts::get(&counts.0.selects), 1);

    let mut missing = User { id: Some(99), ..User::default() };
    assert!(!repo.fill(&mut missing).unwrap());
    assert_eq!(missing.id, Some(99));
}

struct Gatekeeper;
impl RepositoryHooks<User> for Gatekeeper {
    fn on_pre_update(&self, model: &mut User) -> Result<()> {
        model.name = model.name.to_uppercase();
        if model.email.is_none() {
            return Err(AmbitError::Argument("an email is required".into()));
        }
        Ok(())
    }
}

#[test]
fn a_vetoed_update_restores_the_model() {
    let db = database();
    let repo = users(&db).with_hooks(Gatekeeper);
    let mut alice = User::new("alice");
    repo.save(&mut alice).unwrap();
    let before = alice.clone();
    let vetoed = repo.save(&mut alice);
    assert!(matches!(vetoed, Err(AmbitError::Argument(_))));
    assert_eq!(alice, before);

    alice.email = Some("a@example.com".into());
    assert!(repo.save(&mut alice).unwrap());
    assert_eq!(alice.name, "ALICE");
}

#[test]
fn persistence_failures_propagate_and_restore_the_model() {
    let db = database();
    let repo = users(&db);
    repo.save(&mut User::new("alice")).unwrap();
    let mut twin = User::new("alice");
    let failed = repo.save(&mut twin);
    assert!(matches!(failed, Err(AmbitError::Persistence(_))));
    assert_eq!(twin, User::new("alice"));
    assert_eq!(repo.find(&Filter::All).unwrap().count(), 1);
}
