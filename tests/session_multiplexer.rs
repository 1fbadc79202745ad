mod common;

use std::rc::Rc;

use ambit::command::Command;
use ambit::session::{ConflictMode, DataContext, Session, SessionMultiplexer, TempContext};
use ambit::unit_of_work::ConnectionLink;
use ambit::value::Value;
use ambit::{AmbitError, Filter, Result};
use common::{User, UserRow, database, users};

/// A hand-written session that appends to an audit table.
struct AuditTrail {
    link: ConnectionLink,
}

impl Session for AuditTrail {
    fn open(link: &ConnectionLink) -> Result<Self> {
        Ok(Self { link: link.clone() })
    }
}

impl AuditTrail {
    fn record(&self, entry: &str) -> Result<()> {
        let mut command = Command::new("insert into audit_trail (entry) values (@entry)")
            .bind("@entry", Value::Text(entry.to_string()));
        self.link.execute_non_query(&mut command)?;
        Ok(())
    }
}

fn audited_database() -> ambit::Database {
    let db = database();
    db.execute_batch("create table audit_trail (entry text not null)").unwrap();
    db
}

#[test]
fn one_session_per_type_per_unit() {
    let db = audited_database();
    let first = db.begin().unwrap();
    let second = db.begin().unwrap();
    let a = first.session::<DataContext>().unwrap();
    let b = second.session::<DataContext>().unwrap();
    assert!(!Rc::ptr_eq(&a, &b));
    assert!(Rc::ptr_eq(&a, &first.session::<DataContext>().unwrap()));

    users(&db).save_in(&first, &mut User::new("alice")).unwrap();
    let multiplexer = first.context().unwrap().downcast::<SessionMultiplexer>().unwrap();
    assert_eq!(multiplexer.len(), 1);
    assert!(multiplexer.contains::<DataContext>());
    assert!(!multiplexer.contains::<DataContext<TempContext>>());
}

#[test]
fn typed_sessions_share_one_transaction() {
    let db = audited_database();
    {
        let scope = db.scope().unwrap();
        let trail = scope.session::<AuditTrail>().unwrap();
        let rows = scope.session::<DataContext>().unwrap();
        rows.insert_on_submit(UserRow { user_name: "alice".into(), ..UserRow::default() });
        rows.submit_changes(ConflictMode::FailOnFirstConflict).unwrap();
        trail.record("alice created").unwrap();
        assert_eq!(
            scope.execute_scalar(&mut Command::new("select count(*) from audit_trail")).unwrap(),
            Value::Integer(1)
        );
        // never completed
    }
    let scope = db.scope().unwrap();
    assert_eq!(scope.session::<DataContext>().unwrap().count::<UserRow>(&Filter::All).unwrap(), 0);
    assert_eq!(
        scope.execute_scalar(&mut Command::new("select count(*) from audit_trail")).unwrap(),
        Value::Integer(0)
    );
}

#[test]
fn sessions_end_with_their_unit() {
    let db = audited_database();
    let unit = db.begin().unwrap();
    let trail = unit.session::<AuditTrail>().unwrap();
    unit.release().unwrap();
    assert!(unit.context().is_none());
    assert!(matches!(trail.record("too late"), Err(AmbitError::Released(_))));
    assert!(matches!(unit.session::<AuditTrail>(), Err(AmbitError::Released(_))));
}

#[test]
fn a_foreign_context_blocks_the_multiplexer() {
    let db = audited_database();
    let unit = db.begin().unwrap();
    unit.set_context(Rc::new(42u8)).unwrap();
    assert!(matches!(unit.session::<AuditTrail>(), Err(AmbitError::Configuration(_))));
    assert!(matches!(unit.set_context(Rc::new(7u8)), Err(AmbitError::Configuration(_))));
    let refused = users(&db).save_in(&unit, &mut User::new("alice"));
    assert!(matches!(refused, Err(AmbitError::Configuration(_))));
}
