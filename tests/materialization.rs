mod common;

use ambit::{AmbitError, Database, Filter, Settings};
use common::{SCHEMA, User, database, users};

#[test]
fn an_owned_find_is_drained_before_its_unit_goes_away() {
    let db = database();
    let repo = users(&db);
    for name in ["alice", "bob", "carol"] {
        repo.save(&mut User::new(name)).unwrap();
    }
    let found = repo.find(&Filter::All).unwrap();
    assert!(found.is_materialized());
    assert!(db.current().is_none());
    let names: Vec<String> = found.map(|u| u.unwrap().name).collect();
    assert_eq!(names, vec!["alice", "bob", "carol"]);
}

#[test]
fn a_joined_find_is_lazy_and_dies_with_its_unit() {
    let db = database();
    let repo = users(&db);
    repo.save(&mut User::new("alice")).unwrap();
    let mut found = {
        let scope = db.scope().unwrap();
        let found = repo.find(&Filter::All).unwrap();
        assert!(!found.is_materialized());
        assert!(scope.is_owner());
        found
    };
    assert!(matches!(found.next(), Some(Err(AmbitError::Released(_)))));
    assert!(found.next().is_none());
}

#[test]
fn lazy_sequences_page_through_every_row() {
    let db = Database::open(Settings::in_memory().with_fetch_size(2)).unwrap();
    db.execute_batch(SCHEMA).unwrap();
    let repo = users(&db);
    let names = ["a", "b", "c", "d", "e"];
    let scope = db.scope().unwrap();
    for name in names {
        repo.save(&mut User::new(name)).unwrap();
    }
    let seen: Vec<String> = repo.find(&Filter::All).unwrap().map(|u| u.unwrap().name).collect();
    assert_eq!(seen, names);
    let projected: Vec<usize> = repo
        .find_projected(&Filter::All, |row: &common::UserRow| User {
            name: row.user_name.repeat(2),
            ..User::default()
        })
        .unwrap()
        .map(|u| u.unwrap().name.len())
        .collect();
    assert_eq!(projected, vec![2; 5]);
    scope.complete();
    scope.close().unwrap();
    assert_eq!(repo.find(&Filter::All).unwrap().count(), 5);
}

#[test]
fn saving_while_iterating_visits_every_match() {
    let db = Database::open(Settings::in_memory().with_fetch_size(2)).unwrap();
    db.execute_batch(SCHEMA).unwrap();
    let repo = users(&db);
    for name in ["a", "b", "c", "d", "e"] {
        repo.save(&mut User { email: Some("pending".into()), ..User::new(name) }).unwrap();
    }
    let pending = Filter::eq("email", "pending");
    let scope = db.scope().unwrap();
    let mut visited = Vec::new();
    for user in repo.find(&pending).unwrap() {
        let mut user = user.unwrap();
        // each save takes a row out of the sequence being read
        user.email = Some("done".into());
        assert!(repo.save(&mut user).unwrap());
        visited.push(user.name);
    }
    scope.complete();
    scope.close().unwrap();
    assert_eq!(visited, vec!["a", "b", "c", "d", "e"]);
    assert_eq!(repo.find(&pending).unwrap().count(), 0);
}
