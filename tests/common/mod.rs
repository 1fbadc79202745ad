#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ambit::model::{Audit, AuditStamp, Model};
use ambit::session::Record;
use ambit::{AmbitError, Database, Filter, Repository, RepositoryHooks};

pub const SCHEMA: &str = "create table users (
    user_id integer primary key,
    user_name text not null unique,
    email text,
    version integer
);";

#[derive(Debug, Default, Clone, PartialEq)]
pub struct UserRow {
    pub user_id: Option<i64>,
    pub user_name: String,
    pub email: Option<String>,
    pub version: Option<i64>,
}
ambit::entity!(UserRow as "people::UserRow" => { user_id, user_name, email, version });

impl Record for UserRow {
    const TABLE: &'static str = "users";
    const KEY: &'static str = "user_id";
    const VERSION: Option<&'static str> = Some("version");
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct User {
    pub id: Option<i64>,
    pub name: String,
    pub email: Option<String>,
    pub version: Option<i64>,
    pub audit: Audit,
    pub new: bool,
}

impl User {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), new: true, ..Self::default() }
    }
}

impl Model for User {
    fn is_new(&self) -> bool {
        self.new
    }
    fn set_new(&mut self, new: bool) {
        self.new = new;
    }
    fn mark(&mut self, stamp: &AuditStamp) {
        self.audit.mark(stamp);
    }
}

pub fn database() -> Database {
    let db = Database::in_memory().expect("db");
    db.execute_batch(SCHEMA).expect("schema");
    db
}

pub fn users(db: &Database) -> Repository<User, UserRow> {
    Repository::new(
        db.clone(),
        |u: &User| Filter::eq("user_id", u.id),
        |u: &User, r: &mut UserRow| {
            r.user_name = u.name.clone();
            r.email = u.email.clone();
            // the version the caller last saw decides whether the write is stale
            r.version = u.version;
        },
        |r: &UserRow, u: &mut User| {
            u.id = r.user_id;
            u.name = r.user_name.clone();
            u.email = r.email.clone();
            u.version = r.version;
        },
    )
}

pub fn by_name(name: &str) -> Filter {
    Filter::eq("user_name", name)
}

/// Counts hook invocations; clones share the counters.
#[derive(Clone, Default)]
pub struct Counting(pub Arc<Counts>);

#[derive(Default)]
pub struct Counts {
    pub selects: AtomicUsize,
    pub inserts: AtomicUsize,
    pub updates: AtomicUsize,
    pub deletes: AtomicUsize,
    pub save_conflicts: AtomicUsize,
    pub discard_conflicts: AtomicUsize,
}

impl Counts {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl RepositoryHooks<User> for Counting {
    fn on_post_insert(&self, _: &User) {
        self.0.inserts.fetch_add(1, Ordering::SeqCst);
    }
    fn on_post_update(&self, _: &User) {
        self.0.updates.fetch_add(1, Ordering::SeqCst);
    }
    fn on_post_delete(&self, _: &User) {
        self.0.deletes.fetch_add(1, Ordering::SeqCst);
    }
    fn on_select(&self, _: &mut User) {
        self.0.selects.fetch_add(1, Ordering::SeqCst);
    }
    fn on_save_conflict(&self, _: &User, conflict: &AmbitError) {
        assert!(conflict.is_conflict());
        self.0.save_conflicts.fetch_add(1, Ordering::SeqCst);
    }
    fn on_discard_conflict(&self, _: &User, conflict: &AmbitError) {
        assert!(conflict.is_conflict());
        self.0.discard_conflicts.fetch_add(1, Ordering::SeqCst);
    }
}
