//! Result sequences: lazy cursors and the materialized/lazy `Found`.

use std::collections::VecDeque;
use std::vec;

use tracing::trace;

use crate::command::{Command, CommandType, quote_ident};
use crate::error::{AmbitError, Result};
use crate::unit_of_work::ConnectionLink;
use crate::value::Value;

type Decode<T> = Box<dyn FnMut(&[String], Vec<Value>) -> Result<T>>;

enum Paging {
    /// Pages ordered by a unique key, each one starting after the last key read.
    Keyset { key: String, after: Option<Value>, page_size: usize },
    /// The whole result, read on the first pull.
    Whole,
}

/// Reads a query lazily through a [`ConnectionLink`].
///
/// Nothing is read before the first call to `next`. Keyset pages resume after
/// the last key they returned, so rows written while the cursor is being
/// consumed neither shift nor hide the rows still ahead of it. Once the unit
/// of work behind the link is released, the next fetch yields `Released` and
/// the cursor ends.
pub struct Cursor<T> {
    link: ConnectionLink,
    command: Command,
    paging: Paging,
    buffer: VecDeque<Result<T>>,
    exhausted: bool,
    decode: Decode<T>,
}

impl<T> Cursor<T> {
    /// Pages through `command` by its `key` column, `page_size` rows at a time.
    pub fn keyset(
        link: ConnectionLink,
        command: Command,
        key: impl Into<String>,
        page_size: usize,
        decode: impl FnMut(&[String], Vec<Value>) -> Result<T> + 'static,
    ) -> Self {
        let paging = Paging::Keyset { key: key.into(), after: None, page_size: page_size.max(1) };
        Self::with_paging(link, command, paging, decode)
    }
    /// Runs `command` once, on the first pull, and hands its rows out one by one.
    pub fn whole(
        link: ConnectionLink,
        command: Command,
        decode: impl FnMut(&[String], Vec<Value>) -> Result<T> + 'static,
    ) -> Self {
        Self::with_paging(link, command, Paging::Whole, decode)
    }
    fn with_paging(
        link: ConnectionLink,
        command: Command,
        paging: Paging,
        decode: impl FnMut(&[String], Vec<Value>) -> Result<T> + 'static,
    ) -> Self {
        Self { link, command, paging, buffer: VecDeque::new(), exhausted: false, decode: Box::new(decode) }
    }

    fn page(&self) -> Command {
        let Paging::Keyset { key, after, page_size } = &self.paging else {
            return self.command.clone();
        };
        let mut page = self.command.clone();
        let key = quote_ident(key);
        let resume = if after.is_some() { format!(" where {key} > :ambit_after") } else { String::new() };
        page.text = format!(
            "select * from ({}){resume} order by {key} limit :ambit_limit",
            self.command.sql()
        );
        page.command_type = CommandType::Text;
        page = page.bind(":ambit_limit", Value::Integer(*page_size as i64));
        if let Some(after) = after {
            page = page.bind(":ambit_after", after.clone());
        }
        page
    }

    fn fetch(&mut self) {
        let mut page = self.page();
        let table = match self.link.execute_reader(&mut page) {
            Ok(table) => table,
            Err(e) => {
                self.exhausted = true;
                self.buffer.push_back(Err(e));
                return;
            }
        };
        trace!(unit = self.link.unit(), rows = table.row_count(), "cursor page");
        match &mut self.paging {
            Paging::Whole => self.exhausted = true,
            Paging::Keyset { key, after, page_size } => {
                self.exhausted = table.row_count() < *page_size;
                let last = table.rows.last();
                match (table.column_index(key), last) {
                    (Some(i), Some(row)) => *after = Some(row[i].clone()),
                    (None, Some(_)) => {
                        self.exhausted = true;
                        let missing = format!("cursor key column '{key}' is not in the result");
                        self.buffer.push_back(Err(AmbitError::mapping(missing, None)));
                        return;
                    }
                    _ => {}
                }
            }
        }
        for row in table.rows {
            let decoded = (self.decode)(&table.columns, row);
            self.buffer.push_back(decoded);
        }
    }
}

impl<T> Iterator for Cursor<T> {
    type Item = Result<T>;
    fn next(&mut self) -> Option<Result<T>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fetch();
        }
        self.buffer.pop_front()
    }
}

/// The result of a `find`: drained when the call owned its unit of work, lazy
/// when it joined an ambient one.
pub enum Found<M> {
    Materialized(vec::IntoIter<M>),
    Lazy(Box<dyn Iterator<Item = Result<M>>>),
}

impl<M> Found<M> {
    pub fn is_materialized(&self) -> bool {
        matches!(self, Found::Materialized(_))
    }
    /// Drains the sequence, stopping at the first error.
    pub fn into_vec(self) -> Result<Vec<M>> {
        match self {
            Found::Materialized(rows) => Ok(rows.collect()),
            Found::Lazy(rows) => rows.collect(),
        }
    }
    /// Forces a lazy sequence while its unit of work is still alive.
    pub(crate) fn drained(self) -> Result<Self> {
        match self {
            Found::Lazy(rows) => Ok(Found::Materialized(rows.collect::<Result<Vec<_>>>()?.into_iter())),
            materialized => Ok(materialized),
        }
    }
}

impl<M> Iterator for Found<M> {
    type Item = Result<M>;
    fn next(&mut self) -> Option<Result<M>> {
        match self {
            Found::Materialized(rows) => rows.next().map(Ok),
            Found::Lazy(rows) => rows.next(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit_of_work::UnitOfWork;
    use rusqlite::Connection;
    use std::time::Duration;

    fn unit() -> UnitOfWork {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "create table n (v integer primary key);
             insert into n values (1), (2), (3), (4), (5);",
        )
        .unwrap();
        UnitOfWork::open(conn, "mem", true, Duration::from_secs(5)).unwrap()
    }

    fn values(unit: &UnitOfWork, page: usize) -> Cursor<i64> {
        Cursor::keyset(unit.link(), Command::new("select v from n"), "v", page, |_, row| {
            crate::value::from_value(&row[0])
        })
    }

    #[test]
    fn pages_through_every_row_in_order() {
        let unit = unit();
        let all: Vec<i64> = values(&unit, 2).collect::<Result<_>>().unwrap();
        assert_eq!(all, vec![1, 2, 3, 4, 5]);
        let exact: Vec<i64> = values(&unit, 5).collect::<Result<_>>().unwrap();
        assert_eq!(exact.len(), 5);
    }

    #[test]
    fn rows_removed_behind_the_cursor_do_not_hide_rows_ahead() {
        let unit = unit();
        let mut cursor = values(&unit, 2);
        assert_eq!(cursor.next().unwrap().unwrap(), 1);
        unit.execute_batch("delete from n where v <= 2").unwrap();
        let rest: Vec<i64> = cursor.collect::<Result<_>>().unwrap();
        assert_eq!(rest, vec![2, 3, 4, 5]);
    }

    #[test]
    fn a_missing_key_column_is_a_mapping_error() {
        let unit = unit();
        let mut cursor: Cursor<i64> =
            Cursor::keyset(unit.link(), Command::new("select v as w from n"), "v", 2, |_, _| Ok(0));
        assert!(matches!(cursor.next(), Some(Err(AmbitError::Mapping { .. }))));
        assert!(cursor.next().is_none());
    }

    #[test]
    fn whole_cursors_read_once() {
        let unit = unit();
        let mut cursor: Cursor<i64> =
            Cursor::whole(unit.link(), Command::new("select v from n order by v desc"), |_, row| {
                crate::value::from_value(&row[0])
            });
        assert_eq!(cursor.next().unwrap().unwrap(), 5);
        unit.execute_batch("insert into n values (6)").unwrap();
        assert_eq!(cursor.count(), 4);
    }

    #[test]
    fn fails_once_the_unit_is_released() {
        let unit = unit();
        let mut cursor = values(&unit, 2);
        assert_eq!(cursor.next().unwrap().unwrap(), 1);
        assert_eq!(cursor.next().unwrap().unwrap(), 2);
        unit.release().unwrap();
        assert!(matches!(cursor.next(), Some(Err(AmbitError::Released(_)))));
        assert!(cursor.next().is_none());
    }

    #[test]
    fn draining_keeps_values_past_release() {
        let unit = unit();
        let lazy: Found<i64> = Found::Lazy(Box::new(values(&unit, 2)));
        assert!(!lazy.is_materialized());
        let found = lazy.drained().unwrap();
        unit.release().unwrap();
        assert!(found.is_materialized());
        assert_eq!(found.into_vec().unwrap(), vec![1, 2, 3, 4, 5]);
    }
}
