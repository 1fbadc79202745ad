// used for persistence
use rusqlite::{CachedStatement, Connection, Row, Statement};
use serde::{Deserialize, Serialize};

use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{AmbitError, Result};
use crate::value::{DbType, Value};

// ------------- Parameters -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Input,
    Output,
    InputOutput,
    ReturnValue,
}

impl Direction {
    /// Sourced from the caller (or the model) before execution.
    pub fn is_input(&self) -> bool {
        matches!(self, Direction::Input | Direction::InputOutput)
    }
    /// Populated after execution.
    pub fn is_output(&self) -> bool {
        !matches!(self, Direction::Input)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub direction: Direction,
    pub db_type: DbType,
    pub size: Option<u32>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
    pub nullable: bool,
    pub value: Value,
}

impl Parameter {
    /// An input parameter whose type is inferred from the value.
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Input,
            db_type: DbType::of(&value),
            size: None,
            precision: None,
            scale: None,
            nullable: true,
            value,
        }
    }
    /// A parameter that only receives a value; starts out as a null placeholder.
    pub fn output(name: impl Into<String>, db_type: DbType) -> Self {
        Self { direction: Direction::Output, db_type, ..Self::new(name, Value::Null) }
    }
    pub fn return_value(name: impl Into<String>) -> Self {
        Self { direction: Direction::ReturnValue, db_type: DbType::Integer, ..Self::new(name, Value::Null) }
    }
    /// The name without its `@`, `:` or `$` prefix.
    pub fn bare_name(&self) -> &str {
        bare(&self.name)
    }
    /// Checks the declared facets against the value about to be bound.
    pub fn validate(&self) -> Result<()> {
        if self.db_type.is_character() {
            return Err(AmbitError::Argument(format!(
                "parameter '{}' is of type {}; pass characters as text",
                self.name, self.db_type
            )));
        }
        if !self.direction.is_input() {
            return Ok(());
        }
        if matches!(self.value, Value::Null) && !self.nullable {
            return Err(AmbitError::Argument(format!("parameter '{}' does not accept null", self.name)));
        }
        if !self.db_type.accepts(&self.value) {
            return Err(AmbitError::Argument(format!(
                "parameter '{}' is declared {} but received {:?}",
                self.name, self.db_type, self.value
            )));
        }
        if let (Some(size), Value::Text(s)) = (self.size, &self.value) {
            if size > 0 && s.chars().count() > size as usize {
                return Err(AmbitError::Argument(format!(
                    "parameter '{}' exceeds its size of {} characters",
                    self.name, size
                )));
            }
        }
        if let (Some(size), Value::Blob(b)) = (self.size, &self.value) {
            if size > 0 && b.len() > size as usize {
                return Err(AmbitError::Argument(format!(
                    "parameter '{}' exceeds its size of {} bytes",
                    self.name, size
                )));
            }
        }
        Ok(())
    }
    /// The value as it goes to the driver, with reals rounded to the declared scale.
    fn bound_value(&self) -> Value {
        match (&self.value, self.scale) {
            (Value::Real(r), Some(scale)) => {
                let factor = 10f64.powi(i32::from(scale));
                Value::Real((r * factor).round() / factor)
            }
            (Value::Integer(i), _) if self.db_type == DbType::Real => Value::Real(*i as f64),
            (v, _) => v.clone(),
        }
    }
}

pub(crate) fn bare(name: &str) -> &str {
    name.trim_start_matches(['@', ':', '$'])
}

// ------------- Commands -------------
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    #[default]
    Text,
    /// The text names a table; every row and column is read.
    TableDirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandBehavior {
    #[default]
    Default,
    SingleRow,
    /// Column names only; the statement is prepared but never stepped.
    SchemaOnly,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub text: String,
    pub command_type: CommandType,
    pub behavior: CommandBehavior,
    /// `None` leaves the unit's default in place.
    pub timeout: Option<Duration>,
    pub prepare: bool,
    pub parameters: Vec<Parameter>,
}

impl Command {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            command_type: CommandType::Text,
            behavior: CommandBehavior::Default,
            timeout: None,
            prepare: false,
            parameters: Vec::new(),
        }
    }
    pub fn with_parameter(mut self, parameter: Parameter) -> Self {
        self.parameters.push(parameter);
        self
    }
    pub fn bind(self, name: impl Into<String>, value: Value) -> Self {
        self.with_parameter(Parameter::new(name, value))
    }
    pub fn with_behavior(mut self, behavior: CommandBehavior) -> Self {
        self.behavior = behavior;
        self
    }
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
    pub fn prepared(mut self) -> Self {
        self.prepare = true;
        self
    }
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters
            .iter()
            .find(|p| p.name == name || p.bare_name().eq_ignore_ascii_case(bare(name)))
    }
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.parameter(name).map(|p| &p.value)
    }
    pub fn sql(&self) -> String {
        match self.command_type {
            CommandType::Text => self.text.trim().trim_end_matches(';').to_string(),
            CommandType::TableDirect => format!("select * from {}", quote_ident(self.text.trim())),
        }
    }
}

/// Quotes an identifier, allowing `schema.table` forms.
pub fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

// ------------- Results -------------
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataTable {
    /// The declared result-set name, if any.
    pub name: Option<String>,
    /// The table the rows are said to come from, if declared.
    pub source_table: Option<String>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl DataTable {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(column))
    }
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let index = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(index))
    }
    pub fn get<T: rusqlite::types::FromSql>(&self, row: usize, column: &str) -> Result<T> {
        let value = self
            .value(row, column)
            .ok_or_else(|| AmbitError::NotFound(format!("row {row}, column '{column}'")))?;
        crate::value::from_value(value)
    }
}

// ------------- Execution -------------

/// Runs commands on one borrowed connection.
///
/// Every entry point validates the parameters first, so a bad argument never
/// reaches the driver.
pub(crate) struct Executor<'c> {
    conn: &'c Connection,
    default_timeout: Duration,
}

impl<'c> Executor<'c> {
    pub(crate) fn new(conn: &'c Connection, default_timeout: Duration) -> Self {
        Self { conn, default_timeout }
    }

    /// Executes for an affected-row count. Outputs come from a `RETURNING` row, if the
    /// statement has one; a return-value parameter receives the count.
    pub(crate) fn non_query(&self, command: &mut Command) -> Result<i64> {
        let (affected, first) = self.with_statement(command, |conn, stmt| {
            if stmt.column_count() == 0 {
                let n = stmt.raw_execute()?;
                return Ok((n as i64, None));
            }
            let columns = column_names(stmt);
            let mut rows = stmt.raw_query();
            let mut first = None;
            while let Some(row) = rows.next()? {
                if first.is_none() {
                    first = Some((columns.clone(), row_values(row, columns.len())?));
                }
            }
            Ok((conn.changes() as i64, first))
        })?;
        capture_outputs(command, first.as_ref(), affected);
        Ok(affected)
    }

    /// Executes for the first column of the first row; `Null` when there is no row.
    pub(crate) fn scalar(&self, command: &mut Command) -> Result<Value> {
        let first = self.with_statement(command, |_, stmt| {
            let columns = column_names(stmt);
            let mut rows = stmt.raw_query();
            match rows.next()? {
                Some(row) => Ok(Some((columns.clone(), row_values(row, columns.len())?))),
                None => Ok(None),
            }
        })?;
        let scalar = first
            .as_ref()
            .and_then(|(_, values)| values.first().cloned())
            .unwrap_or(Value::Null);
        capture_outputs(command, first.as_ref(), i64::from(first.is_some()));
        Ok(scalar)
    }

    /// Executes for a fully read table, honouring the command behaviour.
    pub(crate) fn reader(&self, command: &mut Command) -> Result<DataTable> {
        let behavior = command.behavior;
        let table = self.with_statement(command, |_, stmt| {
            let columns = column_names(stmt);
            let mut table = DataTable { columns, ..DataTable::default() };
            if behavior == CommandBehavior::SchemaOnly {
                return Ok(table);
            }
            let width = table.columns.len();
            let mut rows = stmt.raw_query();
            while let Some(row) = rows.next()? {
                table.rows.push(row_values(row, width)?);
                if behavior == CommandBehavior::SingleRow {
                    break;
                }
            }
            Ok(table)
        })?;
        let first = table.rows.first().map(|r| (table.columns.clone(), r.clone()));
        capture_outputs(command, first.as_ref(), table.rows.len() as i64);
        Ok(table)
    }

    fn with_statement<T>(
        &self,
        command: &Command,
        run: impl FnOnce(&Connection, &mut Statement<'_>) -> Result<T>,
    ) -> Result<T> {
        for parameter in &command.parameters {
            parameter.validate()?;
        }
        let sql = command.sql();
        if sql.is_empty() {
            return Err(AmbitError::Argument("command text is empty".into()));
        }
        let started = Instant::now();
        if let Some(timeout) = command.timeout {
            self.conn.busy_timeout(timeout)?;
        }
        let result = self.prepare_and_run(command, &sql, run);
        if command.timeout.is_some() {
            self.conn.busy_timeout(self.default_timeout)?;
        }
        trace!(sql = %sql, elapsed_us = started.elapsed().as_micros() as u64, ok = result.is_ok(), "command");
        result
    }

    fn prepare_and_run<T>(
        &self,
        command: &Command,
        sql: &str,
        run: impl FnOnce(&Connection, &mut Statement<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut cached: CachedStatement<'_>;
        let mut plain: Statement<'_>;
        let stmt: &mut Statement<'_> = if command.prepare {
            cached = self.conn.prepare_cached(sql)?;
            &mut *cached
        } else {
            plain = self.conn.prepare(sql)?;
            &mut plain
        };
        bind(stmt, command)?;
        run(self.conn, stmt)
    }
}

fn bind(stmt: &mut Statement<'_>, command: &Command) -> Result<()> {
    let mut bound = vec![false; stmt.parameter_count() + 1];
    for parameter in command.parameters.iter().filter(|p| p.direction.is_input()) {
        if let Some(index) = placeholder_index(stmt, &parameter.name)? {
            stmt.raw_bind_parameter(index, parameter.bound_value())?;
            bound[index] = true;
        }
    }
    for index in 1..bound.len() {
        if !bound[index] {
            let name = stmt.parameter_name(index).unwrap_or("?").to_string();
            return Err(AmbitError::Argument(format!("placeholder '{name}' has no input parameter")));
        }
    }
    Ok(())
}

/// Finds a placeholder by exact name, then by bare name under each prefix.
fn placeholder_index(stmt: &Statement<'_>, name: &str) -> Result<Option<usize>> {
    if let Some(index) = stmt.parameter_index(name)? {
        return Ok(Some(index));
    }
    let bare_name = bare(name);
    for prefix in ["@", ":", "$"] {
        if let Some(index) = stmt.parameter_index(&format!("{prefix}{bare_name}"))? {
            return Ok(Some(index));
        }
    }
    Ok(None)
}

fn column_names(stmt: &Statement<'_>) -> Vec<String> {
    stmt.column_names().into_iter().map(str::to_owned).collect()
}

fn row_values(row: &Row<'_>, width: usize) -> Result<Vec<Value>> {
    (0..width).map(|i| Ok(Value::from(row.get_ref(i)?))).collect()
}

fn capture_outputs(command: &mut Command, first: Option<&(Vec<String>, Vec<Value>)>, count: i64) {
    for parameter in command.parameters.iter_mut().filter(|p| p.direction.is_output()) {
        if parameter.direction == Direction::ReturnValue {
            parameter.value = Value::Integer(count);
            continue;
        }
        let found = first.and_then(|(columns, values)| {
            columns
                .iter()
                .position(|c| c.eq_ignore_ascii_case(parameter.bare_name()))
                .and_then(|i| values.get(i).cloned())
        });
        match (found, parameter.direction) {
            (Some(value), _) => parameter.value = value,
            // an output with nothing to read from is null, an in-out keeps what it sent
            (None, Direction::Output) => parameter.value = Value::Null,
            (None, _) => {}
        }
    }
}
