//! Match expressions over the columns of one table.
//!
//! A [`Filter`] is a small query object: rendering checks every column it names
//! against the columns the table is known to have, so a typo surfaces as an
//! argument error instead of a driver error halfway through a save.

use crate::command::{Parameter, quote_ident};
use crate::error::{AmbitError, Result};
use crate::value::{SqlType, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    fn sql(&self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Ne => "<>",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Compare { column: String, op: Op, value: Value },
    Like { column: String, pattern: String },
    IsNull(String),
    NotNull(String),
    In { column: String, values: Vec<Value> },
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn eq(column: impl Into<String>, value: impl SqlType) -> Self {
        Self::compare(column, Op::Eq, value)
    }
    pub fn compare(column: impl Into<String>, op: Op, value: impl SqlType) -> Self {
        Filter::Compare { column: column.into(), op, value: value.to_value() }
    }
    /// Compares against a raw value, typically one read back from a row.
    pub fn value(column: impl Into<String>, value: Value) -> Self {
        Filter::Compare { column: column.into(), op: Op::Eq, value }
    }
    pub fn like(column: impl Into<String>, pattern: impl Into<String>) -> Self {
        Filter::Like { column: column.into(), pattern: pattern.into() }
    }
    pub fn is_null(column: impl Into<String>) -> Self {
        Filter::IsNull(column.into())
    }
    pub fn in_values<T: SqlType>(column: impl Into<String>, values: impl IntoIterator<Item = T>) -> Self {
        Filter::In { column: column.into(), values: values.into_iter().map(|v| v.to_value()).collect() }
    }
    pub fn and(self, other: Filter) -> Self {
        match self {
            Filter::All => other,
            Filter::And(mut parts) => {
                parts.push(other);
                Filter::And(parts)
            }
            this => Filter::And(vec![this, other]),
        }
    }
    pub fn or(self, other: Filter) -> Self {
        match self {
            Filter::Or(mut parts) => {
                parts.push(other);
                Filter::Or(parts)
            }
            this => Filter::Or(vec![this, other]),
        }
    }
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Filter::Not(Box::new(self))
    }

    /// Renders a `where` clause body with `:f1, :f2, ..` placeholders.
    pub fn render(&self, columns: &[&str]) -> Result<(String, Vec<Parameter>)> {
        let mut parameters = Vec::new();
        let sql = self.render_into(columns, &mut parameters)?;
        Ok((sql, parameters))
    }

    fn render_into(&self, columns: &[&str], parameters: &mut Vec<Parameter>) -> Result<String> {
        Ok(match self {
            Filter::All => "1 = 1".to_string(),
            Filter::Compare { column, op, value } => {
                let column = checked(columns, column)?;
                if matches!(value, Value::Null) {
                    // `= null` never matches; compare nulls the way callers mean it
                    match op {
                        Op::Eq => format!("{column} is null"),
                        Op::Ne => format!("{column} is not null"),
                        _ => return Err(AmbitError::Argument(format!("{column} cannot be ordered against null"))),
                    }
                } else {
                    format!("{column} {} {}", op.sql(), placeholder(value.clone(), parameters))
                }
            }
            Filter::Like { column, pattern } => {
                let column = checked(columns, column)?;
                format!("{column} like {}", placeholder(Value::Text(pattern.clone()), parameters))
            }
            Filter::IsNull(column) => format!("{} is null", checked(columns, column)?),
            Filter::NotNull(column) => format!("{} is not null", checked(columns, column)?),
            Filter::In { column, values } => {
                let column = checked(columns, column)?;
                if values.is_empty() {
                    "1 = 0".to_string()
                } else {
                    let names: Vec<String> = values.iter().map(|v| placeholder(v.clone(), parameters)).collect();
                    format!("{column} in ({})", names.join(", "))
                }
            }
            Filter::And(parts) | Filter::Or(parts) => {
                if parts.is_empty() {
                    return Err(AmbitError::Argument("empty conjunction or disjunction".into()));
                }
                let joiner = if matches!(self, Filter::And(_)) { " and " } else { " or " };
                let rendered = parts
                    .iter()
                    .map(|p| p.render_into(columns, parameters).map(|s| format!("({s})")))
                    .collect::<Result<Vec<_>>>()?;
                rendered.join(joiner)
            }
            Filter::Not(inner) => format!("not ({})", inner.render_into(columns, parameters)?),
        })
    }
}

fn placeholder(value: Value, parameters: &mut Vec<Parameter>) -> String {
    let name = format!(":f{}", parameters.len() + 1);
    parameters.push(Parameter::new(name.clone(), value));
    name
}

fn checked(columns: &[&str], column: &str) -> Result<String> {
    columns
        .iter()
        .find(|c| c.eq_ignore_ascii_case(column))
        .map(|c| quote_ident(c))
        .ok_or_else(|| AmbitError::Argument(format!("unknown column '{column}'")))
}
