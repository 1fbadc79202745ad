// used for persistence
use rusqlite::types::{FromSql, ToSql, ToSqlOutput, ValueRef};
pub use rusqlite::types::Value;

// used for timestamps in the database
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

// mapping documents name their parameter types
use serde::{Deserialize, Serialize};

// used to print out readable forms of a data type
use std::fmt;

use crate::error::{AmbitError, Result};

/// Database-side type of a parameter or column.
///
/// `Char` and `CharArray` exist only so that inference can recognise them and
/// reject them; text has to travel as `Text`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbType {
    Integer,
    Real,
    Text,
    Blob,
    Boolean,
    Date,
    DateTime,
    Char,
    CharArray,
    Variant,
}

impl DbType {
    /// Infers the type of a value that arrived without any declared type.
    pub fn of(value: &Value) -> DbType {
        match value {
            Value::Null => DbType::Variant,
            Value::Integer(_) => DbType::Integer,
            Value::Real(_) => DbType::Real,
            Value::Text(_) => DbType::Text,
            Value::Blob(_) => DbType::Blob,
        }
    }
    pub fn is_character(&self) -> bool {
        matches!(self, DbType::Char | DbType::CharArray)
    }
    /// Whether a runtime value is acceptable for a parameter declared with this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) | (DbType::Variant, _) => true,
            (DbType::Integer | DbType::Boolean, Value::Integer(_)) => true,
            (DbType::Real, Value::Real(_) | Value::Integer(_)) => true,
            (DbType::Text | DbType::Date | DbType::DateTime, Value::Text(_)) => true,
            (DbType::Blob, Value::Blob(_)) => true,
            _ => false,
        }
    }
    pub fn name(&self) -> &'static str {
        match self {
            DbType::Integer => "integer",
            DbType::Real => "real",
            DbType::Text => "text",
            DbType::Blob => "blob",
            DbType::Boolean => "boolean",
            DbType::Date => "date",
            DbType::DateTime => "date_time",
            DbType::Char => "char",
            DbType::CharArray => "char_array",
            DbType::Variant => "variant",
        }
    }
}

impl fmt::Display for DbType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A Rust type that can be bound as a command argument.
///
/// The associated constant plays the part runtime type inspection would play
/// elsewhere: the dispatcher reads it to infer a parameter's type when the
/// contract does not declare one.
pub trait SqlType {
    // static stuff which needs to be implemented downstream
    const DB_TYPE: DbType;
    fn to_value(&self) -> Value;
    // instance callable with pre-made implementation
    fn db_type(&self) -> DbType {
        Self::DB_TYPE
    }
}

// ------------- Data Types --------------
impl SqlType for i64 {
    const DB_TYPE: DbType = DbType::Integer;
    fn to_value(&self) -> Value {
        Value::Integer(*self)
    }
}
impl SqlType for i32 {
    const DB_TYPE: DbType = DbType::Integer;
    fn to_value(&self) -> Value {
        Value::Integer(i64::from(*self))
    }
}
impl SqlType for bool {
    const DB_TYPE: DbType = DbType::Boolean;
    fn to_value(&self) -> Value {
        Value::Integer(i64::from(*self))
    }
}
impl SqlType for f64 {
    const DB_TYPE: DbType = DbType::Real;
    fn to_value(&self) -> Value {
        Value::Real(*self)
    }
}
impl SqlType for String {
    const DB_TYPE: DbType = DbType::Text;
    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }
}
impl SqlType for &str {
    const DB_TYPE: DbType = DbType::Text;
    fn to_value(&self) -> Value {
        Value::Text((*self).to_owned())
    }
}
impl SqlType for Vec<u8> {
    const DB_TYPE: DbType = DbType::Blob;
    fn to_value(&self) -> Value {
        Value::Blob(self.clone())
    }
}
impl SqlType for NaiveDate {
    const DB_TYPE: DbType = DbType::Date;
    fn to_value(&self) -> Value {
        Value::Text(self.format("%F").to_string())
    }
}
impl SqlType for NaiveDateTime {
    const DB_TYPE: DbType = DbType::DateTime;
    fn to_value(&self) -> Value {
        Value::Text(self.format("%F %T%.f").to_string())
    }
}
impl SqlType for DateTime<Utc> {
    const DB_TYPE: DbType = DbType::DateTime;
    fn to_value(&self) -> Value {
        Value::Text(self.format("%F %T%.f%:z").to_string())
    }
}
impl<T: SqlType> SqlType for Option<T> {
    const DB_TYPE: DbType = T::DB_TYPE;
    fn to_value(&self) -> Value {
        self.as_ref().map_or(Value::Null, SqlType::to_value)
    }
}
// Character types are representable so that they can be refused.
impl SqlType for char {
    const DB_TYPE: DbType = DbType::Char;
    fn to_value(&self) -> Value {
        Value::Text(self.to_string())
    }
}
impl SqlType for Vec<char> {
    const DB_TYPE: DbType = DbType::CharArray;
    fn to_value(&self) -> Value {
        Value::Text(self.iter().collect())
    }
}

/// Converts anything the driver can bind into an owned [`Value`].
pub fn to_value<T: ToSql + ?Sized>(value: &T) -> Result<Value> {
    Ok(match value.to_sql()? {
        ToSqlOutput::Borrowed(r) => Value::from(r),
        ToSqlOutput::Owned(v) => v,
        other => {
            return Err(AmbitError::Argument(format!("unsupported driver value {other:?}")));
        }
    })
}

/// Converts an owned [`Value`] into a Rust type using the driver's own conversions.
pub fn from_value<T: FromSql>(value: &Value) -> Result<T> {
    T::column_result(ValueRef::from(value))
        .map_err(|e| AmbitError::mapping(format!("cannot convert {value:?}: {e}"), None))
}
