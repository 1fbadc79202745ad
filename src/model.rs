//! What the core needs to know about application types.
//!
//! Rust has no runtime reflection, so a type that should be mapped by name
//! declares its properties once through [`entity!`](crate::entity):
//!
//! ```
//! use ambit::entity;
//! use ambit::model::Entity;
//! use ambit::value::Value;
//!
//! #[derive(Default)]
//! struct User { user_id: Option<i64>, user_name: String }
//! entity!(User { user_id, user_name });
//!
//! let mut u = User::default();
//! u.set_property("user_name", &Value::Text("alice".into())).unwrap();
//! assert_eq!(u.property("user_name").unwrap(), Value::Text("alice".into()));
//! assert_eq!(User::properties(), &["user_id", "user_name"]);
//! ```

use chrono::NaiveDateTime;

use crate::error::{AmbitError, Result};
use crate::value::Value;

/// A type whose fields can be read and written by property name.
pub trait Entity {
    /// Fully qualified name; keys the mapping store.
    const TYPE_NAME: &'static str;
    fn properties() -> &'static [&'static str];
    fn property(&self, name: &str) -> Result<Value>;
    fn set_property(&mut self, name: &str, value: &Value) -> Result<()>;

    /// Resolves a column or property name to the declared property, ignoring case.
    fn resolve_property(name: &str) -> Option<&'static str> {
        Self::properties()
            .iter()
            .find(|p| **p == name)
            .or_else(|| Self::properties().iter().find(|p| p.eq_ignore_ascii_case(name)))
            .copied()
    }
}

/// The lifecycle a repository drives: new or persisted, plus audit marking.
pub trait Model: Clone {
    fn is_new(&self) -> bool;
    fn set_new(&mut self, new: bool);
    /// Recomputes derived fields right before every save or discard.
    fn mark(&mut self, _stamp: &AuditStamp) {}
}

/// When, and on whose behalf, a write is happening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditStamp {
    pub at: NaiveDateTime,
    pub user: i64,
}

/// Creation and modification fields a model can embed and mark.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Audit {
    pub created_at: Option<NaiveDateTime>,
    pub created_by: Option<i64>,
    pub modified_at: Option<NaiveDateTime>,
    pub modified_by: Option<i64>,
}

impl Audit {
    /// Creation fields are set once, modification fields every time.
    pub fn mark(&mut self, stamp: &AuditStamp) {
        if self.created_at.is_none() {
            self.created_at = Some(stamp.at);
            self.created_by = Some(stamp.user);
        }
        self.modified_at = Some(stamp.at);
        self.modified_by = Some(stamp.user);
    }
}

#[doc(hidden)]
pub fn property_error(error: AmbitError, entity: &str, property: &str) -> AmbitError {
    match error {
        AmbitError::Mapping { message, .. } => AmbitError::mapping(format!("property '{property}': {message}"), Some(entity)),
        other => AmbitError::mapping(format!("property '{property}': {other}"), Some(entity)),
    }
}

#[doc(hidden)]
pub fn unknown_property(entity: &str, property: &str) -> AmbitError {
    AmbitError::mapping(format!("no property named '{property}'"), Some(entity))
}

/// Implements [`Entity`] for a struct by listing the fields that take part in mapping.
///
/// The type name defaults to `module_path!()::Type`; give one explicitly with
/// `entity!(Type as "app::Type" => { .. })`. Every listed field must convert to and
/// from a driver value.
#[macro_export]
macro_rules! entity {
    ($ty:ident as $name:expr => { $($field:ident),* $(,)? }) => {
        impl $crate::model::Entity for $ty {
            const TYPE_NAME: &'static str = $name;
            fn properties() -> &'static [&'static str] {
                &[$(stringify!($field)),*]
            }
            fn property(&self, name: &str) -> $crate::error::Result<$crate::value::Value> {
                match name {
                    $(stringify!($field) => $crate::value::to_value(&self.$field)
                        .map_err(|e| $crate::model::property_error(e, Self::TYPE_NAME, name)),)*
                    _ => Err($crate::model::unknown_property(Self::TYPE_NAME, name)),
                }
            }
            fn set_property(&mut self, name: &str, value: &$crate::value::Value) -> $crate::error::Result<()> {
                match name {
                    $(stringify!($field) => {
                        self.$field = $crate::value::from_value(value)
                            .map_err(|e| $crate::model::property_error(e, Self::TYPE_NAME, name))?;
                        Ok(())
                    })*
                    _ => Err($crate::model::unknown_property(Self::TYPE_NAME, name)),
                }
            }
        }
    };
    ($ty:ident { $($field:ident),* $(,)? }) => {
        $crate::entity!($ty as concat!(module_path!(), "::", stringify!($ty)) => { $($field),* });
    };
}
