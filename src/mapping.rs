//! Declarative mapping documents and the store that loads them.
//!
//! One JSON document per entity type describes the commands used to select,
//! insert, update and delete it: command text, ordered parameters and the
//! result-column to property field list. Documents are versioned, validated
//! on load and fingerprinted, and they round-trip through `to_json` /
//! `from_json` without loss:
//!
//! ```json
//! {
//!   "version": 1,
//!   "entity": "shop::Product",
//!   "commands": [
//!     { "kind": "select", "text": "select * from product where id = @id",
//!       "parameters": [ { "name": "@id", "type": "integer" } ] }
//!   ]
//! }
//! ```
//!
//! The [`MappingStore`] loads a document at most once per entity type and
//! hands out the same immutable [`EntityMapping`] afterwards.

use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

// used to keep the one-to-one mapping between columns and properties
use bimap::BiMap;

// names in documents have to look like names
use lazy_static::lazy_static;
use regex::Regex;

// we will use a fast hashing algo for the cache
use seahash::SeaHasher;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::command::{Command, CommandBehavior, CommandType, Direction, Parameter, bare};
use crate::error::{AmbitError, Result};
use crate::model::Entity;
use crate::value::{DbType, Value};

/// The document format this crate reads and writes.
pub const MAPPING_VERSION: u32 = 1;

lazy_static! {
    static ref ENTITY_NAME: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(::[A-Za-z_][A-Za-z0-9_]*)*$").unwrap();
    static ref PARAMETER_NAME: Regex = Regex::new(r"^[@:$]?[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Select,
    Insert,
    Update,
    Delete,
}

fn nullable_by_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterDescriptor {
    pub name: String,
    #[serde(default)]
    pub direction: Direction,
    #[serde(rename = "type")]
    pub db_type: DbType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u8>,
    #[serde(default = "nullable_by_default")]
    pub nullable: bool,
    /// The bound property; defaults to the parameter's bare name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property: Option<String>,
}

impl ParameterDescriptor {
    pub fn property_name(&self) -> &str {
        self.property.as_deref().unwrap_or_else(|| bare(&self.name))
    }
    fn placeholder(&self) -> Parameter {
        Parameter {
            name: self.name.clone(),
            direction: self.direction,
            db_type: self.db_type,
            size: self.size,
            precision: self.precision,
            scale: self.scale,
            nullable: self.nullable,
            value: Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldDescriptor {
    pub column: String,
    pub property: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandDescriptor {
    pub kind: CommandKind,
    pub text: String,
    #[serde(default)]
    pub command_type: CommandType,
    #[serde(default)]
    pub behavior: CommandBehavior,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub prepare: bool,
    #[serde(default)]
    pub parameters: Vec<ParameterDescriptor>,
    /// Empty means every result column maps to the same-named property.
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

impl CommandDescriptor {
    /// A command with every parameter registered as a null placeholder.
    pub fn command(&self) -> Command {
        let mut command = Command::new(self.text.clone());
        command.command_type = self.command_type;
        command.behavior = self.behavior;
        command.timeout = self.timeout_ms.map(Duration::from_millis);
        command.prepare = self.prepare;
        command.parameters = self.parameters.iter().map(ParameterDescriptor::placeholder).collect();
        command
    }

    fn validate(&self) -> Result<()> {
        let kind = self.kind;
        if self.text.trim().is_empty() {
            return Err(AmbitError::mapping(format!("{kind:?} command has no text"), None));
        }
        let mut seen = Vec::new();
        for parameter in &self.parameters {
            if !PARAMETER_NAME.is_match(&parameter.name) {
                return Err(AmbitError::mapping(format!("'{}' is not a parameter name", parameter.name), None));
            }
            let bare_name = bare(&parameter.name).to_ascii_lowercase();
            if seen.contains(&bare_name) {
                return Err(AmbitError::mapping(
                    format!("{kind:?} command declares '{}' twice", parameter.name),
                    None,
                ));
            }
            seen.push(bare_name);
            if parameter.db_type.is_character() {
                return Err(AmbitError::mapping(
                    format!("parameter '{}' is of type {}; use text", parameter.name, parameter.db_type),
                    None,
                ));
            }
        }
        let mut fields = BiMap::new();
        for field in &self.fields {
            if fields.insert_no_overwrite(field.column.to_ascii_lowercase(), field.property.as_str()).is_err() {
                return Err(AmbitError::mapping(
                    format!("field '{}' -> '{}' is not one-to-one", field.column, field.property),
                    None,
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MappingDocument {
    pub version: u32,
    pub entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub commands: Vec<CommandDescriptor>,
}

impl MappingDocument {
    pub fn from_json(json: &str) -> Result<Self> {
        let document: MappingDocument = serde_json::from_str(json)?;
        document.validate()?;
        Ok(document)
    }
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
    pub fn from_path(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| AmbitError::mapping(format!("cannot read {}: {e}", path.display()), None))?;
        Self::from_json(&json)
    }
    pub fn validate(&self) -> Result<()> {
        let entity = Some(self.entity.as_str());
        if self.version != MAPPING_VERSION {
            return Err(AmbitError::mapping(
                format!("document version {} is not {MAPPING_VERSION}", self.version),
                entity,
            ));
        }
        if !ENTITY_NAME.is_match(&self.entity) {
            return Err(AmbitError::mapping("entity is not a qualified type name", entity));
        }
        let mut kinds = Vec::new();
        for command in &self.commands {
            if kinds.contains(&command.kind) {
                return Err(AmbitError::mapping(format!("{:?} command declared twice", command.kind), entity));
            }
            kinds.push(command.kind);
            command.validate().map_err(|e| match e {
                AmbitError::Mapping { message, .. } => AmbitError::mapping(message, entity),
                other => other,
            })?;
        }
        Ok(())
    }
    /// Hex blake3 digest of the canonical serialization.
    pub fn fingerprint(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self)?;
        Ok(blake3::hash(&canonical).to_hex().to_string())
    }
    pub fn command(&self, kind: CommandKind) -> Option<&CommandDescriptor> {
        self.commands.iter().find(|c| c.kind == kind)
    }
    /// The file name this document is looked up under in a mapping directory.
    pub fn file_name(entity: &str) -> String {
        format!("{}.json", entity.replace("::", "."))
    }
}

/// A validated document as handed out by the store.
#[derive(Debug, Clone)]
pub struct EntityMapping {
    pub document: MappingDocument,
    pub fingerprint: String,
}

impl EntityMapping {
    pub fn new(document: MappingDocument) -> Result<Self> {
        document.validate()?;
        let fingerprint = document.fingerprint()?;
        Ok(Self { document, fingerprint })
    }
    pub fn entity(&self) -> &str {
        &self.document.entity
    }
    pub fn command(&self, kind: CommandKind) -> Result<&CommandDescriptor> {
        self.document.command(kind).ok_or_else(|| {
            AmbitError::Configuration(format!("{} has no {kind:?} command", self.document.entity))
        })
    }
    /// Checks that every property the document names exists on `M`.
    pub fn validate_against<M: Entity>(&self) -> Result<()> {
        let entity = Some(self.document.entity.as_str());
        for command in &self.document.commands {
            for parameter in &command.parameters {
                let named = parameter.property.is_some() || parameter.direction.is_input();
                if named && M::resolve_property(parameter.property_name()).is_none() {
                    return Err(AmbitError::mapping(
                        format!("parameter '{}' binds unknown property '{}'", parameter.name, parameter.property_name()),
                        entity,
                    ));
                }
            }
            for field in &command.fields {
                if M::resolve_property(&field.property).is_none() {
                    return Err(AmbitError::mapping(
                        format!("field '{}' maps to unknown property '{}'", field.column, field.property),
                        entity,
                    ));
                }
            }
        }
        Ok(())
    }
}

type MappingHasher = BuildHasherDefault<SeaHasher>;

/// Loads mapping documents once per entity type and caches them.
pub struct MappingStore {
    dir: Option<PathBuf>,
    mappings: RwLock<HashMap<String, Arc<EntityMapping>, MappingHasher>>,
    loads: AtomicUsize,
}

impl MappingStore {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir, mappings: RwLock::new(HashMap::default()), loads: AtomicUsize::new(0) }
    }
    /// Adds a document directly; an entity can only ever be registered once.
    pub fn register(&self, document: MappingDocument) -> Result<Arc<EntityMapping>> {
        let mapping = Arc::new(EntityMapping::new(document)?);
        let mut mappings = self.mappings.write()?;
        if mappings.contains_key(mapping.entity()) {
            return Err(AmbitError::Configuration(format!("{} is already mapped", mapping.entity())));
        }
        mappings.insert(mapping.entity().to_string(), Arc::clone(&mapping));
        self.loads.fetch_add(1, Ordering::Relaxed);
        info!(entity = %mapping.entity(), fingerprint = %mapping.fingerprint, "mapping registered");
        Ok(mapping)
    }
    pub fn register_json(&self, json: &str) -> Result<Arc<EntityMapping>> {
        self.register(MappingDocument::from_json(json)?)
    }
    /// The mapping of `M`, read from the mapping directory on first use.
    pub fn get<M: Entity>(&self) -> Result<Arc<EntityMapping>> {
        let mapping = self.get_by_name(M::TYPE_NAME)?;
        mapping.validate_against::<M>()?;
        Ok(mapping)
    }
    pub fn get_by_name(&self, entity: &str) -> Result<Arc<EntityMapping>> {
        if let Some(mapping) = self.mappings.read()?.get(entity) {
            return Ok(Arc::clone(mapping));
        }
        let Some(dir) = &self.dir else {
            return Err(AmbitError::Configuration(format!("no mapping for {entity} and no mapping directory")));
        };
        let path = dir.join(MappingDocument::file_name(entity));
        let mut mappings = self.mappings.write()?;
        // another thread may have loaded it while we waited for the lock
        if let Some(mapping) = mappings.get(entity) {
            return Ok(Arc::clone(mapping));
        }
        let document = MappingDocument::from_path(&path)?;
        if document.entity != entity {
            return Err(AmbitError::mapping(
                format!("{} describes {}", path.display(), document.entity),
                Some(entity),
            ));
        }
        let mapping = Arc::new(EntityMapping::new(document)?);
        mappings.insert(entity.to_string(), Arc::clone(&mapping));
        self.loads.fetch_add(1, Ordering::Relaxed);
        info!(entity, path = %path.display(), fingerprint = %mapping.fingerprint, "mapping loaded");
        Ok(mapping)
    }
    pub fn contains(&self, entity: &str) -> bool {
        self.mappings.read().map(|m| m.contains_key(entity)).unwrap_or(false)
    }
    /// How many documents were read or registered; cache hits do not count.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }
}

// ------------- Row and parameter mapping -------------

/// Copies one result row onto `model` following the descriptor's field list.
pub fn map_row<M: Entity>(
    descriptor: &CommandDescriptor,
    columns: &[String],
    values: &[Value],
    model: &mut M,
) -> Result<()> {
    if descriptor.fields.is_empty() {
        for (column, value) in columns.iter().zip(values) {
            if let Some(property) = M::resolve_property(column) {
                model.set_property(property, value)?;
            }
        }
        return Ok(());
    }
    for field in &descriptor.fields {
        let index = columns.iter().position(|c| c.eq_ignore_ascii_case(&field.column)).ok_or_else(|| {
            AmbitError::mapping(format!("result has no column '{}'", field.column), Some(M::TYPE_NAME))
        })?;
        let property = M::resolve_property(&field.property).ok_or_else(|| {
            AmbitError::mapping(format!("no writable property '{}'", field.property), Some(M::TYPE_NAME))
        })?;
        let value = values.get(index).cloned().unwrap_or(Value::Null);
        model.set_property(property, &value)?;
    }
    Ok(())
}

/// Builds the command, sourcing input parameters from `model`.
pub fn bind_parameters<M: Entity>(descriptor: &CommandDescriptor, model: &M) -> Result<Command> {
    let mut command = descriptor.command();
    for (parameter, declared) in command.parameters.iter_mut().zip(&descriptor.parameters) {
        if !declared.direction.is_input() {
            continue;
        }
        let property = M::resolve_property(declared.property_name()).ok_or_else(|| {
            AmbitError::mapping(
                format!("parameter '{}' has no property '{}'", declared.name, declared.property_name()),
                Some(M::TYPE_NAME),
            )
        })?;
        parameter.value = model.property(property)?;
    }
    Ok(command)
}

/// Writes output, in-out and return values back onto the properties they bind.
pub fn copy_outputs<M: Entity>(descriptor: &CommandDescriptor, command: &Command, model: &mut M) -> Result<()> {
    for (parameter, declared) in command.parameters.iter().zip(&descriptor.parameters) {
        if !declared.direction.is_output() {
            continue;
        }
        match M::resolve_property(declared.property_name()) {
            Some(property) => model.set_property(property, &parameter.value)?,
            None if declared.property.is_some() => {
                return Err(AmbitError::mapping(
                    format!("no writable property '{}'", declared.property_name()),
                    Some(M::TYPE_NAME),
                ));
            }
            // an unbound return value is just not copied anywhere
            None => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRODUCT: &str = r#"{
        "version": 1,
        "entity": "shop::Product",
        "table": "product",
        "commands": [
            { "kind": "select", "text": "select id, code as product_code from product where id = @id",
              "parameters": [ { "name": "@id", "type": "integer" } ],
              "fields": [ { "column": "id", "property": "id" }, { "column": "product_code", "property": "code" } ] },
            { "kind": "insert", "text": "insert into product (code) values (@code) returning id",
              "timeout_ms": 250, "prepare": true,
              "parameters": [
                { "name": "@code", "type": "text", "size": 8, "nullable": false },
                { "name": "@id", "direction": "output", "type": "integer" },
                { "name": "@rows", "direction": "return_value", "type": "integer" }
              ] }
        ]
    }"#;

    #[derive(Debug, Default, PartialEq)]
    struct Product {
        id: Option<i64>,
        code: String,
    }
    crate::entity!(Product as "shop::Product" => { id, code });

    #[test]
    fn documents_round_trip_without_loss() {
        let document = MappingDocument::from_json(PRODUCT).unwrap();
        let again = MappingDocument::from_json(&document.to_json().unwrap()).unwrap();
        assert_eq!(document, again);
        assert_eq!(document.fingerprint().unwrap(), again.fingerprint().unwrap());
        let insert = document.command(CommandKind::Insert).unwrap();
        assert_eq!(insert.parameters[0].size, Some(8));
        assert!(!insert.parameters[0].nullable);
        assert!(insert.parameters[1].nullable);
        assert_eq!(MappingDocument::file_name("shop::Product"), "shop.Product.json");
    }

    #[test]
    fn invalid_documents_are_rejected() {
        let bad_version = PRODUCT.replace("\"version\": 1", "\"version\": 2");
        assert!(matches!(MappingDocument::from_json(&bad_version), Err(AmbitError::Mapping { .. })));
        let duplicate = PRODUCT.replace("\"@rows\"", "\"@code\"");
        assert!(MappingDocument::from_json(&duplicate).is_err());
        let char_type = PRODUCT.replace("\"type\": \"text\"", "\"type\": \"char\"");
        assert!(MappingDocument::from_json(&char_type).is_err());
        let not_one_to_one = PRODUCT.replace("\"property\": \"code\"", "\"property\": \"id\"");
        assert!(MappingDocument::from_json(&not_one_to_one).is_err());
        let unknown_field = PRODUCT.replace("\"prepare\": true", "\"prepared\": true");
        assert!(MappingDocument::from_json(&unknown_field).is_err());
    }

    #[test]
    fn store_loads_each_entity_once() {
        let dir = std::env::temp_dir().join(format!("ambit_mappings_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("shop.Product.json"), PRODUCT).unwrap();
        let store = MappingStore::new(Some(dir.clone()));
        let first = store.get::<Product>().unwrap();
        let second = store.get::<Product>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.load_count(), 1);
        assert!(store.register_json(PRODUCT).is_err());
        assert!(store.get_by_name("shop::Missing").is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rows_and_parameters_follow_the_descriptors() {
        let document = MappingDocument::from_json(PRODUCT).unwrap();
        let select = document.command(CommandKind::Select).unwrap();
        let mut product = Product::default();
        let columns = vec!["id".to_string(), "product_code".to_string()];
        map_row(select, &columns, &[Value::Integer(4), Value::Text("A-1".into())], &mut product).unwrap();
        assert_eq!(product, Product { id: Some(4), code: "A-1".into() });
        let missing = map_row(select, &columns[..1], &[Value::Integer(4)], &mut product);
        assert!(matches!(missing, Err(AmbitError::Mapping { .. })));

        let insert = document.command(CommandKind::Insert).unwrap();
        let mut command = bind_parameters(insert, &product).unwrap();
        assert_eq!(command.value("@code"), Some(&Value::Text("A-1".into())));
        assert_eq!(command.value("@id"), Some(&Value::Null));
        assert_eq!(command.timeout, Some(Duration::from_millis(250)));
        command.parameters[1].value = Value::Integer(9);
        command.parameters[2].value = Value::Integer(1);
        copy_outputs(insert, &command, &mut product).unwrap();
        assert_eq!(product.id, Some(9));
    }
}
