//! Declarative command dispatch.
//!
//! A [`Contract`] is registered once at startup and describes named methods:
//! the command each one runs, its formal parameters and the shape of its
//! result. [`Dispatcher::call`] resolves a method, turns the caller's
//! arguments into bound parameters, executes according to the return shape
//! and copies output values back into the caller's by-reference arguments.
//!
//! ```
//! use ambit::dispatch::{Arg, CommandAttr, Contract, Dispatcher, MethodSpec, ParamSpec, ReturnShape};
//! use ambit::value::Value;
//! use ambit::Database;
//!
//! let db = Database::in_memory().unwrap();
//! db.execute_batch("create table counter (n integer); insert into counter values (41);").unwrap();
//! db.contracts()
//!     .register(
//!         Contract::builder("Counters")
//!             .database_contract()
//!             .method(
//!                 MethodSpec::new("Bump")
//!                     .command(CommandAttr::text("update counter set n = n + @by returning n"))
//!                     .param(ParamSpec::new("@by"))
//!                     .param(ParamSpec::new("@n"))
//!                     .returns(ReturnShape::RowCount),
//!             )
//!             .build(),
//!     )
//!     .unwrap();
//! let mut n = Value::Null;
//! let result = Dispatcher::new(db)
//!     .call("Counters", "Bump", &mut [Arg::value(1i64), Arg::out(&mut n)])
//!     .unwrap();
//! assert_eq!(result.row_count().unwrap(), 1);
//! assert_eq!(n, Value::Integer(42));
//! ```

use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::{Arc, RwLock};
use std::time::Duration;

// we will use a fast hashing algo for the registry
use seahash::SeaHasher;

use tracing::debug;

use crate::command::{Command, CommandBehavior, CommandType, DataTable, Direction, Parameter};
use crate::database::Database;
use crate::error::{AmbitError, Result};
use crate::unit_of_work::UnitOfWork;
use crate::value::{DbType, SqlType, Value};

// ------------- Metadata -------------

/// What a method's result looks like, and therefore how it is executed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReturnShape {
    /// Executed for effect; nothing is returned.
    #[default]
    Void,
    /// Executed for the affected-row count.
    RowCount,
    /// Executed for the first column of the first row.
    Scalar,
    /// Executed for a reader, materialized into a named table.
    Table { result_set: Option<String>, source_table: Option<String> },
}

impl ReturnShape {
    pub fn table() -> Self {
        ReturnShape::Table { result_set: None, source_table: None }
    }
    pub fn named_table(result_set: impl Into<String>, source_table: impl Into<String>) -> Self {
        ReturnShape::Table { result_set: Some(result_set.into()), source_table: Some(source_table.into()) }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandAttr {
    pub text: String,
    pub command_type: CommandType,
    pub behavior: CommandBehavior,
    pub timeout: Option<Duration>,
    pub prepare: bool,
}

impl CommandAttr {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            command_type: CommandType::Text,
            behavior: CommandBehavior::Default,
            timeout: None,
            prepare: false,
        }
    }
    pub fn table_direct(table: impl Into<String>) -> Self {
        Self { command_type: CommandType::TableDirect, ..Self::text(table) }
    }
    pub fn behavior(mut self, behavior: CommandBehavior) -> Self {
        self.behavior = behavior;
        self
    }
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
    pub fn prepare(mut self) -> Self {
        self.prepare = true;
        self
    }
}

/// A formal parameter; anything left unset is inferred from the argument.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub direction: Option<Direction>,
    pub db_type: Option<DbType>,
    pub size: Option<u32>,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
    pub nullable: bool,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), direction: None, db_type: None, size: None, precision: None, scale: None, nullable: true }
    }
    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }
    pub fn db_type(mut self, db_type: DbType) -> Self {
        self.db_type = Some(db_type);
        self
    }
    pub fn size(mut self, size: u32) -> Self {
        self.size = Some(size);
        self
    }
    pub fn precision(mut self, precision: u8, scale: u8) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodSpec {
    pub name: String,
    pub command: Option<CommandAttr>,
    pub parameters: Vec<ParamSpec>,
    pub returns: ReturnShape,
}

impl MethodSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), command: None, parameters: Vec::new(), returns: ReturnShape::Void }
    }
    pub fn command(mut self, command: CommandAttr) -> Self {
        self.command = Some(command);
        self
    }
    pub fn param(mut self, parameter: ParamSpec) -> Self {
        self.parameters.push(parameter);
        self
    }
    pub fn returns(mut self, shape: ReturnShape) -> Self {
        self.returns = shape;
        self
    }
}

type RegistryHasher = BuildHasherDefault<SeaHasher>;

#[derive(Debug, Clone)]
pub struct Contract {
    pub name: String,
    /// Only database contracts can be dispatched.
    pub database_contract: bool,
    methods: HashMap<String, MethodSpec, RegistryHasher>,
}

impl Contract {
    pub fn builder(name: impl Into<String>) -> ContractBuilder {
        ContractBuilder {
            contract: Contract { name: name.into(), database_contract: false, methods: HashMap::default() },
        }
    }
    pub fn method(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.get(name)
    }
}

pub struct ContractBuilder {
    contract: Contract,
}

impl ContractBuilder {
    pub fn database_contract(mut self) -> Self {
        self.contract.database_contract = true;
        self
    }
    pub fn method(mut self, method: MethodSpec) -> Self {
        self.contract.methods.insert(method.name.clone(), method);
        self
    }
    pub fn build(self) -> Contract {
        self.contract
    }
}

/// Every contract known to a database, registered at startup.
#[derive(Default)]
pub struct ContractRegistry {
    contracts: RwLock<HashMap<String, Arc<Contract>, RegistryHasher>>,
}

impl ContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn register(&self, contract: Contract) -> Result<()> {
        let mut contracts = self.contracts.write()?;
        if contracts.contains_key(&contract.name) {
            return Err(AmbitError::Configuration(format!("contract {} is already registered", contract.name)));
        }
        debug!(contract = %contract.name, methods = contract.methods.len(), "contract registered");
        contracts.insert(contract.name.clone(), Arc::new(contract));
        Ok(())
    }
    pub fn get(&self, name: &str) -> Result<Option<Arc<Contract>>> {
        Ok(self.contracts.read()?.get(name).cloned())
    }
}

// ------------- Arguments and results -------------

/// One actual argument. The variant plays the part of the by-value, by-reference
/// and out shapes a formal parameter can have.
#[derive(Debug)]
pub enum Arg<'a> {
    In { value: Value, db_type: DbType },
    Ref(&'a mut Value),
    Out(&'a mut Value),
}

impl<'a> Arg<'a> {
    pub fn value<T: SqlType>(value: T) -> Self {
        Arg::In { value: value.to_value(), db_type: value.db_type() }
    }
    pub fn by_ref(value: &'a mut Value) -> Self {
        Arg::Ref(value)
    }
    pub fn out(value: &'a mut Value) -> Self {
        Arg::Out(value)
    }
    fn direction(&self) -> Direction {
        match self {
            Arg::In { .. } => Direction::Input,
            Arg::Ref(_) => Direction::InputOutput,
            Arg::Out(_) => Direction::Output,
        }
    }
    fn db_type(&self) -> DbType {
        match self {
            Arg::In { db_type, .. } => *db_type,
            Arg::Ref(value) => DbType::of(value),
            Arg::Out(_) => DbType::Variant,
        }
    }
    fn value_for_binding(&self) -> Value {
        match self {
            Arg::In { value, .. } => value.clone(),
            Arg::Ref(value) => (**value).clone(),
            Arg::Out(_) => Value::Null,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    Unit,
    RowCount(i64),
    Scalar(Value),
    Table(DataTable),
}

impl Dispatched {
    pub fn row_count(&self) -> Result<i64> {
        match self {
            Dispatched::RowCount(n) => Ok(*n),
            other => Err(AmbitError::Argument(format!("{other:?} is not a row count"))),
        }
    }
    pub fn scalar(&self) -> Result<&Value> {
        match self {
            Dispatched::Scalar(v) => Ok(v),
            other => Err(AmbitError::Argument(format!("{other:?} is not a scalar"))),
        }
    }
    pub fn into_table(self) -> Result<DataTable> {
        match self {
            Dispatched::Table(table) => Ok(table),
            other => Err(AmbitError::Argument(format!("{other:?} is not a table"))),
        }
    }
}

// ------------- Dispatch -------------

pub struct Dispatcher {
    database: Database,
}

impl Dispatcher {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    /// Dispatches in the ambient unit of work, owning one if none exists.
    pub fn call(&self, contract: &str, method: &str, args: &mut [Arg<'_>]) -> Result<Dispatched> {
        let (returns, mut command) = self.resolve(contract, method, args)?;
        let scope = match returns {
            ReturnShape::Void | ReturnShape::RowCount => self.database.write_scope()?,
            ReturnShape::Scalar | ReturnShape::Table { .. } => self.database.scope()?,
        };
        let result = execute(&scope, &returns, &mut command)?;
        scope.complete();
        scope.close()?;
        copy_back(&command, args);
        Ok(result)
    }
    pub fn call_in(&self, unit: &UnitOfWork, contract: &str, method: &str, args: &mut [Arg<'_>]) -> Result<Dispatched> {
        let (returns, mut command) = self.resolve(contract, method, args)?;
        self.database.ensure_owns(unit)?;
        let result = execute(unit, &returns, &mut command)?;
        copy_back(&command, args);
        Ok(result)
    }

    /// Everything that can be checked without touching the database.
    fn resolve(&self, contract_name: &str, method_name: &str, args: &[Arg<'_>]) -> Result<(ReturnShape, Command)> {
        let contract = self
            .database
            .contracts()
            .get(contract_name)?
            .ok_or_else(|| AmbitError::Configuration(format!("{contract_name} is not a registered contract")))?;
        if !contract.database_contract {
            return Err(AmbitError::Configuration(format!("{contract_name} is not a database contract")));
        }
        let method = contract
            .method(method_name)
            .ok_or_else(|| AmbitError::Configuration(format!("{contract_name} has no method {method_name}")))?;
        let attr = method
            .command
            .as_ref()
            .ok_or_else(|| AmbitError::Configuration(format!("{contract_name}.{method_name} carries no command")))?;
        if args.len() != method.parameters.len() {
            return Err(AmbitError::Argument(format!(
                "{contract_name}.{method_name} takes {} arguments, got {}",
                method.parameters.len(),
                args.len()
            )));
        }
        let mut command = Command::new(attr.text.clone());
        command.command_type = attr.command_type;
        command.behavior = attr.behavior;
        command.timeout = attr.timeout;
        command.prepare = attr.prepare;
        for (formal, arg) in method.parameters.iter().zip(args) {
            let direction = resolve_direction(formal, arg)?;
            let shape = arg.db_type();
            if shape.is_character() {
                return Err(AmbitError::Argument(format!(
                    "argument for '{}' is of type {shape}; pass characters as text",
                    formal.name
                )));
            }
            let db_type = formal.db_type.unwrap_or(shape);
            let value = if direction.is_input() { arg.value_for_binding() } else { Value::Null };
            let parameter = Parameter {
                name: formal.name.clone(),
                direction,
                db_type,
                size: formal.size,
                precision: formal.precision,
                scale: formal.scale,
                nullable: formal.nullable,
                value,
            };
            parameter.validate()?;
            command.parameters.push(parameter);
        }
        let return_values = command.parameters.iter().filter(|p| p.direction == Direction::ReturnValue).count();
        if return_values > 1 {
            return Err(AmbitError::Configuration(format!(
                "{contract_name}.{method_name} declares {return_values} return-value parameters"
            )));
        }
        if attr.behavior == CommandBehavior::SchemaOnly && !matches!(method.returns, ReturnShape::Table { .. }) {
            return Err(AmbitError::Configuration(format!(
                "{contract_name}.{method_name} reads only a schema but does not return a table"
            )));
        }
        Ok((method.returns.clone(), command))
    }
}

fn resolve_direction(formal: &ParamSpec, arg: &Arg<'_>) -> Result<Direction> {
    let shape = arg.direction();
    let Some(declared) = formal.direction else {
        return Ok(shape);
    };
    let fits = match declared {
        Direction::Input => !matches!(arg, Arg::Out(_)),
        Direction::Output | Direction::InputOutput | Direction::ReturnValue => !matches!(arg, Arg::In { .. }),
    };
    if !fits {
        return Err(AmbitError::Configuration(format!(
            "parameter '{}' is declared {declared:?} but the argument is {shape:?}",
            formal.name
        )));
    }
    Ok(declared)
}

fn execute(unit: &UnitOfWork, returns: &ReturnShape, command: &mut Command) -> Result<Dispatched> {
    Ok(match returns {
        ReturnShape::Void => {
            unit.execute_non_query(command)?;
            Dispatched::Unit
        }
        ReturnShape::RowCount => Dispatched::RowCount(unit.execute_non_query(command)?),
        ReturnShape::Scalar => Dispatched::Scalar(unit.execute_scalar(command)?),
        ReturnShape::Table { result_set, source_table } => {
            let mut table = unit.execute_reader(command)?;
            table.name = result_set.clone();
            table.source_table = source_table.clone();
            Dispatched::Table(table)
        }
    })
}

fn copy_back(command: &Command, args: &mut [Arg<'_>]) {
    for (parameter, arg) in command.parameters.iter().zip(args.iter_mut()) {
        if !parameter.direction.is_output() {
            continue;
        }
        if let Arg::Ref(target) | Arg::Out(target) = arg {
            **target = parameter.value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn database() -> Database {
        let db = Database::in_memory().unwrap();
        db.execute_batch(
            "create table account (id integer primary key, owner text not null, balance real not null);
             insert into account (owner, balance) values ('ann', 10.0), ('bob', 20.0);",
        )
        .unwrap();
        db.contracts()
            .register(
                Contract::builder("Accounts")
                    .database_contract()
                    .method(
                        MethodSpec::new("Owners")
                            .command(CommandAttr::text("select owner from account order by id"))
                            .returns(ReturnShape::named_table("owners", "account")),
                    )
                    .method(
                        MethodSpec::new("Total")
                            .command(CommandAttr::text("select sum(balance) from account"))
                            .returns(ReturnShape::Scalar),
                    )
                    .method(
                        MethodSpec::new("Deposit")
                            .command(CommandAttr::text(
                                "update account set balance = balance + @amount where owner = @owner returning balance",
                            ))
                            .param(ParamSpec::new("@owner").size(8))
                            .param(ParamSpec::new("@amount").db_type(DbType::Real).precision(10, 2))
                            .param(ParamSpec::new("@balance"))
                            .param(ParamSpec::new("@rows").direction(Direction::ReturnValue))
                            .returns(ReturnShape::RowCount),
                    )
                    .method(
                        MethodSpec::new("Open")
                            .command(CommandAttr::text("insert into account (owner, balance) values (@owner, 0)"))
                            .param(ParamSpec::new("@owner").db_type(DbType::Text)),
                    )
                    .method(MethodSpec::new("Undecorated"))
                    .build(),
            )
            .unwrap();
        db.contracts().register(Contract::builder("Plain").build()).unwrap();
        db
    }

    #[test]
    fn return_shapes_pick_the_execution() {
        let dispatcher = Dispatcher::new(database());
        let table = dispatcher.call("Accounts", "Owners", &mut []).unwrap().into_table().unwrap();
        assert_eq!(table.name.as_deref(), Some("owners"));
        assert_eq!(table.source_table.as_deref(), Some("account"));
        assert_eq!(table.row_count(), 2);
        let total = dispatcher.call("Accounts", "Total", &mut []).unwrap();
        assert_eq!(total.scalar().unwrap(), &Value::Real(30.0));
    }

    #[test]
    fn outputs_flow_back_into_reference_arguments() {
        let dispatcher = Dispatcher::new(database());
        let mut balance = Value::Null;
        let mut rows = Value::Null;
        let result = dispatcher
            .call(
                "Accounts",
                "Deposit",
                &mut [Arg::value("ann"), Arg::value(2.5f64), Arg::out(&mut balance), Arg::out(&mut rows)],
            )
            .unwrap();
        assert_eq!(result, Dispatched::RowCount(1));
        assert_eq!(balance, Value::Real(12.5));
        assert_eq!(rows, Value::Integer(1));
    }

    #[test]
    fn metadata_problems_are_configuration_errors() {
        let dispatcher = Dispatcher::new(database());
        let configuration = |r: Result<Dispatched>| matches!(r, Err(AmbitError::Configuration(_)));
        assert!(configuration(dispatcher.call("Missing", "Owners", &mut [])));
        assert!(configuration(dispatcher.call("Plain", "Owners", &mut [])));
        assert!(configuration(dispatcher.call("Accounts", "Missing", &mut [])));
        assert!(configuration(dispatcher.call("Accounts", "Undecorated", &mut [])));
        let mut rows = Value::Null;
        let by_value_return = dispatcher.call(
            "Accounts",
            "Deposit",
            &mut [Arg::value("ann"), Arg::value(1.0f64), Arg::out(&mut rows), Arg::value(0i64)],
        );
        assert!(configuration(by_value_return));
    }

    #[test]
    fn argument_problems_are_rejected_before_execution() {
        let db = database();
        let dispatcher = Dispatcher::new(db.clone());
        let argument = |r: Result<Dispatched>| matches!(r, Err(AmbitError::Argument(_)));
        assert!(argument(dispatcher.call("Accounts", "Total", &mut [Arg::value(1i64)])));
        let (mut a, mut b) = (Value::Null, Value::Null);
        assert!(argument(dispatcher.call(
            "Accounts",
            "Deposit",
            &mut [Arg::value('a'), Arg::value(1.0f64), Arg::out(&mut a), Arg::out(&mut b)],
        )));
        assert!(argument(dispatcher.call(
            "Accounts",
            "Deposit",
            &mut [Arg::value("a name that is too long"), Arg::value(1.0f64), Arg::out(&mut a), Arg::out(&mut b)],
        )));
        // a declared text type does not make a character argument acceptable
        assert!(argument(dispatcher.call("Accounts", "Open", &mut [Arg::value('x')])));
        assert!(argument(dispatcher.call("Accounts", "Open", &mut [Arg::value(vec!['c', 'y'])])));
        assert!(db.current().is_none());
        let total = dispatcher.call("Accounts", "Total", &mut []).unwrap();
        assert_eq!(total.scalar().unwrap(), &Value::Real(30.0));
        let owners = dispatcher.call("Accounts", "Owners", &mut []).unwrap().into_table().unwrap();
        assert_eq!(owners.row_count(), 2);
        dispatcher.call("Accounts", "Open", &mut [Arg::value("cy")]).unwrap();
    }

    #[test]
    fn nested_calls_join_the_ambient_unit() {
        let db = database();
        let dispatcher = Dispatcher::new(db.clone());
        {
            let scope = db.scope().unwrap();
            let (mut a, mut b) = (Value::Null, Value::Null);
            dispatcher
                .call("Accounts", "Deposit", &mut [Arg::value("bob"), Arg::value(5.0f64), Arg::out(&mut a), Arg::out(&mut b)])
                .unwrap();
            assert!(!scope.is_completed());
            // never completed: the deposit is rolled back
        }
        let total = dispatcher.call("Accounts", "Total", &mut []).unwrap();
        assert_eq!(total.scalar().unwrap(), &Value::Real(30.0));
    }
}
