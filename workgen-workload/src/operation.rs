//! Operation trees.
//!
//! An [`Operation`] is one action against a table (or a pure grouping node),
//! optionally wrapped in a [`Transaction`], followed by an ordered list of
//! child operations that can be repeated. Threads replay a list of these
//! trees.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::trace;
use workgen_engine::EngineResult;

use crate::context::Context;
use crate::environment::ThreadEnvironment;
use crate::error::{ConfigError, WorkgenError, WorkgenResult};
use crate::keygen::{Key, Value};
use crate::table::{StatKind, Table, TableStats};
use crate::transaction::Transaction;

/// What an operation does to its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    /// Grouping only, no engine call.
    #[default]
    None,
    /// Insert a freshly minted record.
    Insert,
    /// Remove an existing record.
    Remove,
    /// Look up an existing record.
    Search,
    /// Overwrite an existing record.
    Update,
}

impl OpType {
    /// Returns the lowercase name used in logs and profiles.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Insert => "insert",
            Self::Remove => "remove",
            Self::Search => "search",
            Self::Update => "update",
        }
    }

    /// Returns true for operations that modify the table.
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Insert | Self::Remove | Self::Update)
    }

    /// Returns true for operations that need a value generator.
    #[must_use]
    pub const fn needs_value(self) -> bool {
        matches!(self, Self::Insert | Self::Update)
    }

    const fn stat_kind(self) -> Option<StatKind> {
        match self {
            Self::None => None,
            Self::Insert => Some(StatKind::Insert),
            Self::Remove => Some(StatKind::Remove),
            Self::Search => Some(StatKind::Read),
            Self::Update => Some(StatKind::Update),
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
struct Target {
    table: Table,
    key: Key,
    value: Option<Value>,
}

/// A node in an operation tree.
#[derive(Debug, Clone, Default)]
pub struct Operation {
    op_type: OpType,
    target: Option<Target>,
    transaction: Option<Transaction>,
    children: Vec<Operation>,
    repeat_children: u32,
}

impl Operation {
    /// Creates an operation against `table` with both generators.
    #[must_use]
    pub fn new(op_type: OpType, table: Table, key: Key, value: Value) -> Self {
        Self {
            op_type,
            target: Some(Target {
                table,
                key,
                value: Some(value),
            }),
            ..Self::default()
        }
    }

    /// Creates an operation without a value generator.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingValue`] for inserts and updates.
    pub fn without_value(op_type: OpType, table: Table, key: Key) -> Result<Self, ConfigError> {
        if op_type.needs_value() {
            return Err(ConfigError::MissingValue {
                op: op_type.as_str(),
            });
        }
        Ok(Self {
            op_type,
            target: Some(Target {
                table,
                key,
                value: None,
            }),
            ..Self::default()
        })
    }

    /// Creates a grouping node that only runs its children.
    #[must_use]
    pub fn group(children: Vec<Self>) -> Self {
        Self {
            children,
            ..Self::default()
        }
    }

    /// Wraps this node and its children in a transaction.
    #[must_use]
    pub fn with_transaction(mut self, transaction: Transaction) -> Self {
        self.transaction = Some(transaction);
        self
    }

    /// Sets the children and how many times the child sequence runs.
    #[must_use]
    pub fn with_children(mut self, children: Vec<Self>, repeat: u32) -> Self {
        self.children = children;
        self.repeat_children = repeat;
        self
    }

    /// Returns the operation type.
    #[must_use]
    pub const fn op_type(&self) -> OpType {
        self.op_type
    }

    /// Returns the table, if the node has one.
    #[must_use]
    pub fn table(&self) -> Option<&Table> {
        self.target.as_ref().map(|t| &t.table)
    }

    /// Returns the key generator, if the node has one.
    #[must_use]
    pub fn key(&self) -> Option<&Key> {
        self.target.as_ref().map(|t| &t.key)
    }

    /// Returns the value generator, if the node has one.
    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.target.as_ref().and_then(|t| t.value.as_ref())
    }

    /// Returns the transaction, if any.
    #[must_use]
    pub const fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    /// Returns the children.
    #[must_use]
    pub fn children(&self) -> &[Self] {
        &self.children
    }

    /// Returns how many times the child sequence runs per execution.
    #[must_use]
    pub const fn repeat_children(&self) -> u32 {
        self.repeat_children
    }

    /// Binds every table in the tree to `context` and validates the tree.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] for an empty table name, a missing value
    /// generator, or a transaction nested inside another one.
    pub fn create_all(&mut self, context: &mut Context, in_txn: bool) -> Result<(), ConfigError> {
        if let Some(target) = self.target.as_mut() {
            if target.table.name().is_empty() {
                return Err(ConfigError::EmptyTableName);
            }
            if self.op_type.needs_value() && target.value.is_none() {
                return Err(ConfigError::MissingValue {
                    op: self.op_type.as_str(),
                });
            }
            let index = context.assign(target.table.name());
            target.table.bind(context.id(), index);
        } else if self.op_type != OpType::None {
            return Err(ConfigError::MissingTable {
                op: self.op_type.as_str(),
            });
        }

        if in_txn && self.transaction.is_some() {
            return Err(ConfigError::NestedTransaction {
                table: self
                    .table()
                    .map_or_else(|| "none".to_string(), |t| t.name().to_string()),
            });
        }
        let child_txn = in_txn || self.transaction.is_some();
        for child in &mut self.children {
            child.create_all(context, child_txn)?;
        }
        Ok(())
    }

    /// Adds one count per configured action in the tree to `stats`.
    pub fn static_counts(&self, stats: &mut TableStats) {
        if let Some(kind) = self.op_type.stat_kind() {
            stats.record(kind);
        }
        for child in &self.children {
            child.static_counts(stats);
        }
    }

    /// Calls `f` for every table in the tree, parents before children.
    pub fn visit_tables(&self, f: &mut impl FnMut(&Table)) {
        if let Some(target) = &self.target {
            f(&target.table);
        }
        for child in &self.children {
            child.visit_tables(f);
        }
    }

    /// Returns the largest key and value sizes in the tree.
    #[must_use]
    pub fn buffer_sizes(&self) -> (usize, usize) {
        let own = self.target.as_ref().map_or((0, 0), |t| {
            (t.key.size(), t.value.as_ref().map_or(0, Value::size))
        });
        self.children.iter().fold(own, |(k, v), child| {
            let (ck, cv) = child.buffer_sizes();
            (k.max(ck), v.max(cv))
        })
    }

    /// Executes the node, then its children, inside the thread's environment.
    ///
    /// A missing record is counted as a failed read and is not an error.
    ///
    /// # Errors
    ///
    /// Returns the first engine, integrity or configuration error. An open
    /// transaction is rolled back before the error is returned.
    pub fn run(&self, env: &mut ThreadEnvironment<'_>) -> WorkgenResult<()> {
        let Some(txn) = &self.transaction else {
            return self.run_body(env);
        };
        env.session_mut()?
            .begin_transaction(&txn.begin_config)
            .map_err(|e| WorkgenError::engine("begin_transaction", e))?;
        let result = self.run_body(env);
        let session = env.session_mut()?;
        match result {
            Err(e) => {
                let _ = session.rollback_transaction();
                env.note_rollback();
                Err(e)
            }
            Ok(()) if txn.rollback => {
                session
                    .rollback_transaction()
                    .map_err(|e| WorkgenError::engine("rollback_transaction", e))?;
                env.note_rollback();
                Ok(())
            }
            Ok(()) => {
                let committed = session.commit_transaction(&txn.commit_config);
                match committed {
                    Ok(()) => {
                        env.note_commit();
                        Ok(())
                    }
                    Err(e) => {
                        env.note_rollback();
                        Err(WorkgenError::engine("commit_transaction", e))
                    }
                }
            }
        }
    }

    fn run_body(&self, env: &mut ThreadEnvironment<'_>) -> WorkgenResult<()> {
        self.run_action(env)?;
        if !self.children.is_empty() {
            for _ in 0..self.repeat_children.max(1) {
                for child in &self.children {
                    child.run(env)?;
                }
            }
        }
        Ok(())
    }

    fn run_action(&self, env: &mut ThreadEnvironment<'_>) -> WorkgenResult<()> {
        let (Some(target), Some(kind)) = (&self.target, self.op_type.stat_kind()) else {
            return Ok(());
        };
        let table = &target.table;
        let binding = table
            .binding()
            .ok_or_else(|| ConfigError::UnregisteredTable {
                name: table.name().to_string(),
            })?;
        let context = env.context();
        if binding.context_id != context.id() {
            return Err(ConfigError::ContextMismatch {
                table: table.name().to_string(),
                bound: binding.context_id,
                running: context.id(),
            }
            .into());
        }
        let index = binding.recno_index;
        env.note_usage(index, self.op_type.is_write());

        let recno = if self.op_type == OpType::Insert {
            context.next_recno(index)
        } else {
            match target.key.sample(context.current_max(index), env.rng_mut()) {
                Some(recno) => recno,
                None => {
                    table.stats().record(StatKind::FailedRead);
                    return Ok(());
                }
            }
        };

        target.key.encode(recno, &mut env.key_buf)?;
        let validate = self.op_type == OpType::Search && env.validate_reads();
        match &target.value {
            Some(value) if self.op_type.needs_value() || validate => {
                value.encode(recno, &mut env.value_buf)?;
            }
            _ => env.value_buf.clear(),
        }

        let started = env.latency_start();
        let outcome = self.call_engine(env)?;
        env.record_latency(started);
        trace!(op = %self.op_type, table = %table.name(), recno, ok = outcome.is_ok(), "action");

        match outcome {
            Ok(found) => {
                if validate && target.value.is_some() {
                    if let Some(found) = found {
                        if found[..] != env.value_buf[..] {
                            return Err(WorkgenError::Integrity {
                                table: table.name().to_string(),
                                recno,
                                detail: "search returned an unexpected value",
                            });
                        }
                    }
                }
                table.stats().record(kind);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                table.stats().record(StatKind::FailedRead);
                Ok(())
            }
            Err(e) if e.is_duplicate_key() && self.op_type == OpType::Insert => {
                Err(WorkgenError::Integrity {
                    table: table.name().to_string(),
                    recno,
                    detail: "duplicate key on insert",
                })
            }
            Err(e) => Err(WorkgenError::engine(self.op_type.as_str(), e)),
        }
    }

    /// Issues the cursor call. The outer error means the cursor was missing;
    /// the inner result is the engine's answer.
    fn call_engine(&self, env: &mut ThreadEnvironment<'_>) -> WorkgenResult<EngineResult<Option<Bytes>>> {
        let index = self
            .table()
            .and_then(Table::binding)
            .map(|b| b.recno_index)
            .ok_or(ConfigError::MissingTable {
                op: self.op_type.as_str(),
            })?;
        let (cursor, key, value) = env.cursor_and_buffers(index)?;
        let outcome = match self.op_type {
            OpType::Insert => cursor.insert(key, value).map(|()| None),
            OpType::Update => cursor.update(key, value).map(|()| None),
            OpType::Remove => cursor.remove(key).map(|()| None),
            OpType::Search => cursor.search(key).map(Some),
            OpType::None => Ok(None),
        };
        Ok(outcome)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Operation: {}", self.op_type)?;
        if let Some(target) = &self.target {
            write!(f, ", {}, {}", target.table, target.key)?;
            if let Some(value) = &target.value {
                write!(f, ", {value}")?;
            }
        }
        if let Some(txn) = &self.transaction {
            write!(f, ", [{txn}]")?;
        }
        if !self.children.is_empty() {
            write!(f, ", children[{}]", self.children.len())?;
            if self.repeat_children > 1 {
                write!(f, " x{}", self.repeat_children)?;
            }
            write!(f, ": {{")?;
            for (i, child) in self.children.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{child}")?;
            }
            write!(f, "}}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keygen::KeyType;

    fn key() -> Key {
        Key::new(KeyType::Append, 10).unwrap()
    }

    fn value() -> Value {
        Value::new(20).unwrap()
    }

    #[test]
    fn test_without_value_rejects_writes() {
        let err = Operation::without_value(OpType::Insert, Table::new("table:a"), key());
        assert_eq!(err.unwrap_err(), ConfigError::MissingValue { op: "insert" });
        assert!(Operation::without_value(OpType::Search, Table::new("table:a"), key()).is_ok());
    }

    #[test]
    fn test_create_all_binds_tables() {
        let mut ctx = Context::new();
        let mut op = Operation::new(OpType::Insert, Table::new("table:a"), key(), value())
            .with_children(
                vec![Operation::new(OpType::Update, Table::new("table:b"), key(), value())],
                2,
            );
        op.create_all(&mut ctx, false).unwrap();
        assert_eq!(ctx.table_count(), 2);
        let binding = op.table().unwrap().binding().unwrap();
        assert_eq!(binding.context_id, ctx.id());
        assert_eq!(ctx.table_name(binding.recno_index), Some("table:a"));
        assert!(op.children()[0].table().unwrap().binding().is_some());
    }

    #[test]
    fn test_nested_transaction_rejected() {
        let mut ctx = Context::new();
        let inner = Operation::new(OpType::Insert, Table::new("table:a"), key(), value())
            .with_transaction(Transaction::default());
        let mut outer = Operation::group(vec![inner]).with_transaction(Transaction::default());
        assert_eq!(
            outer.create_all(&mut ctx, false),
            Err(ConfigError::NestedTransaction {
                table: "table:a".to_string()
            })
        );
    }

    #[test]
    fn test_empty_table_name_rejected() {
        let mut ctx = Context::new();
        let mut op = Operation::new(OpType::Insert, Table::new(""), key(), value());
        assert_eq!(op.create_all(&mut ctx, false), Err(ConfigError::EmptyTableName));
    }

    #[test]
    fn test_static_counts_walks_tree() {
        let table = Table::new("table:a");
        let op = Operation::group(vec![
            Operation::new(OpType::Insert, table.clone(), key(), value()),
            Operation::without_value(OpType::Search, table.clone(), key()).unwrap(),
            Operation::without_value(OpType::Search, table, key()).unwrap(),
        ]);
        let mut stats = TableStats::default();
        op.static_counts(&mut stats);
        assert_eq!(stats.inserts, 1);
        assert_eq!(stats.reads, 2);
        assert_eq!(stats.updates, 0);
    }

    #[test]
    fn test_buffer_sizes_take_maximum() {
        let big = Operation::new(
            OpType::Insert,
            Table::new("table:b"),
            Key::new(KeyType::Uniform, 32).unwrap(),
            Value::new(8).unwrap(),
        );
        let op = Operation::new(OpType::Insert, Table::new("table:a"), key(), value())
            .with_children(vec![big], 1);
        assert_eq!(op.buffer_sizes(), (32, 20));
    }

    #[test]
    fn test_describe() {
        let op = Operation::without_value(OpType::Search, Table::new("table:a"), key())
            .unwrap()
            .with_transaction(Transaction::rollback());
        assert_eq!(
            op.to_string(),
            "Operation: search, Table: table:a, Key: type append, size 10, \
             [Transaction: (rollback) begin_config: ]"
        );
    }
}
