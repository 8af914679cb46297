//! Declarative workload profiles.
//!
//! A profile describes tables, threads and their operation trees in TOML and
//! converts into a runnable [`Workload`]. Operations naming the same table
//! share one [`Table`] handle, so their statistics land in one place.
//!
//! # Example
//!
//! ```ignore
//! use workgen_workload::profiles::{load_profile, Profile};
//!
//! // Load a named profile
//! let profile = load_profile("mixed").unwrap();
//!
//! // Or load from a TOML file
//! let profile = Profile::from_file("custom.toml").unwrap();
//! let workload = profile.into_workload().unwrap();
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::environment::TableIntent;
use crate::error::ConfigError;
use crate::keygen::{Key, KeyType, ParetoSkew, Value};
use crate::operation::{OpType, Operation};
use crate::table::Table;
use crate::thread::Thread;
use crate::transaction::Transaction;
use crate::workload::Workload;

/// A table declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TableSpec {
    /// Table name (engine URI).
    pub name: String,
    /// Configuration passed to `create_table`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    /// Expected access pattern, checked after the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<TableIntent>,
}

/// Key distribution names used in profiles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    /// Sequential.
    #[default]
    Append,
    /// Uniform over existing records.
    Uniform,
    /// Skewed toward low record numbers.
    Pareto,
}

/// Key generator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeySpec {
    /// Distribution.
    #[serde(rename = "type")]
    pub kind: KeyKind,
    /// Key size in bytes.
    pub size: usize,
    /// Hot share of the record range, for pareto keys.
    pub hot_fraction: f64,
    /// Share of accesses landing in the hot range, for pareto keys.
    pub mass_fraction: f64,
}

impl Default for KeySpec {
    fn default() -> Self {
        let skew = ParetoSkew::default();
        Self {
            kind: KeyKind::Append,
            size: 10,
            hot_fraction: skew.hot_fraction,
            mass_fraction: skew.mass_fraction,
        }
    }
}

impl KeySpec {
    fn build(&self) -> Result<Key, ConfigError> {
        let key_type = match self.kind {
            KeyKind::Append => KeyType::Append,
            KeyKind::Uniform => KeyType::Uniform,
            KeyKind::Pareto => {
                KeyType::Pareto(ParetoSkew::new(self.hot_fraction, self.mass_fraction)?)
            }
        };
        Key::new(key_type, self.size)
    }
}

/// Transaction settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionSpec {
    /// Configuration passed to `begin_transaction`.
    pub begin: String,
    /// Configuration passed to `commit_transaction`.
    pub commit: String,
    /// Roll back instead of committing.
    pub rollback: bool,
}

impl TransactionSpec {
    fn build(&self) -> Transaction {
        Transaction::new(self.begin.clone())
            .with_commit_config(self.commit.clone())
            .with_rollback(self.rollback)
    }
}

/// One node of an operation tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpSpec {
    /// What the operation does.
    pub op: OpType,
    /// Table name; required unless `op` is `none`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Key generator.
    pub key: KeySpec,
    /// Value size in bytes.
    pub value_size: usize,
    /// Number of consecutive copies of this operation.
    pub copies: usize,
    /// Transaction wrapping the operation and its children.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TransactionSpec>,
    /// How many times the children run per execution.
    pub repeat_children: u32,
    /// Child operations.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<OpSpec>,
}

impl Default for OpSpec {
    fn default() -> Self {
        Self {
            op: OpType::None,
            table: None,
            key: KeySpec::default(),
            value_size: 100,
            copies: 1,
            transaction: None,
            repeat_children: 1,
            children: Vec::new(),
        }
    }
}

impl OpSpec {
    fn build(&self, tables: &mut HashMap<String, Table>) -> Result<Vec<Operation>, ConfigError> {
        let mut children = Vec::new();
        for child in &self.children {
            children.extend(child.build(tables)?);
        }
        let op = match &self.table {
            Some(name) => {
                let table = tables
                    .entry(name.clone())
                    .or_insert_with(|| Table::new(name.as_str()))
                    .clone();
                Operation::new(self.op, table, self.key.build()?, Value::new(self.value_size)?)
            }
            None if self.op == OpType::None => Operation::group(Vec::new()),
            None => {
                return Err(ConfigError::MissingTable {
                    op: self.op.as_str(),
                })
            }
        };
        let mut op = op.with_children(children, self.repeat_children);
        if let Some(txn) = &self.transaction {
            op = op.with_transaction(txn.build());
        }
        Ok(vec![op; self.copies.max(1)])
    }
}

/// One thread, possibly instantiated several times.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadSpec {
    /// Display name; instances get a numeric suffix.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Passes over the operation list when the run is untimed.
    pub count: u64,
    /// Number of identical threads to start.
    pub instances: usize,
    /// Top-level operations.
    pub ops: Vec<OpSpec>,
}

impl Default for ThreadSpec {
    fn default() -> Self {
        Self {
            name: None,
            count: 1,
            instances: 1,
            ops: Vec::new(),
        }
    }
}

/// A complete workload profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Profile name.
    pub name: String,
    /// Description of what this profile exercises.
    pub description: String,
    /// Run duration in seconds; zero runs every thread's count once.
    pub run_time: u64,
    /// Seconds between interval reports.
    pub report_interval: u64,
    /// Random seed.
    pub seed: u64,
    /// Record engine call latency.
    pub track_latency: bool,
    /// Validate values returned by searches.
    pub validate_reads: bool,
    /// Table declarations.
    pub tables: Vec<TableSpec>,
    /// Threads.
    pub threads: Vec<ThreadSpec>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            description: "Default workload profile".to_string(),
            run_time: 0,
            report_interval: 0,
            seed: 0,
            track_latency: false,
            validate_reads: false,
            tables: Vec::new(),
            threads: Vec::new(),
        }
    }
}

impl Profile {
    /// Load a profile from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ProfileError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| ProfileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;
        Self::from_toml(&contents)
    }

    /// Parse a profile from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML cannot be parsed.
    pub fn from_toml(toml: &str) -> Result<Self, ProfileError> {
        toml::from_str(toml).map_err(|e| ProfileError::Parse {
            message: e.to_string(),
        })
    }

    /// Serialize the profile to a TOML string.
    #[must_use]
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Builds the workload the profile describes, with a fresh context.
    ///
    /// # Errors
    ///
    /// Returns [`ProfileError::Invalid`] if a generator, table or thread
    /// setting is invalid.
    pub fn into_workload(&self) -> Result<Workload, ProfileError> {
        let mut tables: HashMap<String, Table> = self
            .tables
            .iter()
            .map(|t| (t.name.clone(), Table::new(t.name.as_str())))
            .collect();

        let mut builder = Workload::builder()
            .run_time(self.run_time)
            .report_interval(self.report_interval)
            .seed(self.seed)
            .track_latency(self.track_latency)
            .validate_reads(self.validate_reads);
        for table in &self.tables {
            if table.name.is_empty() {
                return Err(ConfigError::EmptyTableName.into());
            }
            if let Some(config) = &table.config {
                builder = builder.table_config(table.name.as_str(), config.as_str());
            }
            if let Some(intent) = table.intent {
                builder = builder.intent(table.name.as_str(), intent);
            }
        }

        for spec in &self.threads {
            let mut ops = Vec::new();
            for op in &spec.ops {
                ops.extend(op.build(&mut tables)?);
            }
            let thread = Thread::new(ops).with_count(spec.count);
            for instance in 0..spec.instances {
                let thread = match &spec.name {
                    Some(name) if spec.instances > 1 => {
                        thread.clone().with_name(format!("{name}-{instance}"))
                    }
                    Some(name) => thread.clone().with_name(name.as_str()),
                    None => thread.clone(),
                };
                builder = builder.thread(thread);
            }
        }
        Ok(builder.build()?)
    }
}

/// Error type for profile operations.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    /// I/O error reading profile file.
    #[error("failed to read profile from {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Parse error in TOML.
    #[error("failed to parse profile: {message}")]
    Parse {
        /// Error message.
        message: String,
    },
    /// Profile not found.
    #[error("profile not found: {name}")]
    NotFound {
        /// Profile name.
        name: String,
    },
    /// The profile describes an invalid workload.
    #[error("invalid profile: {0}")]
    Invalid(#[from] ConfigError),
}

fn op(op: OpType, table: &str, kind: KeyKind) -> OpSpec {
    OpSpec {
        op,
        table: Some(table.to_string()),
        key: KeySpec {
            kind,
            ..KeySpec::default()
        },
        ..OpSpec::default()
    }
}

fn thread(name: &str, count: u64, instances: usize, ops: Vec<OpSpec>) -> ThreadSpec {
    ThreadSpec {
        name: Some(name.to_string()),
        count,
        instances,
        ops,
    }
}

fn table(name: &str, intent: Option<TableIntent>) -> TableSpec {
    TableSpec {
        name: name.to_string(),
        config: None,
        intent,
    }
}

fn insert_only() -> Profile {
    Profile {
        name: "insert".to_string(),
        description: "Single thread appending 10000 records".to_string(),
        tables: vec![table("table:insert", Some(TableIntent::WriteOnly))],
        threads: vec![thread(
            "loader",
            10_000,
            1,
            vec![OpSpec {
                value_size: 40,
                ..op(OpType::Insert, "table:insert", KeyKind::Append)
            }],
        )],
        ..Profile::default()
    }
}

fn mixed() -> Profile {
    Profile {
        name: "mixed".to_string(),
        description: "One inserting thread and two uniform readers for 3 seconds".to_string(),
        run_time: 3,
        report_interval: 1,
        tables: vec![table("table:mixed", Some(TableIntent::Mixed))],
        threads: vec![
            thread(
                "inserter",
                1,
                1,
                vec![op(OpType::Insert, "table:mixed", KeyKind::Append)],
            ),
            thread(
                "reader",
                1,
                2,
                vec![op(OpType::Search, "table:mixed", KeyKind::Uniform)],
            ),
        ],
        ..Profile::default()
    }
}

fn hot_keys() -> Profile {
    let txn = OpSpec {
        transaction: Some(TransactionSpec::default()),
        repeat_children: 4,
        children: vec![
            op(OpType::Search, "table:hot", KeyKind::Pareto),
            op(OpType::Update, "table:hot", KeyKind::Pareto),
        ],
        ..OpSpec::default()
    };
    Profile {
        name: "hot-keys".to_string(),
        description: "Pareto-skewed read-modify-write transactions while a loader inserts"
            .to_string(),
        track_latency: true,
        tables: vec![table("table:hot", None)],
        threads: vec![
            thread(
                "preload",
                1,
                1,
                vec![OpSpec {
                    copies: 1000,
                    ..op(OpType::Insert, "table:hot", KeyKind::Append)
                }],
            ),
            thread("updater", 2000, 4, vec![txn]),
        ],
        ..Profile::default()
    }
}

fn rollback() -> Profile {
    Profile {
        name: "rollback".to_string(),
        description: "Inserts that always roll back, leaving the table empty".to_string(),
        tables: vec![table("table:rollback", None)],
        threads: vec![thread(
            "aborter",
            1000,
            1,
            vec![OpSpec {
                transaction: Some(TransactionSpec {
                    rollback: true,
                    ..TransactionSpec::default()
                }),
                ..op(OpType::Insert, "table:rollback", KeyKind::Append)
            }],
        )],
        ..Profile::default()
    }
}

/// Built-in workload profiles for common scenarios.
#[must_use]
pub fn builtin_profiles() -> HashMap<&'static str, Profile> {
    HashMap::from([
        ("insert", insert_only()),
        ("mixed", mixed()),
        ("hot-keys", hot_keys()),
        ("rollback", rollback()),
    ])
}

/// Load a built-in profile by name.
///
/// # Errors
///
/// Returns an error if the profile name is not found.
pub fn load_profile(name: &str) -> Result<Profile, ProfileError> {
    builtin_profiles()
        .remove(name)
        .ok_or_else(|| ProfileError::NotFound {
            name: name.to_string(),
        })
}

/// List all available built-in profile names.
#[must_use]
pub fn list_profiles() -> Vec<&'static str> {
    let mut names: Vec<_> = builtin_profiles().keys().copied().collect();
    names.sort_unstable();
    names
}
