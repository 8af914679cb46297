//! In-memory storage engine with fault injection.
//!
//! Tables are ordered maps behind a mutex. A session buffers its writes while a
//! transaction is active and applies them atomically at commit; outside a
//! transaction every cursor call autocommits. Faults are injected from a seeded
//! hash of the operation sequence number, so a given seed and call order always
//! fails the same calls.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockWriteGuard};

use bytes::Bytes;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::{Connection, Cursor, Session};

type Records = BTreeMap<Bytes, Bytes>;
type SharedTable = Arc<Mutex<Records>>;

/// Configuration for fault injection in the memory engine.
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Probability of a search failing. Range: 0.0 - 1.0.
    pub read_fail_rate: f64,
    /// Probability of an insert, update or remove failing. Range: 0.0 - 1.0.
    pub write_fail_rate: f64,
    /// Probability of a commit being aborted by the engine. Range: 0.0 - 1.0.
    pub commit_fail_rate: f64,
    /// If set, the cursor call with this 1-based sequence number fails.
    pub fail_at_op: Option<u64>,
}

impl FaultConfig {
    /// Creates a fault config with no faults.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Sets the read fail rate.
    #[must_use]
    pub const fn with_read_fail_rate(mut self, rate: f64) -> Self {
        self.read_fail_rate = rate;
        self
    }

    /// Sets the write fail rate.
    #[must_use]
    pub const fn with_write_fail_rate(mut self, rate: f64) -> Self {
        self.write_fail_rate = rate;
        self
    }

    /// Sets the commit fail rate.
    #[must_use]
    pub const fn with_commit_fail_rate(mut self, rate: f64) -> Self {
        self.commit_fail_rate = rate;
        self
    }

    /// Forces the cursor call with the given sequence number to fail.
    #[must_use]
    pub const fn with_fail_at_op(mut self, op: u64) -> Self {
        self.fail_at_op = Some(op);
        self
    }
}

/// Statistics for the memory engine.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FaultStats {
    /// Total cursor calls attempted.
    pub total_ops: u64,
    /// Number of search failures injected.
    pub read_failures: u64,
    /// Number of write failures injected.
    pub write_failures: u64,
    /// Number of commit failures injected.
    pub commit_failures: u64,
}

impl FaultStats {
    /// Returns the total number of faults injected.
    #[must_use]
    pub const fn total_faults(&self) -> u64 {
        self.read_failures + self.write_failures + self.commit_failures
    }
}

#[derive(Debug, Clone, Copy)]
enum FaultType {
    Read,
    Write,
    Commit,
}

#[derive(Debug, Default)]
struct Counters {
    ops: AtomicU64,
    read_failures: AtomicU64,
    write_failures: AtomicU64,
    commit_failures: AtomicU64,
    sessions_open: AtomicU64,
    cursors_open: AtomicU64,
}

#[derive(Debug)]
struct Store {
    tables: RwLock<HashMap<String, SharedTable>>,
    fault_config: RwLock<FaultConfig>,
    seed: u64,
    counters: Counters,
}

#[allow(clippy::missing_panics_doc)]
impl Store {
    fn table(&self, uri: &str) -> EngineResult<SharedTable> {
        self.tables
            .read()
            .expect("tables lock poisoned")
            .get(uri)
            .cloned()
            .ok_or_else(|| EngineError::NoSuchTable {
                uri: uri.to_string(),
            })
    }

    /// Counts a cursor call and decides whether it should fail.
    fn check_fault(&self, fault_type: FaultType) -> EngineResult<()> {
        let seq = self.counters.ops.fetch_add(1, Ordering::Relaxed) + 1;
        let config = self.fault_config.read().expect("fault config lock poisoned");
        let rate = match fault_type {
            FaultType::Read => config.read_fail_rate,
            FaultType::Write => config.write_fail_rate,
            FaultType::Commit => config.commit_fail_rate,
        };
        let forced = config.fail_at_op == Some(seq);
        drop(config);

        if forced || self.should_inject_fault(seq, rate) {
            self.record_fault(fault_type);
            return Err(match fault_type {
                FaultType::Commit => EngineError::Rollback {
                    reason: "commit failed (simulated)".to_string(),
                },
                FaultType::Read => EngineError::io("search", "read failed (simulated)"),
                FaultType::Write => EngineError::io("write", "write failed (simulated)"),
            });
        }
        Ok(())
    }

    fn should_inject_fault(&self, seq: u64, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        let hash = self
            .seed
            .wrapping_add(seq)
            .wrapping_mul(0x5851_f42d_4c95_7f2d);
        #[allow(clippy::cast_precision_loss)]
        let normalized = (hash as f64) / (u64::MAX as f64);
        normalized < rate
    }

    fn record_fault(&self, fault_type: FaultType) {
        let counter = match fault_type {
            FaultType::Read => &self.counters.read_failures,
            FaultType::Write => &self.counters.write_failures,
            FaultType::Commit => &self.counters.commit_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// An in-memory storage engine.
///
/// Cloning the connection yields another handle to the same tables.
///
/// # Panics
///
/// Methods may panic if internal locks are poisoned, which indicates a
/// previous panic in a critical section.
#[derive(Debug, Clone)]
pub struct MemoryConnection {
    store: Arc<Store>,
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::missing_panics_doc)]
impl MemoryConnection {
    /// Creates an empty engine with no fault injection.
    #[must_use]
    pub fn new() -> Self {
        Self::with_faults(0, FaultConfig::none())
    }

    /// Creates an empty engine with fault injection enabled.
    #[must_use]
    pub fn with_faults(seed: u64, config: FaultConfig) -> Self {
        Self {
            store: Arc::new(Store {
                tables: RwLock::new(HashMap::new()),
                fault_config: RwLock::new(config),
                seed,
                counters: Counters::default(),
            }),
        }
    }

    /// Returns the fault configuration for modification.
    pub fn fault_config(&self) -> RwLockWriteGuard<'_, FaultConfig> {
        self.store
            .fault_config
            .write()
            .expect("fault config lock poisoned")
    }

    /// Returns a copy of the current engine statistics.
    #[must_use]
    pub fn fault_stats(&self) -> FaultStats {
        let counters = &self.store.counters;
        FaultStats {
            total_ops: counters.ops.load(Ordering::Relaxed),
            read_failures: counters.read_failures.load(Ordering::Relaxed),
            write_failures: counters.write_failures.load(Ordering::Relaxed),
            commit_failures: counters.commit_failures.load(Ordering::Relaxed),
        }
    }

    /// Returns the number of committed records in a table.
    #[must_use]
    pub fn record_count(&self, uri: &str) -> Option<usize> {
        let table = self.store.table(uri).ok()?;
        let len = table.lock().expect("table lock poisoned").len();
        Some(len)
    }

    /// Returns the committed value for a key, if any.
    #[must_use]
    pub fn get(&self, uri: &str, key: &[u8]) -> Option<Bytes> {
        let table = self.store.table(uri).ok()?;
        let records = table.lock().expect("table lock poisoned");
        records.get(key).cloned()
    }

    /// Returns all committed keys of a table in order.
    #[must_use]
    pub fn keys(&self, uri: &str) -> Vec<Bytes> {
        self.store.table(uri).map_or_else(
            |_| Vec::new(),
            |table| {
                table
                    .lock()
                    .expect("table lock poisoned")
                    .keys()
                    .cloned()
                    .collect()
            },
        )
    }

    /// Returns the number of sessions currently open.
    #[must_use]
    pub fn open_sessions(&self) -> u64 {
        self.store.counters.sessions_open.load(Ordering::Relaxed)
    }

    /// Returns the number of cursors currently open.
    #[must_use]
    pub fn open_cursors(&self) -> u64 {
        self.store.counters.cursors_open.load(Ordering::Relaxed)
    }
}

impl Connection for MemoryConnection {
    fn create_table(&self, uri: &str, config: &str) -> EngineResult<()> {
        if uri.is_empty() {
            return Err(EngineError::InvalidState {
                reason: "table URI is empty",
            });
        }
        let mut tables = self.store.tables.write().expect("tables lock poisoned");
        tables.entry(uri.to_string()).or_insert_with(|| {
            debug!(uri, config, "created table");
            Arc::new(Mutex::new(Records::new()))
        });
        Ok(())
    }

    fn open_session(&self) -> EngineResult<Box<dyn Session>> {
        self.store
            .counters
            .sessions_open
            .fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemorySession {
            store: Arc::clone(&self.store),
            txn: Arc::new(Mutex::new(TxnState::default())),
            cursors: Arc::new(AtomicU64::new(0)),
        }))
    }
}

/// Writes buffered by an active transaction, keyed by (table, key).
/// `None` marks a removal.
#[derive(Debug, Default)]
struct TxnState {
    active: bool,
    writes: BTreeMap<(String, Bytes), Option<Bytes>>,
}

struct MemorySession {
    store: Arc<Store>,
    txn: Arc<Mutex<TxnState>>,
    cursors: Arc<AtomicU64>,
}

impl MemorySession {
    fn take_writes(&self) -> EngineResult<BTreeMap<(String, Bytes), Option<Bytes>>> {
        let mut txn = self.txn.lock().expect("txn lock poisoned");
        if !txn.active {
            return Err(EngineError::InvalidState {
                reason: "no transaction is active",
            });
        }
        txn.active = false;
        Ok(std::mem::take(&mut txn.writes))
    }
}

impl Session for MemorySession {
    fn open_cursor(&mut self, uri: &str) -> EngineResult<Box<dyn Cursor>> {
        let table = self.store.table(uri)?;
        self.cursors.fetch_add(1, Ordering::Relaxed);
        self.store
            .counters
            .cursors_open
            .fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryCursor {
            uri: uri.to_string(),
            table,
            store: Arc::clone(&self.store),
            txn: Arc::clone(&self.txn),
            session_cursors: Arc::clone(&self.cursors),
        }))
    }

    fn begin_transaction(&mut self, _config: &str) -> EngineResult<()> {
        let mut txn = self.txn.lock().expect("txn lock poisoned");
        if txn.active {
            return Err(EngineError::InvalidState {
                reason: "transaction already active",
            });
        }
        txn.active = true;
        txn.writes.clear();
        Ok(())
    }

    fn commit_transaction(&mut self, _config: &str) -> EngineResult<()> {
        let writes = self.take_writes()?;
        self.store.check_fault(FaultType::Commit)?;

        let mut by_table: BTreeMap<String, Vec<(Bytes, Option<Bytes>)>> = BTreeMap::new();
        for ((uri, key), value) in writes {
            by_table.entry(uri).or_default().push((key, value));
        }
        for (uri, entries) in by_table {
            let table = self.store.table(&uri)?;
            let mut records = table.lock().expect("table lock poisoned");
            for (key, value) in entries {
                match value {
                    Some(value) => {
                        records.insert(key, value);
                    }
                    None => {
                        records.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn rollback_transaction(&mut self) -> EngineResult<()> {
        self.take_writes().map(drop)
    }

    fn in_transaction(&self) -> bool {
        self.txn.lock().expect("txn lock poisoned").active
    }

    fn close(self: Box<Self>) -> EngineResult<()> {
        if self.cursors.load(Ordering::Relaxed) != 0 {
            return Err(EngineError::InvalidState {
                reason: "session closed with open cursors",
            });
        }
        if self.in_transaction() {
            self.rollback_transaction_on_close();
        }
        self.store
            .counters
            .sessions_open
            .fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }
}

impl MemorySession {
    fn rollback_transaction_on_close(&self) {
        let mut txn = self.txn.lock().expect("txn lock poisoned");
        txn.active = false;
        txn.writes.clear();
    }
}

struct MemoryCursor {
    uri: String,
    table: SharedTable,
    store: Arc<Store>,
    txn: Arc<Mutex<TxnState>>,
    session_cursors: Arc<AtomicU64>,
}

impl MemoryCursor {
    /// Reads a key as this session sees it: own uncommitted writes first.
    fn lookup(&self, txn: &TxnState, key: &[u8]) -> Option<Bytes> {
        if txn.active {
            if let Some(pending) = txn.writes.get(&(self.uri.clone(), Bytes::copy_from_slice(key)))
            {
                return pending.clone();
            }
        }
        self.table
            .lock()
            .expect("table lock poisoned")
            .get(key)
            .cloned()
    }

    fn write(&self, txn: &mut TxnState, key: &[u8], value: Option<&[u8]>) {
        let key = Bytes::copy_from_slice(key);
        let value = value.map(Bytes::copy_from_slice);
        if txn.active {
            txn.writes.insert((self.uri.clone(), key), value);
            return;
        }
        let mut records = self.table.lock().expect("table lock poisoned");
        match value {
            Some(value) => {
                records.insert(key, value);
            }
            None => {
                records.remove(&key);
            }
        }
    }
}

impl Cursor for MemoryCursor {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn insert(&mut self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.store.check_fault(FaultType::Write)?;
        let mut txn = self.txn.lock().expect("txn lock poisoned");
        if !txn.active {
            // Autocommit: check and insert under one table lock.
            let mut records = self.table.lock().expect("table lock poisoned");
            if records.contains_key(key) {
                return Err(EngineError::DuplicateKey);
            }
            records.insert(Bytes::copy_from_slice(key), Bytes::copy_from_slice(value));
            return Ok(());
        }
        if self.lookup(&txn, key).is_some() {
            return Err(EngineError::DuplicateKey);
        }
        self.write(&mut txn, key, Some(value));
        Ok(())
    }

    fn update(&mut self, key: &[u8], value: &[u8]) -> EngineResult<()> {
        self.store.check_fault(FaultType::Write)?;
        let mut txn = self.txn.lock().expect("txn lock poisoned");
        if self.lookup(&txn, key).is_none() {
            return Err(EngineError::NotFound);
        }
        self.write(&mut txn, key, Some(value));
        Ok(())
    }

    fn remove(&mut self, key: &[u8]) -> EngineResult<()> {
        self.store.check_fault(FaultType::Write)?;
        let mut txn = self.txn.lock().expect("txn lock poisoned");
        if self.lookup(&txn, key).is_none() {
            return Err(EngineError::NotFound);
        }
        self.write(&mut txn, key, None);
        Ok(())
    }

    fn search(&mut self, key: &[u8]) -> EngineResult<Bytes> {
        self.store.check_fault(FaultType::Read)?;
        let txn = self.txn.lock().expect("txn lock poisoned");
        self.lookup(&txn, key).ok_or(EngineError::NotFound)
    }

    fn close(self: Box<Self>) -> EngineResult<()> {
        self.session_cursors.fetch_sub(1, Ordering::Relaxed);
        self.store
            .counters
            .cursors_open
            .fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (MemoryConnection, Box<dyn Session>) {
        let conn = MemoryConnection::new();
        conn.create_table("table:test", "").unwrap();
        let session = conn.open_session().unwrap();
        (conn, session)
    }

    #[test]
    fn test_autocommit_insert_search() {
        let (conn, mut session) = setup();
        let mut cursor = session.open_cursor("table:test").unwrap();

        cursor.insert(b"k1", b"v1").unwrap();
        assert_eq!(cursor.search(b"k1").unwrap(), Bytes::from_static(b"v1"));
        assert_eq!(conn.record_count("table:test"), Some(1));

        cursor.close().unwrap();
        session.close().unwrap();
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let (_conn, mut session) = setup();
        let mut cursor = session.open_cursor("table:test").unwrap();

        cursor.insert(b"k1", b"v1").unwrap();
        assert_eq!(cursor.insert(b"k1", b"v2"), Err(EngineError::DuplicateKey));
    }

    #[test]
    fn test_missing_key_is_not_found() {
        let (_conn, mut session) = setup();
        let mut cursor = session.open_cursor("table:test").unwrap();

        assert!(cursor.search(b"nope").unwrap_err().is_not_found());
        assert!(cursor.update(b"nope", b"v").unwrap_err().is_not_found());
        assert!(cursor.remove(b"nope").unwrap_err().is_not_found());
    }

    #[test]
    fn test_transaction_visibility() {
        let (conn, mut session) = setup();
        let mut cursor = session.open_cursor("table:test").unwrap();

        session.begin_transaction("").unwrap();
        cursor.insert(b"k1", b"v1").unwrap();

        // Visible to the writer, not yet committed.
        assert_eq!(cursor.search(b"k1").unwrap(), Bytes::from_static(b"v1"));
        assert_eq!(conn.get("table:test", b"k1"), None);

        session.commit_transaction("").unwrap();
        assert_eq!(conn.get("table:test", b"k1"), Some(Bytes::from_static(b"v1")));
    }

    #[test]
    fn test_rollback_discards_writes() {
        let (conn, mut session) = setup();
        let mut cursor = session.open_cursor("table:test").unwrap();
        cursor.insert(b"keep", b"v").unwrap();

        session.begin_transaction("").unwrap();
        cursor.insert(b"k1", b"v1").unwrap();
        cursor.remove(b"keep").unwrap();
        assert!(cursor.search(b"keep").unwrap_err().is_not_found());
        session.rollback_transaction().unwrap();

        assert_eq!(conn.get("table:test", b"k1"), None);
        assert!(conn.get("table:test", b"keep").is_some());
        assert!(!session.in_transaction());
    }

    #[test]
    fn test_transaction_state_errors() {
        let (_conn, mut session) = setup();
        assert!(session.commit_transaction("").is_err());
        assert!(session.rollback_transaction().is_err());

        session.begin_transaction("").unwrap();
        assert!(session.begin_transaction("").is_err());
    }

    #[test]
    fn test_open_cursor_missing_table() {
        let (_conn, mut session) = setup();
        let result = session.open_cursor("table:missing");
        assert!(matches!(result, Err(EngineError::NoSuchTable { .. })));
    }

    #[test]
    fn test_session_close_with_open_cursor() {
        let (conn, mut session) = setup();
        let cursor = session.open_cursor("table:test").unwrap();
        assert_eq!(conn.open_cursors(), 1);

        // Keep the cursor alive past the failed close attempt.
        let result = session.close();
        assert!(matches!(result, Err(EngineError::InvalidState { .. })));
        cursor.close().unwrap();
        assert_eq!(conn.open_cursors(), 0);
    }

    #[test]
    fn test_forced_fault() {
        let conn = MemoryConnection::with_faults(7, FaultConfig::none().with_fail_at_op(2));
        conn.create_table("table:test", "").unwrap();
        let mut session = conn.open_session().unwrap();
        let mut cursor = session.open_cursor("table:test").unwrap();

        cursor.insert(b"k1", b"v1").unwrap();
        let err = cursor.insert(b"k2", b"v2").unwrap_err();
        assert!(matches!(err, EngineError::Io { .. }));
        cursor.insert(b"k3", b"v3").unwrap();

        let stats = conn.fault_stats();
        assert_eq!(stats.total_ops, 3);
        assert_eq!(stats.write_failures, 1);
        assert_eq!(stats.total_faults(), 1);
    }

    #[test]
    fn test_commit_fault_discards_transaction() {
        let conn = MemoryConnection::with_faults(7, FaultConfig::none().with_commit_fail_rate(1.0));
        conn.create_table("table:test", "").unwrap();
        let mut session = conn.open_session().unwrap();
        let mut cursor = session.open_cursor("table:test").unwrap();

        session.begin_transaction("").unwrap();
        cursor.insert(b"k1", b"v1").unwrap();
        let err = session.commit_transaction("").unwrap_err();
        assert!(matches!(err, EngineError::Rollback { .. }));
        assert!(!session.in_transaction());
        assert_eq!(conn.record_count("table:test"), Some(0));
    }
}
