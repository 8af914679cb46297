//! Integration tests for workgen-workload against the in-memory engine.
//!
//! Each test builds a workload from the public API, runs it to completion
//! and checks the counters, the engine contents and the report output.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use workgen_engine::{Connection, EngineError, FaultConfig, MemoryConnection};
use workgen_workload::profiles::Profile;
use workgen_workload::{
    ConfigError, Context, Key, KeyType, OpType, Operation, RunSummary, Table, TableIntent, Thread,
    ThreadEnvironment, Transaction, Value, WorkgenError, WorkgenResult, Workload,
};

const TABLE: &str = "table:test";

fn key() -> Key {
    Key::new(KeyType::Append, 10).unwrap()
}

fn uniform() -> Key {
    Key::new(KeyType::Uniform, 10).unwrap()
}

fn value(size: usize) -> Value {
    Value::new(size).unwrap()
}

fn insert(table: &Table) -> Operation {
    Operation::new(OpType::Insert, table.clone(), key(), value(40))
}

fn search(table: &Table) -> Operation {
    Operation::new(OpType::Search, table.clone(), uniform(), value(40))
}

fn run_quiet(workload: &mut Workload, conn: &MemoryConnection) -> WorkgenResult<RunSummary> {
    workload.run_with_output(conn, &mut io::sink())
}

/// One inserting thread, count 1000, untimed.
#[test]
fn test_insert_count_scenario() {
    let table = Table::new(TABLE);
    let thread = Thread::new(vec![insert(&table)]).with_count(1000);
    let mut workload = Workload::new(Context::new(), vec![thread]);
    let conn = MemoryConnection::new();

    let summary = run_quiet(&mut workload, &conn).unwrap();

    assert_eq!(summary.totals.inserts, 1000);
    assert_eq!(summary.totals.total_ops(), 1000);
    assert!(summary.intervals.is_empty());
    let index = workload.context().index_of(TABLE).unwrap();
    assert_eq!(workload.context().current_max(index), 1000);
    assert_eq!(conn.record_count(TABLE), Some(1000));
    assert_eq!(
        conn.get(TABLE, b"0000001000").unwrap().len(),
        40,
        "last minted record is stored with the generated value"
    );
    assert_eq!(table.stats().snapshot().inserts, 1000);
}

/// A context carried into a second workload continues its record numbers.
#[test]
fn test_context_reused_across_runs() {
    let conn = MemoryConnection::new();
    let table = Table::new(TABLE);

    let mut first = Workload::new(Context::new(), vec![Thread::new(vec![insert(&table)])]);
    run_quiet(&mut first, &conn).unwrap();

    let ops = vec![insert(&table); 5];
    let mut second = Workload::new(first.into_context(), vec![Thread::new(ops)]);
    let summary = run_quiet(&mut second, &conn).unwrap();

    assert_eq!(summary.totals.inserts, 5);
    let index = second.context().index_of(TABLE).unwrap();
    assert_eq!(second.context().current_max(index), 6);
    assert_eq!(conn.record_count(TABLE), Some(6));
}

/// In count mode a search thread performs exactly `count` searches.
#[test]
fn test_count_mode_search_runs_exactly_k() {
    let conn = MemoryConnection::new();
    let table = Table::new(TABLE);

    let loader = Thread::new(vec![insert(&table); 10]);
    let mut load = Workload::new(Context::new(), vec![loader]);
    run_quiet(&mut load, &conn).unwrap();

    let reader = Thread::new(vec![search(&table)]).with_count(25);
    let mut workload = Workload::new(load.into_context(), vec![reader]);
    let summary = run_quiet(&mut workload, &conn).unwrap();

    assert_eq!(summary.totals.reads, 25);
    assert_eq!(summary.totals.failed_reads, 0);
    assert_eq!(summary.threads[0].passes, 25);
}

/// Searches on an empty table count as failed reads, not errors.
#[test]
fn test_search_empty_table_counts_failed_reads() {
    let table = Table::new(TABLE);
    let reader = Thread::new(vec![search(&table)]).with_count(7);
    let mut workload = Workload::new(Context::new(), vec![reader]);
    let conn = MemoryConnection::new();

    let summary = run_quiet(&mut workload, &conn).unwrap();

    assert_eq!(summary.totals.reads, 0);
    assert_eq!(summary.totals.failed_reads, 7);
}

/// Removes and updates of already-removed records are failed reads.
#[test]
fn test_remove_then_update_misses() {
    let conn = MemoryConnection::new();
    let table = Table::new(TABLE);
    let mut load = Workload::new(Context::new(), vec![Thread::new(vec![insert(&table)])]);
    run_quiet(&mut load, &conn).unwrap();

    let ops = vec![
        Operation::new(OpType::Remove, table.clone(), uniform(), value(40)),
        Operation::new(OpType::Update, table.clone(), uniform(), value(40)),
        Operation::new(OpType::Remove, table.clone(), uniform(), value(40)),
    ];
    let mut workload = Workload::new(load.into_context(), vec![Thread::new(ops)]);
    let summary = run_quiet(&mut workload, &conn).unwrap();

    assert_eq!(summary.totals.removes, 1);
    assert_eq!(summary.totals.updates, 0);
    assert_eq!(summary.totals.failed_reads, 2);
    assert_eq!(conn.record_count(TABLE), Some(0));
}

/// Timed run with an inserter and a reader, reported every second.
#[test]
fn test_timed_run_interval_reports() {
    let table = Table::new(TABLE);
    // Searches between inserts keep the table small.
    let inserter = Thread::new(vec![insert(&table).with_children(vec![search(&table)], 50)]);
    let reader = Thread::new(vec![search(&table)]);
    let mut workload = Workload::builder()
        .thread(inserter)
        .thread(reader)
        .run_time(2)
        .report_interval(1)
        .build()
        .unwrap();
    let conn = MemoryConnection::new();
    let mut out = Vec::new();

    let summary = workload.run_with_output(&conn, &mut out).unwrap();

    assert_eq!(summary.intervals.len(), 1);
    assert_eq!(summary.interval_sum(), summary.totals);
    assert!(summary.totals.inserts > 0);
    assert!(summary.totals.reads > 0);
    assert!(summary.elapsed >= Duration::from_secs(2));

    let text = String::from_utf8(out).unwrap();
    let report_lines: Vec<&str> = text
        .lines()
        .filter(|l| l.starts_with("1: table:test: inserts="))
        .collect();
    assert_eq!(report_lines.len(), 1);
    assert!(text.contains("Run completed: "));
}

/// A rolled-back insert consumes a record number but leaves no row.
#[test]
fn test_rollback_consumes_recno() {
    let table = Table::new(TABLE);
    let op = insert(&table).with_transaction(Transaction::rollback());
    let mut workload = Workload::new(Context::new(), vec![Thread::new(vec![op]).with_count(5)]);
    let conn = MemoryConnection::new();

    let summary = run_quiet(&mut workload, &conn).unwrap();

    let index = workload.context().index_of(TABLE).unwrap();
    assert_eq!(workload.context().current_max(index), 5);
    assert_eq!(conn.record_count(TABLE), Some(0));
    assert_eq!(summary.txns.rollbacks, 5);
    assert_eq!(summary.txns.commits, 0);
}

/// A committing transaction covers the node's own action and its children.
#[test]
fn test_commit_covers_children() {
    let table = Table::new(TABLE);
    let update = Operation::new(OpType::Update, table.clone(), uniform(), value(40));
    let op = insert(&table)
        .with_children(vec![update], 3)
        .with_transaction(Transaction::new("isolation=snapshot"));
    let mut workload = Workload::new(Context::new(), vec![Thread::new(vec![op]).with_count(4)]);
    let conn = MemoryConnection::new();

    let summary = run_quiet(&mut workload, &conn).unwrap();

    assert_eq!(summary.totals.inserts, 4);
    assert_eq!(summary.totals.updates, 12);
    assert_eq!(summary.txns.commits, 4);
    assert_eq!(conn.record_count(TABLE), Some(4));
}

/// A failed commit counts as a rollback and ends the thread.
#[test]
fn test_commit_failure_is_rolled_back() {
    let table = Table::new(TABLE);
    let op = insert(&table).with_transaction(Transaction::new("isolation=snapshot"));
    let mut workload = Workload::new(Context::new(), vec![Thread::new(vec![op]).with_count(3)]);
    let conn = MemoryConnection::with_faults(3, FaultConfig::none().with_commit_fail_rate(1.0));

    let err = run_quiet(&mut workload, &conn).unwrap_err();

    match &err {
        WorkgenError::ThreadFailed { source, .. } => assert!(matches!(
            source.as_ref(),
            WorkgenError::Engine {
                operation: "commit_transaction",
                ..
            }
        )),
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(err.engine_error(), Some(EngineError::Rollback { .. })));
    assert!(!err.is_integrity());

    let summary = workload.last_summary().unwrap();
    assert_eq!(summary.txns.commits, 0);
    assert_eq!(summary.txns.rollbacks, 1);
    assert_eq!(summary.totals.inserts, 1);
    assert_eq!(summary.threads[0].passes, 0);
    assert_eq!(conn.record_count(TABLE), Some(0));
    assert_eq!(conn.open_sessions(), 0);
}

/// Inserting a record number that already exists is an integrity error.
#[test]
fn test_duplicate_insert_is_integrity_error() {
    let conn = MemoryConnection::new();
    conn.create_table(TABLE, "key_format=S,value_format=S").unwrap();
    let mut session = conn.open_session().unwrap();
    let mut cursor = session.open_cursor(TABLE).unwrap();
    cursor.insert(b"0000000003", b"preloaded").unwrap();
    cursor.close().unwrap();
    session.close().unwrap();

    let table = Table::new(TABLE);
    let mut workload = Workload::new(
        Context::new(),
        vec![Thread::new(vec![insert(&table)]).with_count(5)],
    );

    let err = run_quiet(&mut workload, &conn).unwrap_err();

    assert!(matches!(err, WorkgenError::ThreadFailed { .. }));
    assert!(err.is_integrity());
    assert!(err.engine_error().is_none());
    assert!(err.to_string().contains("record 3: duplicate key on insert"));

    let summary = workload.last_summary().unwrap();
    assert_eq!(summary.totals.inserts, 2);
    assert_eq!(summary.threads[0].passes, 2);
    assert_eq!(&conn.get(TABLE, b"0000000003").unwrap()[..], b"preloaded");
}

/// An engine failure stops the run and surfaces as a thread failure.
#[test]
fn test_engine_failure_surfaces_as_thread_failed() {
    let table = Table::new(TABLE);
    let thread = Thread::new(vec![insert(&table)]).with_count(1000).with_name("loader");
    let mut workload = Workload::new(Context::new(), vec![thread]);
    let conn = MemoryConnection::with_faults(0, FaultConfig::none().with_fail_at_op(50));
    let mut out = Vec::new();

    let err = workload.run_with_output(&conn, &mut out).unwrap_err();

    match &err {
        WorkgenError::ThreadFailed { thread, .. } => assert_eq!(thread, "loader"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(matches!(err.engine_error(), Some(EngineError::Io { .. })));

    let summary = workload.last_summary().unwrap();
    assert_eq!(summary.totals.inserts, 49);
    assert_eq!(summary.threads[0].passes, 49);
    assert!(summary.threads[0].error.is_some());

    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("Executed 49 insert operations"));
    assert!(text.contains("loader failed after 49 passes"));
    assert_eq!(conn.open_cursors(), 0);
    assert_eq!(conn.open_sessions(), 0);
}

/// A failing thread wakes the orchestrator before run_time elapses.
#[test]
fn test_failure_ends_timed_run_early() {
    let table = Table::new(TABLE);
    let reader = Thread::new(vec![search(&table)]);
    let writer = Thread::new(vec![insert(&table)]);
    let mut workload = Workload::builder()
        .thread(reader)
        .thread(writer)
        .run_time(30)
        .report_interval(1)
        .build()
        .unwrap();
    let conn = MemoryConnection::with_faults(7, FaultConfig::none().with_fail_at_op(2_000));

    let started = Instant::now();
    let err = run_quiet(&mut workload, &conn).unwrap_err();

    assert!(matches!(err, WorkgenError::ThreadFailed { .. }));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(conn.open_cursors(), 0);
}

/// Inserting into a table declared read-only is reported after the run.
#[test]
fn test_usage_conflict_read_only() {
    let table = Table::new(TABLE);
    let mut workload = Workload::builder()
        .thread(Thread::new(vec![insert(&table)]))
        .intent(TABLE, TableIntent::ReadOnly)
        .build()
        .unwrap();
    let conn = MemoryConnection::new();

    let err = run_quiet(&mut workload, &conn).unwrap_err();

    assert!(matches!(
        err,
        WorkgenError::Config(ConfigError::UsageConflict {
            declared: "read-only",
            ..
        })
    ));
}

/// Readers and writers in different threads satisfy a mixed intent but not
/// a write-only one.
#[test]
fn test_usage_union_across_threads() {
    let conn = MemoryConnection::new();
    let table = Table::new(TABLE);
    let threads = vec![
        Thread::new(vec![insert(&table)]),
        Thread::new(vec![search(&table)]),
    ];

    let mut mixed = Workload::builder()
        .thread(threads[0].clone())
        .thread(threads[1].clone())
        .intent(TABLE, TableIntent::Mixed)
        .build()
        .unwrap();
    run_quiet(&mut mixed, &conn).unwrap();

    let mut write_only = Workload::builder()
        .context(mixed.into_context())
        .thread(threads[0].clone())
        .thread(threads[1].clone())
        .intent(TABLE, TableIntent::WriteOnly)
        .build()
        .unwrap();
    let err = run_quiet(&mut write_only, &conn).unwrap_err();
    assert!(matches!(
        err,
        WorkgenError::Config(ConfigError::UsageConflict {
            declared: "write-only",
            observed: "read from it",
            ..
        })
    ));
}

/// Validated searches accept values written by the same generator and
/// reject values written by a different one.
#[test]
fn test_validated_search() {
    let conn = MemoryConnection::new();
    let table = Table::new(TABLE);
    let mut load = Workload::new(Context::new(), vec![Thread::new(vec![insert(&table); 20])]);
    run_quiet(&mut load, &conn).unwrap();

    let mut good = Workload::builder()
        .context(load.into_context())
        .thread(Thread::new(vec![search(&table)]).with_count(50))
        .validate_reads(true)
        .build()
        .unwrap();
    let summary = run_quiet(&mut good, &conn).unwrap();
    assert_eq!(summary.totals.reads, 50);

    let mismatched = Operation::new(OpType::Search, table.clone(), uniform(), value(30));
    let mut bad = Workload::builder()
        .context(good.into_context())
        .thread(Thread::new(vec![mismatched]))
        .validate_reads(true)
        .build()
        .unwrap();
    let err = run_quiet(&mut bad, &conn).unwrap_err();
    assert!(err.is_integrity());
}

/// An operation bound to one context cannot run under another.
#[test]
fn test_context_mismatch() {
    let conn = MemoryConnection::new();
    conn.create_table(TABLE, "").unwrap();

    let mut bound = Context::new();
    let mut op = insert(&Table::new(TABLE));
    op.create_all(&mut bound, false).unwrap();
    let thread = Thread::new(vec![op]);

    let mut running = Context::new();
    running.assign(TABLE);
    let mut env = ThreadEnvironment::new(&running, &thread, 0, 0);
    env.create(&conn).unwrap();
    env.open().unwrap();

    let err = thread.run(&mut env).unwrap_err();
    assert!(matches!(
        err,
        WorkgenError::Config(ConfigError::ContextMismatch { .. })
    ));
    assert!(env.error().is_some());
    env.close().unwrap();
    assert_eq!(conn.open_sessions(), 0);
}

/// Latency tracking produces percentiles over every engine call.
#[test]
fn test_latency_tracking() {
    let table = Table::new(TABLE);
    let mut workload = Workload::builder()
        .thread(Thread::new(vec![insert(&table)]).with_count(200))
        .track_latency(true)
        .build()
        .unwrap();
    let conn = MemoryConnection::new();
    let mut out = Vec::new();

    let summary = workload.run_with_output(&conn, &mut out).unwrap();

    let latency = summary.latency.unwrap();
    assert_eq!(latency.count, 200);
    assert!(latency.p50_us <= latency.max_us);
    assert!(String::from_utf8(out).unwrap().contains("Latency: p50="));
}

/// Profiles load from TOML files and run end to end.
#[test]
fn test_profile_file_runs() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
name = "file"
seed = 3

[[tables]]
name = "table:profile"
intent = "mixed"

[[threads]]
name = "worker"
count = 10
instances = 2

[[threads.ops]]
op = "insert"
table = "table:profile"
value_size = 16
repeat_children = 2

[[threads.ops.children]]
op = "search"
table = "table:profile"
key = {{ type = "uniform" }}
"#
    )
    .unwrap();

    let profile = Profile::from_file(file.path()).unwrap();
    let mut workload = profile.into_workload().unwrap();
    let conn = MemoryConnection::new();
    let summary = run_quiet(&mut workload, &conn).unwrap();

    assert_eq!(summary.totals.inserts, 20);
    // A reader can pick a record number the other thread minted but has not
    // inserted yet.
    assert_eq!(summary.totals.reads + summary.totals.failed_reads, 40);
    assert_eq!(conn.record_count("table:profile"), Some(20));
    assert_eq!(summary.table("table:profile").unwrap().inserts, 20);
}
