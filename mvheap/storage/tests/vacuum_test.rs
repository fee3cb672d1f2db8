mod common;

use common::*;
use mvheap_storage::{IsolationLevel, ReclaimStats};

// ========== BASIC RECLAMATION ==========

#[test]
fn test_vacuum_removes_superseded_versions() {
    let engine = create_test_engine();
    put(&engine, 1, b"v1");
    put(&engine, 1, b"v2");
    put(&engine, 1, b"v3");

    // Three versions on the chain; the two old ones are dead to every
    // snapshot.
    assert_eq!(engine.metrics().versions, 3);
    let stats = engine.vacuum();
    assert_eq!(stats.versions_removed, 2);

    let check = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(engine.read(&check, 1).unwrap(), Some(b"v3".to_vec()));
    check.rollback().unwrap();
}

#[test]
fn test_vacuum_removes_deleted_rows() {
    let engine = create_test_engine();
    put(&engine, 1, b"short lived");

    let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    engine.delete(&txn, 1).unwrap();
    txn.commit().unwrap();

    let stats = engine.vacuum();
    assert_eq!(stats.versions_removed, 1);
    assert_eq!(engine.metrics().rows, 0);

    let check = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(engine.read(&check, 1).unwrap(), None);
    check.rollback().unwrap();
}

#[test]
fn test_vacuum_removes_aborted_versions() {
    let engine = create_test_engine();
    put(&engine, 1, b"keep");

    let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    engine.write(&txn, 1, b"discard".to_vec()).unwrap();
    engine.write(&txn, 2, b"discard".to_vec()).unwrap();
    txn.rollback().unwrap();

    // The aborted transaction's versions linger physically until vacuum.
    assert_eq!(engine.metrics().versions, 3);
    let stats = engine.vacuum();
    assert_eq!(stats.versions_removed, 2);

    let check = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(engine.read(&check, 1).unwrap(), Some(b"keep".to_vec()));
    assert_eq!(engine.read(&check, 2).unwrap(), None);
    check.rollback().unwrap();
}

// ========== IDEMPOTENCE ==========

#[test]
fn test_vacuum_is_idempotent() {
    let engine = create_test_engine();
    put(&engine, 1, b"v1");
    put(&engine, 1, b"v2");

    let first = engine.vacuum();
    assert_eq!(first.versions_removed, 1);

    let second = engine.vacuum();
    assert_eq!(
        second,
        ReclaimStats {
            versions_removed: 0,
            units_marked_all_visible: 0,
        }
    );
}

// ========== SNAPSHOT PINNING ==========

#[test]
fn test_live_snapshot_blocks_reclamation() {
    let engine = create_test_engine();
    put(&engine, 1, b"old");

    // The reader's snapshot still needs the old version.
    let reader = engine.begin(IsolationLevel::RepeatableRead).unwrap();
    assert_eq!(engine.read(&reader, 1).unwrap(), Some(b"old".to_vec()));

    put(&engine, 1, b"new");

    let pinned = engine.vacuum();
    assert_eq!(pinned.versions_removed, 0);
    assert_eq!(engine.read(&reader, 1).unwrap(), Some(b"old".to_vec()));

    // Releasing the snapshot unpins the horizon.
    reader.rollback().unwrap();
    let unpinned = engine.vacuum();
    assert_eq!(unpinned.versions_removed, 1);
}

#[test]
fn test_snapshot_gauge_exposes_pinning_snapshot() {
    let engine = create_test_engine();

    let old = engine.begin(IsolationLevel::RepeatableRead).unwrap();
    let _ = engine.begin(IsolationLevel::RepeatableRead).unwrap().rollback();

    let gauge = engine.metrics().snapshots;
    assert_eq!(gauge.live, 1);
    assert_eq!(gauge.oldest_owner, Some(old.txid()));
    assert_eq!(gauge.oldest_xmin, Some(old.txid()));
    assert!(gauge.taken >= 2);

    old.rollback().unwrap();
    assert_eq!(engine.metrics().snapshots.live, 0);
}

// ========== ALL-VISIBLE MARKING ==========

#[test]
fn test_vacuum_marks_settled_units_all_visible() {
    let engine = create_test_engine();
    // Rows 0..8 share storage unit 0 (64 rows per unit).
    for row in 0..8u64 {
        put(&engine, row, b"settled");
    }

    assert!(!engine.unit_all_visible(0));
    let stats = engine.vacuum();
    assert_eq!(stats.units_marked_all_visible, 1);
    assert!(engine.unit_all_visible(0));

    // Re-running marks nothing new.
    assert_eq!(engine.vacuum().units_marked_all_visible, 0);
    assert!(engine.unit_all_visible(0));
}

#[test]
fn test_write_invalidates_all_visible_marker() {
    let engine = create_test_engine();
    put(&engine, 1, b"settled");
    engine.vacuum();
    assert!(engine.unit_all_visible(1));

    put(&engine, 1, b"changed");
    assert!(!engine.unit_all_visible(1));

    // The next pass settles the unit again.
    let stats = engine.vacuum();
    assert_eq!(stats.versions_removed, 1);
    assert_eq!(stats.units_marked_all_visible, 1);
    assert!(engine.unit_all_visible(1));
}

#[test]
fn test_unit_with_open_write_is_not_all_visible() {
    let engine = create_test_engine();
    put(&engine, 1, b"committed");

    let open = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    engine.write(&open, 2, b"uncommitted".to_vec()).unwrap();

    let stats = engine.vacuum();
    assert_eq!(stats.units_marked_all_visible, 0);
    assert!(!engine.unit_all_visible(1));
    open.rollback().unwrap();
}

// ========== STATUS TABLE PRUNING ==========

#[test]
fn test_vacuum_prunes_status_table_after_freezing() {
    let engine = create_test_engine();
    for row in 0..5u64 {
        put(&engine, row, b"x");
    }
    assert_eq!(engine.metrics().retained_status_entries, 5);

    // Freezing stamps hint flags, after which the status entries of the
    // creators are prunable.
    engine.vacuum();
    assert_eq!(engine.metrics().retained_status_entries, 0);

    // Reads keep working through the hint flags alone.
    let check = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    for row in 0..5u64 {
        assert_eq!(engine.read(&check, row).unwrap(), Some(b"x".to_vec()));
    }
    check.rollback().unwrap();
}

#[test]
fn test_vacuum_keeps_status_of_recent_deleters() {
    let engine = create_test_engine();
    put(&engine, 1, b"base");

    // An open repeatable-read snapshot keeps the deleter's status entry
    // alive: visibility checks on the ghost still need it.
    let reader = engine.begin(IsolationLevel::RepeatableRead).unwrap();
    assert_eq!(engine.read(&reader, 1).unwrap(), Some(b"base".to_vec()));

    let deleter = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    engine.delete(&deleter, 1).unwrap();
    let deleter_id = deleter.txid();
    deleter.commit().unwrap();

    engine.vacuum();
    assert_eq!(
        engine.snapshot_of(&reader).unwrap().xmin,
        reader.txid(),
    );
    // The ghost is still readable, which requires resolving the deleter.
    assert_eq!(engine.read(&reader, 1).unwrap(), Some(b"base".to_vec()));
    assert!(engine.metrics().retained_status_entries > 0, "deleter {deleter_id} status must survive");
    reader.rollback().unwrap();
}

// ========== AUTOVACUUM ==========

#[test]
fn test_autovacuum_triggers_on_finished_transactions() {
    let engine = mvheap_storage::Engine::with_config(mvheap_storage::EngineConfig {
        lock_wait_timeout: Some(std::time::Duration::from_secs(5)),
        autovacuum_threshold: Some(4),
        rows_per_unit: 64,
    });

    put(&engine, 1, b"v1");
    put(&engine, 1, b"v2");
    put(&engine, 1, b"v3");
    put(&engine, 1, b"v4");

    // Four finished transactions crossed the threshold; the dead versions
    // are already unlinked, so a manual pass finds nothing.
    assert_eq!(engine.vacuum().versions_removed, 0);
    let check = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    assert_eq!(engine.read(&check, 1).unwrap(), Some(b"v4".to_vec()));
    check.rollback().unwrap();
}
