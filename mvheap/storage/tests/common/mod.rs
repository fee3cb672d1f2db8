use std::sync::Arc;
use std::time::Duration;

use mvheap_storage::{Engine, EngineConfig, IsolationLevel, RowKey};

/// Engine with a bounded lock wait so a buggy test fails instead of
/// hanging, and without automatic vacuum so reclamation tests control
/// every pass themselves.
pub fn create_test_engine() -> Arc<Engine> {
    Engine::with_config(EngineConfig {
        lock_wait_timeout: Some(Duration::from_secs(5)),
        autovacuum_threshold: None,
        rows_per_unit: 64,
    })
}

/// Seed committed rows through a single transaction.
#[allow(dead_code)]
pub fn seed_rows(engine: &Arc<Engine>, rows: &[(RowKey, &[u8])]) {
    let txn = engine.begin(IsolationLevel::ReadCommitted).unwrap();
    for (row, payload) in rows {
        engine.write(&txn, *row, payload.to_vec()).unwrap();
    }
    txn.commit().unwrap();
}

/// Write and commit a single row.
#[allow(dead_code)]
pub fn put(engine: &Arc<Engine>, row: RowKey, payload: &[u8]) {
    seed_rows(engine, &[(row, payload)]);
}
