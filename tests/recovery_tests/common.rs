//! Shared helpers for recovery tests

use std::path::{Path, PathBuf};

use statecore::config::{Config, SyncMode};
use statecore::snapshot::SnapshotStore;
use statecore::Engine;
use tempfile::TempDir;

pub fn config_for(dir: &Path) -> Config {
    Config::builder()
        .data_dir(dir)
        .report_dir(dir.join("reports"))
        .sync_mode(SyncMode::Data)
        .build()
}

pub fn open_ready(dir: &TempDir) -> Engine {
    let (engine, _) = Engine::open_and_recover(config_for(dir.path())).unwrap();
    engine
}

pub fn commit_put(engine: &Engine, tx_id: &str, key: &str, value: &str) {
    let mut tx = engine.begin_transaction(tx_id).unwrap();
    tx.put(key, value);
    engine.commit_transaction(&mut tx).unwrap();
}

pub fn store(engine: &Engine) -> SnapshotStore {
    SnapshotStore::open(engine.snapshot_dir(), SyncMode::Data).unwrap()
}

pub fn canonical_path(dir: &TempDir) -> PathBuf {
    dir.path().join("snapshots").join("state.snapshot")
}
