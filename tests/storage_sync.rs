//! At-least-once sync behavior over the real local log and a scripted
//! remote store.

use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::sync::Mutex;
use std::time::Duration;

use roadwatch::{run_sync, DetectionStore, NewDetection, RemoteStore, SyncClient};

/// Scripted remote: rejects the first `failures` upserts, accepts after.
struct ScriptedRemote {
    failures: Mutex<u32>,
    rows: Mutex<Vec<Value>>,
}

impl ScriptedRemote {
    fn new(failures: u32) -> Self {
        Self {
            failures: Mutex::new(failures),
            rows: Mutex::new(Vec::new()),
        }
    }

    fn stored_rows(&self) -> Vec<Value> {
        self.rows.lock().expect("rows lock").clone()
    }
}

impl RemoteStore for ScriptedRemote {
    fn upsert(&self, rows: &[Value]) -> Result<()> {
        let mut failures = self.failures.lock().expect("failures lock");
        if *failures > 0 {
            *failures -= 1;
            return Err(anyhow!("simulated network failure"));
        }
        let mut stored = self.rows.lock().expect("rows lock");
        for row in rows {
            // Merge on id, as the real upsert does.
            let id = row["id"].clone();
            if let Some(existing) = stored.iter_mut().find(|existing| existing["id"] == id) {
                *existing = row.clone();
            } else {
                stored.push(row.clone());
            }
        }
        Ok(())
    }

    fn select(&self, limit: usize) -> Result<Vec<Value>> {
        Ok(self.stored_rows().into_iter().take(limit).collect())
    }

    fn delete_by_id(&self, id: i64) -> Result<()> {
        self.rows
            .lock()
            .expect("rows lock")
            .retain(|row| row["id"] != json!(id));
        Ok(())
    }
}

fn open_store(dir: &tempfile::TempDir) -> DetectionStore {
    let path = dir.path().join("detections.db");
    DetectionStore::open(path.to_str().expect("utf8 path")).expect("open store")
}

fn pothole(camera_id: &str, confidence: f64) -> NewDetection {
    NewDetection {
        camera_id: camera_id.to_string(),
        road_class: "berlubang".to_string(),
        confidence,
        width_cm: Some(28.0),
        depth_cm: Some(4.5),
        bbox_y1: 0.5,
        bbox_x1: 0.3,
        bbox_y2: 0.8,
        bbox_x2: 0.7,
        ..NewDetection::default()
    }
}

#[test]
fn outage_then_recovery_syncs_every_row_once() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open_store(&dir);
    store.insert(&pothole("cam0", 0.8)).expect("insert");
    store.insert(&pothole("cam0", 0.7)).expect("insert");

    // Three straight failures exhaust the retry schedule; rows stay local.
    let client = SyncClient::with_backoff(ScriptedRemote::new(3), 3, Duration::ZERO);
    assert!(run_sync(&store, &client).is_err());
    assert_eq!(store.unsynced_count().expect("count"), 2);
    assert!(client.remote().stored_rows().is_empty());

    // The remote recovers; the next pass delivers both rows and flips
    // their flags.
    let synced = run_sync(&store, &client).expect("recovery pass");
    assert_eq!(synced, 2);
    assert_eq!(store.unsynced_count().expect("count"), 0);
    assert_eq!(client.remote().stored_rows().len(), 2);

    // A further pass has nothing to send.
    assert_eq!(run_sync(&store, &client).expect("idle pass"), 0);
}

#[test]
fn retry_within_one_pass_absorbs_transient_failures() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open_store(&dir);
    store.insert(&pothole("cam1", 0.9)).expect("insert");

    // Two failures, then success, all inside a single pass.
    let client = SyncClient::with_backoff(ScriptedRemote::new(2), 3, Duration::ZERO);
    assert_eq!(run_sync(&store, &client).expect("pass"), 1);
    assert_eq!(store.unsynced_count().expect("count"), 0);
}

#[test]
fn remote_rows_use_remote_schema() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open_store(&dir);
    let id = store
        .insert(&NewDetection {
            camera_id: "cam0".to_string(),
            road_class: "retak_buaya".to_string(),
            confidence: 0.65,
            width_cm: Some(40.0),
            depth_cm: None,
            bbox_y1: 0.4,
            bbox_x1: 0.2,
            bbox_y2: 0.6,
            bbox_x2: 0.5,
            ..NewDetection::default()
        })
        .expect("insert");

    let client = SyncClient::with_backoff(ScriptedRemote::new(0), 1, Duration::ZERO);
    run_sync(&store, &client).expect("pass");

    let rows = client.remote().stored_rows();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row["id"], json!(id));
    assert_eq!(row["class"], json!("retak_buaya"));
    assert!(row.get("road_class").is_none(), "local column name must not leak");
    assert_eq!(row["width_cm"], json!(40.0));
    assert!(row.get("depth_cm").is_none(), "null optionals are dropped");
    assert_eq!(row["synced"], json!(true));
}

#[test]
fn duplicate_delivery_merges_on_id() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open_store(&dir);
    store.insert(&pothole("cam0", 0.8)).expect("insert");

    let client = SyncClient::with_backoff(ScriptedRemote::new(0), 1, Duration::ZERO);
    let rows = store.unsynced(10).expect("rows");

    // Simulate a crash between upload and flag write: the same rows go out
    // twice. The id-keyed upsert leaves a single remote row.
    client.upload(&rows).expect("first delivery");
    client.upload(&rows).expect("second delivery");
    assert_eq!(client.remote().stored_rows().len(), 1);

    store
        .mark_synced(&rows.iter().map(|row| row.id).collect::<Vec<_>>())
        .expect("mark synced");
    assert_eq!(store.unsynced_count().expect("count"), 0);
}

#[test]
fn sync_batches_respect_insertion_order() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store = open_store(&dir);
    let first = store.insert(&pothole("cam0", 0.6)).expect("insert");
    let second = store.insert(&pothole("cam0", 0.9)).expect("insert");
    assert!(second > first);

    let client = SyncClient::with_backoff(ScriptedRemote::new(0), 1, Duration::ZERO);
    run_sync(&store, &client).expect("pass");

    let rows = client.remote().stored_rows();
    assert_eq!(rows[0]["id"], json!(first));
    assert_eq!(rows[1]["id"], json!(second));
}
