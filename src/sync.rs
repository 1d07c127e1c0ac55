//! At-least-once upload of detection rows to a remote REST store.
//!
//! Rows are read from the local log, mapped to remote shape, and upserted
//! with a merge-duplicates preference keyed on the local row id. The local
//! synced flag flips only after the remote confirms, so a crash between
//! upload and flag write re-sends the same rows later and the upsert absorbs
//! the duplicate.

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use std::time::Duration;

use crate::storage::{DetectionRecord, DetectionStore};

/// Rows pulled from the local log per sync pass.
pub const SYNC_BATCH_LIMIT: usize = 200;

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Remote REST store coordinates.
#[derive(Clone, Debug)]
pub struct RemoteSettings {
    /// Base URL, e.g. `https://project.supabase.co`.
    pub url: String,
    pub api_key: String,
    pub table: String,
}

/// Remote side of the sync path. Implemented over HTTP in production and by
/// scripted fakes in tests.
pub trait RemoteStore {
    /// Upsert rows, merging on duplicate ids. All-or-nothing per call.
    fn upsert(&self, rows: &[Value]) -> Result<()>;

    /// Fetch the most recent rows, newest first.
    fn select(&self, limit: usize) -> Result<Vec<Value>>;

    /// Delete one row by its id.
    fn delete_by_id(&self, id: i64) -> Result<()>;

    /// Cheap reachability check.
    fn probe(&self) -> bool {
        self.select(1).is_ok()
    }
}

/// PostgREST-style remote store over HTTP.
pub struct HttpRemoteStore {
    agent: ureq::Agent,
    settings: RemoteSettings,
}

impl HttpRemoteStore {
    pub fn new(settings: RemoteSettings) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(HTTP_TIMEOUT)
            .build();
        Self { agent, settings }
    }

    fn table_url(&self) -> String {
        format!(
            "{}/rest/v1/{}",
            self.settings.url.trim_end_matches('/'),
            self.settings.table
        )
    }

    fn authorize(&self, request: ureq::Request) -> ureq::Request {
        request
            .set("apikey", &self.settings.api_key)
            .set(
                "Authorization",
                &format!("Bearer {}", self.settings.api_key),
            )
            .set("Content-Type", "application/json")
    }
}

impl RemoteStore for HttpRemoteStore {
    fn upsert(&self, rows: &[Value]) -> Result<()> {
        let request = self
            .authorize(self.agent.post(&self.table_url()))
            .set("Prefer", "resolution=merge-duplicates,return=minimal");
        request
            .send_json(json!(rows))
            .map_err(|e| anyhow!("remote upsert failed: {}", e))?;
        Ok(())
    }

    fn select(&self, limit: usize) -> Result<Vec<Value>> {
        let response = self
            .authorize(self.agent.get(&self.table_url()))
            .query("select", "*")
            .query("order", "timestamp.desc")
            .query("limit", &limit.to_string())
            .call()
            .map_err(|e| anyhow!("remote select failed: {}", e))?;
        let rows: Vec<Value> = response
            .into_json()
            .context("remote select returned malformed JSON")?;
        Ok(rows)
    }

    fn delete_by_id(&self, id: i64) -> Result<()> {
        self.authorize(self.agent.delete(&self.table_url()))
            .query("id", &format!("eq.{}", id))
            .call()
            .map_err(|e| anyhow!("remote delete failed: {}", e))?;
        Ok(())
    }

    fn probe(&self) -> bool {
        self.authorize(self.agent.get(&self.table_url()))
            .query("select", "id")
            .query("limit", "1")
            .call()
            .is_ok()
    }
}

/// Map a local row to remote shape: `road_class` travels as `class`, null
/// optionals are dropped, and the row is marked synced remotely. The local
/// id rides along as the upsert merge key.
pub fn remote_row(record: &DetectionRecord) -> Value {
    let mut row = serde_json::Map::new();
    row.insert("id".to_string(), json!(record.id));
    row.insert("camera_id".to_string(), json!(record.camera_id));
    row.insert("class".to_string(), json!(record.road_class));
    row.insert("confidence".to_string(), json!(record.confidence));
    if let Some(width) = record.width_cm {
        row.insert("width_cm".to_string(), json!(width));
    }
    if let Some(depth) = record.depth_cm {
        row.insert("depth_cm".to_string(), json!(depth));
    }
    row.insert("bbox_x1".to_string(), json!(record.bbox_x1));
    row.insert("bbox_y1".to_string(), json!(record.bbox_y1));
    row.insert("bbox_x2".to_string(), json!(record.bbox_x2));
    row.insert("bbox_y2".to_string(), json!(record.bbox_y2));
    if let Some(latitude) = record.latitude {
        row.insert("latitude".to_string(), json!(latitude));
    }
    if let Some(longitude) = record.longitude {
        row.insert("longitude".to_string(), json!(longitude));
    }
    if let Some(image_path) = &record.image_path {
        row.insert("image_path".to_string(), json!(image_path));
    }
    row.insert("timestamp".to_string(), json!(record.timestamp));
    row.insert("synced".to_string(), json!(true));
    Value::Object(row)
}

/// Retrying upload client over any remote store.
pub struct SyncClient<R: RemoteStore> {
    remote: R,
    max_attempts: u32,
    initial_backoff: Duration,
}

impl<R: RemoteStore> SyncClient<R> {
    pub fn new(remote: R) -> Self {
        Self {
            remote,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
        }
    }

    /// Same client with a custom retry schedule. Tests use a zero backoff.
    pub fn with_backoff(remote: R, max_attempts: u32, initial_backoff: Duration) -> Self {
        Self {
            remote,
            max_attempts: max_attempts.max(1),
            initial_backoff,
        }
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Upload a batch, retrying with a doubling delay. Fails only after all
    /// attempts fail; the caller leaves the rows unsynced for a later pass.
    pub fn upload(&self, rows: &[DetectionRecord]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let payload: Vec<Value> = rows.iter().map(remote_row).collect();

        let mut backoff = self.initial_backoff;
        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            match self.remote.upsert(&payload) {
                Ok(()) => {
                    log::info!("synced {} detection(s) to remote", rows.len());
                    return Ok(());
                }
                Err(e) => {
                    log::warn!(
                        "sync attempt {}/{} failed: {}",
                        attempt,
                        self.max_attempts,
                        e
                    );
                    last_error = Some(e);
                    if attempt < self.max_attempts {
                        std::thread::sleep(backoff);
                        backoff *= 2;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("sync failed")))
    }
}

/// One sync pass: read unsynced rows, upload, flip their synced flags.
/// Returns the number of rows confirmed synced. A failed pass leaves every
/// row unsynced for the next pass.
pub fn run_sync<R: RemoteStore>(store: &DetectionStore, client: &SyncClient<R>) -> Result<usize> {
    let rows = store.unsynced(SYNC_BATCH_LIMIT)?;
    if rows.is_empty() {
        return Ok(0);
    }
    client.upload(&rows)?;
    let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
    store.mark_synced(&ids)?;
    Ok(rows.len())
}
