//! Append-only local detection log.
//!
//! Every logical operation takes the store mutex (single-writer discipline),
//! which is sufficient at expected detection rates and needs no pooling.
//! A closed store reopens transparently on the next operation, so callers
//! never track open/closed state.

use anyhow::{anyhow, Result};
use rusqlite::{params, params_from_iter, Connection, Row};
use serde::Serialize;
use std::sync::Mutex;

/// One persisted detection row. Immutable except the `synced` flag, which
/// transitions 0 -> 1 exactly once after a confirmed remote upsert.
#[derive(Clone, Debug, Serialize)]
pub struct DetectionRecord {
    pub id: i64,
    pub camera_id: String,
    pub road_class: String,
    pub confidence: f64,
    pub width_cm: Option<f64>,
    pub depth_cm: Option<f64>,
    pub bbox_x1: f64,
    pub bbox_y1: f64,
    pub bbox_x2: f64,
    pub bbox_y2: f64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub image_path: Option<String>,
    pub timestamp: String,
    pub synced: bool,
}

/// A detection ready for insertion; id, timestamp, and the synced flag are
/// assigned by the store.
#[derive(Clone, Debug, Default)]
pub struct NewDetection {
    pub camera_id: String,
    pub road_class: String,
    pub confidence: f64,
    pub width_cm: Option<f64>,
    pub depth_cm: Option<f64>,
    pub bbox_x1: f64,
    pub bbox_y1: f64,
    pub bbox_x2: f64,
    pub bbox_y2: f64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub image_path: Option<String>,
}

/// Per-class aggregate over the whole log.
#[derive(Clone, Debug, Serialize)]
pub struct ClassStats {
    pub road_class: String,
    pub count: i64,
    pub avg_confidence: Option<f64>,
    pub avg_width: Option<f64>,
    pub avg_depth: Option<f64>,
}

pub struct DetectionStore {
    db_path: String,
    conn: Mutex<Option<Connection>>,
}

impl DetectionStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_connection(db_path)?;
        Ok(Self {
            db_path: db_path.to_string(),
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Append a detection. Returns the auto-assigned id (monotonically
    /// increasing, never reused).
    pub fn insert(&self, detection: &NewDetection) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO detections(
                  camera_id, road_class, confidence, width_cm, depth_cm,
                  bbox_x1, bbox_y1, bbox_x2, bbox_y2,
                  latitude, longitude, image_path, synced
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0)
                "#,
                params![
                    detection.camera_id,
                    detection.road_class,
                    detection.confidence,
                    detection.width_cm,
                    detection.depth_cm,
                    detection.bbox_x1,
                    detection.bbox_y1,
                    detection.bbox_x2,
                    detection.bbox_y2,
                    detection.latitude,
                    detection.longitude,
                    detection.image_path,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Rows not yet uploaded, ordered by id ascending.
    pub fn unsynced(&self, limit: usize) -> Result<Vec<DetectionRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM detections WHERE synced = 0 ORDER BY id ASC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], row_to_record)?;
            collect_records(rows)
        })
    }

    /// Flip the synced flag for the given ids. Idempotent: already-synced
    /// ids are unchanged, and the flag never goes back to 0.
    pub fn mark_synced(&self, ids: &[i64]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.with_conn(|conn| {
            let placeholders = std::iter::repeat("?")
                .take(ids.len())
                .collect::<Vec<_>>()
                .join(",");
            let query = format!("UPDATE detections SET synced = 1 WHERE id IN ({})", placeholders);
            conn.execute(&query, params_from_iter(ids.iter()))?;
            Ok(())
        })
    }

    /// Per-class count and averages.
    pub fn class_stats(&self) -> Result<Vec<ClassStats>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r#"
                SELECT road_class, COUNT(*), AVG(confidence), AVG(width_cm), AVG(depth_cm)
                FROM detections GROUP BY road_class ORDER BY road_class
                "#,
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(ClassStats {
                    road_class: row.get(0)?,
                    count: row.get(1)?,
                    avg_confidence: row.get(2)?,
                    avg_width: row.get(3)?,
                    avg_depth: row.get(4)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Most recent rows, ordered by timestamp descending.
    pub fn recent(&self, limit: usize) -> Result<Vec<DetectionRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM detections ORDER BY timestamp DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], row_to_record)?;
            collect_records(rows)
        })
    }

    pub fn total_count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM detections", [], |row| row.get(0))?)
        })
    }

    pub fn unsynced_count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM detections WHERE synced = 0",
                [],
                |row| row.get(0),
            )?)
        })
    }

    /// Close the connection. The next operation reopens it transparently.
    pub fn close(&self) {
        let mut guard = lock_conn(&self.conn);
        *guard = None;
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut guard = lock_conn(&self.conn);
        if guard.is_none() {
            *guard = Some(open_connection(&self.db_path)?);
        }
        let conn = guard
            .as_ref()
            .ok_or_else(|| anyhow!("detection store connection unavailable"))?;
        f(conn)
    }
}

fn lock_conn(conn: &Mutex<Option<Connection>>) -> std::sync::MutexGuard<'_, Option<Connection>> {
    conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn open_connection(db_path: &str) -> Result<Connection> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS detections (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          camera_id TEXT NOT NULL,
          road_class TEXT NOT NULL,
          confidence REAL NOT NULL,
          width_cm REAL,
          depth_cm REAL,
          bbox_x1 REAL,
          bbox_y1 REAL,
          bbox_x2 REAL,
          bbox_y2 REAL,
          latitude REAL,
          longitude REAL,
          image_path TEXT,
          timestamp DATETIME DEFAULT CURRENT_TIMESTAMP,
          synced INTEGER DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_detections_synced ON detections(synced);
        CREATE INDEX IF NOT EXISTS idx_detections_class ON detections(road_class);
        CREATE INDEX IF NOT EXISTS idx_detections_timestamp ON detections(timestamp DESC);
        "#,
    )?;
    Ok(conn)
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<DetectionRecord> {
    Ok(DetectionRecord {
        id: row.get("id")?,
        camera_id: row.get("camera_id")?,
        road_class: row.get("road_class")?,
        confidence: row.get("confidence")?,
        width_cm: row.get("width_cm")?,
        depth_cm: row.get("depth_cm")?,
        bbox_x1: row.get("bbox_x1")?,
        bbox_y1: row.get("bbox_y1")?,
        bbox_x2: row.get("bbox_x2")?,
        bbox_y2: row.get("bbox_y2")?,
        latitude: row.get("latitude")?,
        longitude: row.get("longitude")?,
        image_path: row.get("image_path")?,
        timestamp: row.get("timestamp")?,
        synced: row.get::<_, i64>("synced")? != 0,
    })
}

fn collect_records(
    rows: impl Iterator<Item = rusqlite::Result<DetectionRecord>>,
) -> Result<Vec<DetectionRecord>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
