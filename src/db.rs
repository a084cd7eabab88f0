//! Local SQLite store for the fulfillment engine.
//!
//! Uses rusqlite with WAL mode. Holds the locally persisted order notes
//! (the "save locally first" half of note reconciliation), offline order
//! snapshots mirroring the navigation cache, and a small category/key/value
//! settings table for sync bookkeeping.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::FulfillmentOrder;

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create data dir: {0}")]
    DataDir(#[from] std::io::Error),
    #[error("database lock poisoned")]
    LockPoisoned,
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt snapshot for order {order_id}: {reason}")]
    CorruptSnapshot { order_id: String, reason: String },
}

// ---------------------------------------------------------------------------
// Initialisation
// ---------------------------------------------------------------------------

/// Initialize the database at `{data_dir}/atelier-ops.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, StoreError> {
    fs::create_dir_all(data_dir)?;

    let db_path = data_dir.join("atelier-ops.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path)?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open an in-memory database. Used by tests and ephemeral hosts.
pub fn init_in_memory() -> Result<DbState, StoreError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: settings and order notes.
fn migrate_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- last locally saved free-text note per order
        CREATE TABLE IF NOT EXISTS order_notes (
            order_id TEXT PRIMARY KEY,
            note TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )?;
    Ok(())
}

/// Migration v2: offline order snapshots.
fn migrate_v2(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS order_snapshots (
            order_id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            fetched_at TEXT NOT NULL
        );

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Order notes
// ---------------------------------------------------------------------------

/// Read the locally persisted note for an order, if any.
pub fn get_note(db: &DbState, order_id: &str) -> Result<Option<String>, StoreError> {
    let conn = db.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
    let note = conn
        .query_row(
            "SELECT note FROM order_notes WHERE order_id = ?1",
            params![order_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(note)
}

/// Persist the note for an order locally. Always succeeds from the
/// caller's perspective short of a storage-level failure.
pub fn save_note(db: &DbState, order_id: &str, note: &str) -> Result<(), StoreError> {
    let conn = db.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
    conn.execute(
        "INSERT INTO order_notes (order_id, note, updated_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(order_id) DO UPDATE SET
            note = excluded.note,
            updated_at = excluded.updated_at",
        params![order_id, note],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Order snapshots
// ---------------------------------------------------------------------------

/// Persist an order snapshot so a restarted host can show the last known
/// state offline. Replaces any previous snapshot for the order.
pub fn save_snapshot(db: &DbState, order: &FulfillmentOrder) -> Result<(), StoreError> {
    let payload = serde_json::to_string(order).map_err(|e| StoreError::CorruptSnapshot {
        order_id: order.id.clone(),
        reason: e.to_string(),
    })?;
    let conn = db.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
    conn.execute(
        "INSERT INTO order_snapshots (order_id, payload, fetched_at)
         VALUES (?1, ?2, datetime('now'))
         ON CONFLICT(order_id) DO UPDATE SET
            payload = excluded.payload,
            fetched_at = excluded.fetched_at",
        params![order.id, payload],
    )?;
    Ok(())
}

/// Load a previously persisted order snapshot.
pub fn load_snapshot(db: &DbState, order_id: &str) -> Result<Option<FulfillmentOrder>, StoreError> {
    let conn = db.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
    let raw = conn
        .query_row(
            "SELECT payload FROM order_snapshots WHERE order_id = ?1",
            params![order_id],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    drop(conn);

    match raw {
        None => Ok(None),
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StoreError::CorruptSnapshot {
                order_id: order_id.to_string(),
                reason: e.to_string(),
            }),
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

pub fn get_setting(db: &DbState, category: &str, key: &str) -> Option<String> {
    let conn = db.conn.lock().ok()?;
    conn.query_row(
        "SELECT setting_value FROM local_settings
         WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get::<_, String>(0),
    )
    .ok()
}

pub fn set_setting(db: &DbState, category: &str, key: &str, value: &str) -> Result<(), StoreError> {
    let conn = db.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OperationalStatus, ShippingMethodClass};

    fn sample_order(id: &str) -> FulfillmentOrder {
        FulfillmentOrder {
            id: id.to_string(),
            external_id: Some(format!("ext-{id}")),
            operational_status: OperationalStatus::Packing,
            cancelled: false,
            shipping_method_class: ShippingMethodClass::Standard,
            line_items: vec![],
            note: None,
            packed_at: None,
            packed_by: None,
            shipping_label: None,
        }
    }

    #[test]
    fn note_upsert_replaces_previous_value() {
        let db = init_in_memory().unwrap();
        assert_eq!(get_note(&db, "ord-1").unwrap(), None);

        save_note(&db, "ord-1", "hem taken up 2cm").unwrap();
        save_note(&db, "ord-1", "hem taken up 2cm, pressed").unwrap();

        assert_eq!(
            get_note(&db, "ord-1").unwrap().as_deref(),
            Some("hem taken up 2cm, pressed")
        );
    }

    #[test]
    fn snapshot_round_trip() {
        let db = init_in_memory().unwrap();
        let order = sample_order("ord-2");
        save_snapshot(&db, &order).unwrap();

        let loaded = load_snapshot(&db, "ord-2").unwrap().unwrap();
        assert_eq!(loaded.id, "ord-2");
        assert_eq!(loaded.operational_status, OperationalStatus::Packing);
        assert!(load_snapshot(&db, "ord-9").unwrap().is_none());
    }

    #[test]
    fn migrations_are_idempotent() {
        let db = init_in_memory().unwrap();
        let conn = db.conn.lock().unwrap();
        // Re-running against an up-to-date schema is a no-op.
        run_migrations(&conn).unwrap();
        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn settings_store_round_trip() {
        let db = init_in_memory().unwrap();
        assert_eq!(get_setting(&db, "sync", "last_confirmed_at"), None);
        set_setting(&db, "sync", "last_confirmed_at", "2026-08-05T09:00:00Z").unwrap();
        assert_eq!(
            get_setting(&db, "sync", "last_confirmed_at").as_deref(),
            Some("2026-08-05T09:00:00Z")
        );
    }
}
