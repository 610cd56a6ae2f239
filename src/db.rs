//! Local SQLite database layer for Coworking Desk.
//!
//! Uses rusqlite with WAL mode. The schema mirrors the hosted Postgres
//! tables the dashboard was built against (`clients`, `check_ins`,
//! `session_line_items`, `receipts`, `stock`, ...). Provides migrations,
//! settings helpers and the shared state handed to every operation.

use chrono::Utc;
use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{DeskError, DeskResult};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Run `f` with the connection locked for the duration of the call only.
    ///
    /// Multi-step workflows call this once per step, so other requests can
    /// interleave between steps the same way they would against the hosted
    /// database.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> DeskResult<T>) -> DeskResult<T> {
        let conn = self.conn.lock()?;
        f(&conn)
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/desk.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. If the file cannot be opened it is
/// moved aside to `desk.db.corrupt-<timestamp>` (with its WAL and SHM
/// files) and a fresh database is created. Receipts live here, so the bad
/// file is never deleted.
pub fn init(data_dir: &Path) -> DeskResult<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| DeskError::Internal(format!("Failed to create data dir: {e}")))?;

    let db_path = data_dir.join("desk.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), moving it aside and retrying once",
                first_err
            );
            if db_path.exists() {
                quarantine(&db_path)?;
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

/// Rename `desk.db` and its `-wal`/`-shm` companions with a
/// `.corrupt-<timestamp>` suffix. Returns the new database path.
fn quarantine(db_path: &Path) -> DeskResult<PathBuf> {
    let suffix = format!("corrupt-{}", Utc::now().format("%Y%m%d%H%M%S"));
    let target = append_suffix(db_path, &suffix);
    fs::rename(db_path, &target).map_err(|e| {
        DeskError::Internal(format!(
            "Failed to move unreadable database {} aside: {e}",
            db_path.display()
        ))
    })?;
    for companion in ["wal", "shm"] {
        let path = db_path.with_extension(format!("db-{companion}"));
        if path.exists() {
            let moved = append_suffix(&path, &suffix);
            if let Err(e) = fs::rename(&path, &moved) {
                warn!("Failed to move {} aside: {e}", path.display());
            }
        }
    }
    error!("Unreadable database preserved at {}", target.display());
    Ok(target)
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> DeskResult<Connection> {
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
fn run_migrations(conn: &Connection) -> DeskResult<()> {
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
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

fn apply(conn: &Connection, version: i32, sql: &str) -> DeskResult<()> {
    conn.execute_batch(sql).map_err(|e| {
        error!("Migration v{version} failed: {e}");
        DeskError::from(e)
    })
}

/// Migration v1: settings, client registry and presence tracking.
fn migrate_v1(conn: &Connection) -> DeskResult<()> {
    apply(
        conn,
        1,
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- clients (active = on premises, is_active = not soft-deleted)
        CREATE TABLE IF NOT EXISTS clients (
            id TEXT PRIMARY KEY,
            client_code TEXT NOT NULL UNIQUE,
            barcode TEXT NOT NULL UNIQUE,
            full_name TEXT NOT NULL,
            phone TEXT,
            email TEXT,
            active INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- check_ins (one open row per client at most)
        CREATE TABLE IF NOT EXISTS check_ins (
            id TEXT PRIMARY KEY,
            client_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'checked_in' CHECK (status IN ('checked_in', 'checked_out')),
            checked_in_at TEXT NOT NULL,
            checked_out_at TEXT,
            FOREIGN KEY(client_id) REFERENCES clients(id)
        );

        -- checkin_logs (append-only audit trail of scans)
        CREATE TABLE IF NOT EXISTS checkin_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            client_id TEXT NOT NULL,
            action TEXT NOT NULL,
            scanned_by TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_clients_barcode ON clients(barcode);
        CREATE INDEX IF NOT EXISTS idx_clients_client_code ON clients(client_code);
        CREATE INDEX IF NOT EXISTS idx_check_ins_client_status ON check_ins(client_id, status);
        CREATE INDEX IF NOT EXISTS idx_checkin_logs_client ON checkin_logs(client_id);
        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key ON local_settings(setting_category, setting_key);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )?;
    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: order lines and receipts.
fn migrate_v2(conn: &Connection) -> DeskResult<()> {
    apply(
        conn,
        2,
        "
        CREATE TABLE IF NOT EXISTS session_line_items (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            item_name TEXT NOT NULL,
            quantity INTEGER NOT NULL DEFAULT 1,
            price REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'preparing', 'completed', 'served', 'cancelled')),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(user_id) REFERENCES clients(id)
        );

        -- receipts (immutable snapshot; only flipped to cancelled on refund)
        CREATE TABLE IF NOT EXISTS receipts (
            id TEXT PRIMARY KEY,
            receipt_number TEXT NOT NULL UNIQUE,
            user_id TEXT NOT NULL,
            line_items TEXT NOT NULL DEFAULT '[]',
            subtotal REAL NOT NULL DEFAULT 0,
            discount REAL NOT NULL DEFAULT 0,
            total_amount REAL NOT NULL DEFAULT 0,
            payment_method TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active' CHECK (status IN ('active', 'cancelled')),
            cancelled_at TEXT,
            cancelled_by TEXT,
            cancellation_reason TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_line_items_user_status ON session_line_items(user_id, status);
        CREATE INDEX IF NOT EXISTS idx_receipts_user ON receipts(user_id);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )?;
    info!("Applied migration v2 (line items, receipts)");
    Ok(())
}

/// Migration v3: stock and product recipes.
///
/// `product_ingredients.stock_id` carries no foreign key: a dangling
/// reference is only detected when stock is deducted.
fn migrate_v3(conn: &Connection) -> DeskResult<()> {
    apply(
        conn,
        3,
        "
        CREATE TABLE IF NOT EXISTS stock (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            current_quantity REAL NOT NULL DEFAULT 0,
            min_quantity REAL NOT NULL DEFAULT 0,
            cost_per_unit REAL NOT NULL DEFAULT 0,
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS product_ingredients (
            product_id TEXT NOT NULL,
            stock_id TEXT NOT NULL,
            quantity_needed REAL NOT NULL,
            PRIMARY KEY (product_id, stock_id)
        );

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )?;
    info!("Applied migration v3 (stock, product_ingredients)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Read a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> DeskResult<()> {
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

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

/// Fresh in-memory database with every migration applied.
#[cfg(test)]
pub fn test_state() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .expect("pragma setup");
    run_migrations_for_test(&conn);
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
