use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::errors::{AppError, AppResult};

pub const OBSERVATION_TABLE: &str = "gebaeudebrueter";

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

pub fn bootstrap<P: AsRef<Path>>(db_path: P) -> AppResult<DatabaseContext> {
    let db_path = db_path.as_ref();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(db_path, flags)?;
    run_migrations(&connection)?;
    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        "store opened"
    );

    Ok(DatabaseContext {
        connection,
        path: db_path.to_path_buf(),
    })
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS gebaeudebrueter (
            web_id INTEGER PRIMARY KEY,
            bezirk TEXT,
            plz TEXT,
            ort TEXT,
            strasse TEXT,
            mauersegler INTEGER,
            sperling INTEGER,
            schwalbe INTEGER,
            fledermaus INTEGER,
            star INTEGER,
            andere INTEGER,
            new INTEGER NOT NULL DEFAULT 1,
            no_geocode INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS geolocation_osm (
            web_id INTEGER PRIMARY KEY,
            longitude REAL,
            latitude REAL,
            location TEXT,
            complete_response TEXT
        );

        CREATE TABLE IF NOT EXISTS geolocation_google (
            web_id INTEGER PRIMARY KEY,
            longitude REAL,
            latitude REAL,
            location TEXT,
            complete_response TEXT
        );
        "#,
    )?;

    ensure_column(connection, OBSERVATION_TABLE, "new INTEGER NOT NULL DEFAULT 1")?;
    ensure_column(
        connection,
        OBSERVATION_TABLE,
        "no_geocode INTEGER NOT NULL DEFAULT 0",
    )?;
    Ok(())
}

fn ensure_column(connection: &Connection, table: &str, definition: &str) -> AppResult<()> {
    let column_name = definition
        .split_whitespace()
        .next()
        .ok_or_else(|| AppError::Config(format!("invalid column definition: {definition}")))?;
    if column_exists(connection, table, column_name)? {
        return Ok(());
    }
    let sql = format!("ALTER TABLE {table} ADD COLUMN {definition}");
    connection.execute(&sql, [])?;
    Ok(())
}

fn column_exists(connection: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({table})");
    let mut stmt = connection.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

// Read-only: never creates or migrates. Ok(None) when the file is absent.
pub fn count_observations(db_path: &Path) -> AppResult<Option<u64>> {
    if !db_path.exists() {
        return Ok(None);
    }
    let connection = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let count: i64 =
        connection.query_row(&format!("SELECT COUNT(*) FROM {OBSERVATION_TABLE}"), [], |row| {
            row.get(0)
        })?;
    Ok(Some(count.max(0) as u64))
}
