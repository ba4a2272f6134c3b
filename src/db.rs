use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::errors::{AppError, AppResult};

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

/// Opens (creating if needed) the location database and brings the schema up
/// to date. `busy_timeout` bounds how long a write waits on a locked file
/// before failing with a persistence error.
pub fn bootstrap<P: AsRef<Path>>(db_path: P, busy_timeout: Duration) -> AppResult<DatabaseContext> {
    let db_path = db_path.as_ref();
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(db_path, flags)?;
    connection.busy_timeout(busy_timeout)?;
    configure(&connection)?;
    run_migrations(&connection)?;

    info!(
        target: "database_bootstrap",
        path = %db_path.display(),
        busy_timeout_ms = busy_timeout.as_millis() as u64,
        "location database ready"
    );
    Ok(DatabaseContext {
        connection,
        path: db_path.to_path_buf(),
    })
}

fn configure(connection: &Connection) -> AppResult<()> {
    // journal_mode returns a row, so it cannot go through execute_batch.
    let mode: String = connection.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") && !mode.eq_ignore_ascii_case("memory") {
        return Err(AppError::Config(format!(
            "unable to enable WAL journal mode (got {mode})"
        )));
    }
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS location_info (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            address TEXT NOT NULL,
            city TEXT NOT NULL DEFAULT '',
            bd_lng REAL,
            bd_lat REAL,
            wgs_lng REAL,
            wgs_lat REAL,
            confidence INTEGER CHECK (confidence IS NULL OR confidence BETWEEN 0 AND 100),
            comprehension INTEGER CHECK (comprehension IS NULL OR comprehension BETWEEN 0 AND 100),
            precise INTEGER CHECK (precise IS NULL OR precise IN (0, 1)),
            level TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_location_info_pending ON location_info(wgs_lng, id);
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn bootstrap_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("locations.db");

        {
            let context = bootstrap(&path, Duration::from_millis(100)).unwrap();
            context
                .connection
                .execute(
                    "INSERT INTO location_info (address, city) VALUES ('a', 'b')",
                    [],
                )
                .unwrap();
        }

        let context = bootstrap(&path, Duration::from_millis(100)).unwrap();
        let count: i64 = context
            .connection
            .query_row("SELECT COUNT(*) FROM location_info", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(context.path, path);
    }

    #[test]
    fn rejects_out_of_range_metadata() {
        let dir = tempdir().unwrap();
        let context = bootstrap(dir.path().join("checks.db"), Duration::from_millis(100)).unwrap();
        let result = context.connection.execute(
            "INSERT INTO location_info (address, precise) VALUES ('x', 5)",
            [],
        );
        assert!(result.is_err());
    }
}
