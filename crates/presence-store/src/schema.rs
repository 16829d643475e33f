//! Schema migrations tracked through `PRAGMA user_version`.

use rusqlite::Connection;
use thiserror::Error;

#[derive(Debug, Clone, Copy)]
struct Migration {
    version: u32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("migrations/0001_init.sql"),
}];

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("database schema version {db_version} is newer than supported {latest_supported}")]
    UnsupportedVersion {
        db_version: u32,
        latest_supported: u32,
    },
}

/// Latest schema version known by this binary.
pub fn latest_version() -> u32 {
    MIGRATIONS.last().map_or(0, |m| m.version)
}

/// Enable foreign keys and apply all pending migrations in one transaction.
pub fn bootstrap(conn: &mut Connection) -> Result<(), SchemaError> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    let current = current_version(conn)?;
    let latest = latest_version();
    if current > latest {
        return Err(SchemaError::UnsupportedVersion {
            db_version: current,
            latest_supported: latest,
        });
    }
    if current == latest {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tx.execute_batch(migration.sql)?;
        tx.execute_batch(&format!("PRAGMA user_version = {};", migration.version))?;
    }
    tx.commit()?;

    tracing::info!(from = current, to = latest, "database schema migrated");
    Ok(())
}

fn current_version(conn: &Connection) -> Result<u32, SchemaError> {
    Ok(conn.query_row("PRAGMA user_version;", [], |row| row.get::<_, u32>(0))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        bootstrap(&mut conn).unwrap();
        bootstrap(&mut conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), latest_version());

        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_newer_schema_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA user_version = 99;").unwrap();
        assert!(matches!(
            bootstrap(&mut conn),
            Err(SchemaError::UnsupportedVersion { db_version: 99, .. })
        ));
    }

    #[test]
    fn test_radius_must_be_positive() {
        let mut conn = Connection::open_in_memory().unwrap();
        bootstrap(&mut conn).unwrap();
        let res = conn.execute(
            "INSERT INTO zones (name, latitude, longitude, radius) VALUES ('x', 0, 0, 0)",
            [],
        );
        assert!(res.is_err());
    }
}
