//! Versioned, reversible schema migrations.
//!
//! The schema version is the length of the migration list handed to the
//! engine. Applied migrations are persisted with their rollback SQL so a
//! shorter list can unwind the database to the requested version, newest
//! first. Each step (forward or backward) runs in its own transaction;
//! a failure between steps surfaces immediately and leaves the recorded
//! version consistent with what actually ran.

use rusqlite::{params, Connection};

use crate::error::Result;

/// A forward/rollback SQL pair.
#[derive(Debug, Clone)]
pub struct Migration {
    /// SQL applied when migrating forward.
    pub up: String,
    /// SQL applied when rolling back.
    pub down: String,
}

impl Migration {
    /// Creates a migration from its forward and rollback SQL.
    pub fn new(up: impl Into<String>, down: impl Into<String>) -> Self {
        Self {
            up: up.into(),
            down: down.into(),
        }
    }
}

/// Versions before and after a [`run`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    /// Applied version found in the store before the call.
    pub prev: i64,
    /// Applied version after the call; equals the migration list length.
    pub curr: i64,
}

/// Brings the store to the version implied by `migrations`.
pub(crate) fn run(conn: &mut Connection, migrations: &[Migration]) -> Result<MigrationReport> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            up TEXT NOT NULL,
            down TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let prev: i64 = conn.query_row("SELECT COALESCE(MAX(id), 0) FROM migrations", [], |row| {
        row.get(0)
    })?;
    let target = i64::try_from(migrations.len()).unwrap_or(i64::MAX);

    if target > prev {
        for id in (prev + 1)..=target {
            #[allow(clippy::cast_sign_loss)]
            let migration = &migrations[(id - 1) as usize];
            let tx = conn.transaction()?;
            tx.execute_batch(&migration.up)?;
            tx.execute(
                "INSERT INTO migrations (id, up, down) VALUES (?1, ?2, ?3)",
                params![id, migration.up, migration.down],
            )?;
            tx.commit()?;
            tracing::info!(id, "applied migration");
        }
    } else if target < prev {
        let rollbacks: Vec<(i64, String)> = {
            let mut stmt =
                conn.prepare("SELECT id, down FROM migrations WHERE id > ?1 ORDER BY id DESC")?;
            let rows = stmt
                .query_map([target], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };
        for (id, down) in rollbacks {
            let tx = conn.transaction()?;
            tx.execute_batch(&down)?;
            tx.execute("DELETE FROM migrations WHERE id = ?1", [id])?;
            tx.commit()?;
            tracing::info!(id, "rolled back migration");
        }
    }

    Ok(MigrationReport { prev, curr: target })
}
