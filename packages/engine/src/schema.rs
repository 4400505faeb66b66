//! Schema introspection over the embedded store.
//!
//! Table names are vetted against `sqlite_master` before they are ever
//! interpolated into SQL, and identifiers are always double-quoted. User
//! values never appear in SQL text; they are bound as parameters.

use rusqlite::Connection;

use crate::error::{Error, Result};

/// Suffix distinguishing patch tables from base tables.
pub const PATCH_TABLE_SUFFIX: &str = "_patches";

/// One column of an introspected table.
#[derive(Debug, Clone)]
pub struct Column {
    /// Column name as declared.
    pub name: String,
    /// Declared type, empty for typeless columns.
    pub decl_type: String,
    /// 1-based position within the primary key, 0 if not part of it.
    pub pk_position: i64,
}

/// Ordered column list and primary-key subset of a base table.
#[derive(Debug, Clone)]
pub struct TableSchema {
    /// Table name as stored in `sqlite_master`.
    pub name: String,
    /// All columns in declaration order.
    pub columns: Vec<Column>,
    /// Primary-key column names in key order.
    pub primary_key: Vec<String>,
}

impl TableSchema {
    /// Returns `true` if the table declares the named column.
    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// Returns `true` if the named column is part of the primary key.
    #[must_use]
    pub fn is_primary_key(&self, name: &str) -> bool {
        self.primary_key.iter().any(|c| c == name)
    }
}

/// Double-quotes an identifier, doubling embedded quotes.
#[must_use]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Returns `true` if a table with this exact name exists.
pub fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Reads the column list and primary key of `table`.
///
/// # Errors
///
/// `UnknownTable` if the table is absent, `NoPrimaryKey` if it declares no
/// primary key; replicating a keyless table is a configuration error.
pub fn introspect(conn: &Connection, table: &str) -> Result<TableSchema> {
    if !table_exists(conn, table)? {
        return Err(Error::UnknownTable {
            table: table.to_string(),
        });
    }

    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let columns = stmt
        .query_map([], |row| {
            Ok(Column {
                name: row.get(1)?,
                decl_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                pk_position: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut keyed: Vec<(i64, String)> = columns
        .iter()
        .filter(|c| c.pk_position > 0)
        .map(|c| (c.pk_position, c.name.clone()))
        .collect();
    keyed.sort_unstable_by_key(|(position, _)| *position);
    let primary_key: Vec<String> = keyed.into_iter().map(|(_, name)| name).collect();

    if primary_key.is_empty() {
        return Err(Error::NoPrimaryKey {
            table: table.to_string(),
        });
    }

    Ok(TableSchema {
        name: table.to_string(),
        columns,
        primary_key,
    })
}

/// Lists every patch table in the store.
pub fn list_patch_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name GLOB '*_patches' \
         ORDER BY name",
    )?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(names)
}
