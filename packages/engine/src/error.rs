//! The engine's single public error type.
//!
//! Precondition failures are surfaced to the caller and never retried;
//! store errors propagate with the underlying SQLite error attached.
//! Duplicate patch delivery is not an error anywhere in the engine.

/// Errors returned by every fallible engine operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A write or heartbeat was attempted before `migrate()`.
    #[error("engine is not migrated; call migrate() before writing")]
    NotMigrated,
    /// The named table does not exist in the store.
    #[error("unknown table: {table}")]
    UnknownTable {
        /// The missing table name.
        table: String,
    },
    /// Replicated tables must declare a primary key.
    #[error("table {table} has no primary key")]
    NoPrimaryKey {
        /// The offending table name.
        table: String,
    },
    /// A delta omitted one of the table's primary-key columns.
    #[error("delta for table {table} is missing primary key column {column}")]
    MissingPrimaryKey {
        /// The target table.
        table: String,
        /// The absent primary-key column.
        column: String,
    },
    /// A delta named a column the table does not have.
    #[error("table {table} has no column {column}")]
    UnknownColumn {
        /// The target table.
        table: String,
        /// The unrecognized column name.
        column: String,
    },
    /// A delta carried no columns at all.
    #[error("delta for table {table} is empty")]
    EmptyDelta {
        /// The target table.
        table: String,
    },
    /// A remote patch was produced under a newer schema than ours.
    ///
    /// The patch is rejected before any write; the transport should
    /// redeliver once this node has migrated.
    #[error("patch schema version {remote} is ahead of local version {local}")]
    SchemaVersionAhead {
        /// Our applied schema version.
        local: i64,
        /// The version carried by the patch.
        remote: i64,
    },
    /// Any store-level failure other than duplicate patch delivery.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
}

/// Convenience alias used across the engine crate.
pub type Result<T> = std::result::Result<T, Error>;
