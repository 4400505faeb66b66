//! The replication engine.
//!
//! Every accepted write becomes an immutable row in a per-table patch
//! table; base tables are convergent derivations of those patch logs and
//! hold no authoritative information. A local upsert reserves an HLC
//! timestamp and a sequence number, appends the patch, and folds the patch
//! log forward into the base table. An inbound remote patch is absorbed
//! into the clock, appended idempotently, accounted against the sending
//! peer, and folded the same way. [`Engine::heartbeat`] performs retention
//! GC and turns sequence gaps into retransmission requests.
//!
//! # Conflict resolution
//!
//! The fold is one SQL statement per table: patches at or after a lower
//! bound are replayed in `(_patchedAt, _peerId)` order with
//! `coalesce(excluded.col, col)`, so the last non-null write in HLC order
//! wins per column and ties break deterministically on peer id.
//!
//! # Concurrency
//!
//! The engine is single-threaded and owns its store handle outright;
//! callers serialise through `&mut self`. There are no locks and no
//! suspension points other than store I/O.

use std::collections::{HashMap, HashSet};

use rusqlite::types::ValueRef;
use rusqlite::{params, params_from_iter, types, Connection};
use serde::Serialize;

use patchsync_core::{
    generate_peer_id, ClockSource, Delta, Hlc, HlcState, Message, MissingPatchRequest, Patch,
    Ping, SystemClock, Value, EPOCH_MS,
};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::migration::{self, Migration, MigrationReport};
use crate::peers::{PeerStats, PeerTable};
use crate::schema::{self, quote_ident, TableSchema, PATCH_TABLE_SUFFIX};
use crate::token::SessionToken;

/// Soft-delete marker column carried by every patch table.
const DELETED_AT: &str = "deletedAt";

/// Minimum interval between retention GC passes.
const GC_INTERVAL_MS: i64 = 3_600_000;

/// Point-in-time view of the engine, returned by [`Engine::status`].
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    /// This node's peer id.
    pub peer_id: i64,
    /// Applied schema version.
    pub schema_version: i64,
    /// Sequence number of the newest local patch, -1 before migration.
    pub last_sequence_id: i64,
    /// Timestamp of the newest local patch.
    pub last_patch_at: Hlc,
    /// Last observed clock drift in packed timestamp units.
    pub clock_drift: i64,
    /// Copy of every known remote peer's stats.
    pub peers: HashMap<i64, PeerStats>,
}

/// A conflict-free multi-writer replication engine over an embedded store.
///
/// One instance per node; it owns the store handle, the clock state, the
/// local sequence counter, and the per-peer bookkeeping. Transports feed
/// [`Engine::receive_patch`] / [`Engine::receive_ping`] and drain the
/// messages returned by [`Engine::heartbeat`] and [`Engine::patches_for`].
pub struct Engine {
    conn: Connection,
    peer_id: i64,
    config: EngineConfig,
    hlc: HlcState,
    /// Applied schema version; patches carry it so receivers can defer.
    db_version: i64,
    /// -1 until `migrate()` recovers it; writes are rejected meanwhile.
    last_sequence_id: i64,
    last_patch_at: Hlc,
    peers: PeerTable,
    schemas: HashMap<String, TableSchema>,
    ensured_patch_tables: HashSet<String>,
    last_gc_ms: i64,
    last_gap_scan_ms: i64,
}

impl Engine {
    /// Creates an engine on `conn` reading the real system clock.
    ///
    /// A `peer_id` of zero or less asks the engine to generate one; the
    /// generated id is stable for this instance's lifetime only, so
    /// operators restarting a node should persist and pass their own.
    #[must_use]
    pub fn new(conn: Connection, peer_id: i64, config: EngineConfig) -> Self {
        Self::with_clock(conn, peer_id, config, Box::new(SystemClock))
    }

    /// Creates an engine with an injected clock source.
    #[must_use]
    pub fn with_clock(
        conn: Connection,
        peer_id: i64,
        config: EngineConfig,
        clock: Box<dyn ClockSource>,
    ) -> Self {
        let peer_id = if peer_id <= 0 {
            generate_peer_id(&*clock)
        } else {
            peer_id
        };
        Self {
            conn,
            peer_id,
            config,
            hlc: HlcState::new(clock),
            db_version: 0,
            last_sequence_id: -1,
            last_patch_at: Hlc::ZERO,
            peers: PeerTable::default(),
            schemas: HashMap::new(),
            ensured_patch_tables: HashSet::new(),
            last_gc_ms: 0,
            last_gap_scan_ms: 0,
        }
    }

    /// Returns this node's peer id.
    #[must_use]
    pub fn peer_id(&self) -> i64 {
        self.peer_id
    }

    /// Returns the underlying store handle for reads.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Brings the store to the version implied by `migrations` and
    /// recovers the local sequence counter from the patch tables.
    ///
    /// Must be called before any write; until then every write is
    /// rejected with [`Error::NotMigrated`].
    pub fn migrate(&mut self, migrations: &[Migration]) -> Result<MigrationReport> {
        let report = migration::run(&mut self.conn, migrations)?;
        self.db_version = report.curr;
        self.schemas.clear();
        self.ensured_patch_tables.clear();
        self.init_peer_sequence()?;
        Ok(report)
    }

    /// Applies a local write and returns its session token.
    ///
    /// `delta` must contain every primary-key column of `table`. A null
    /// value on a non-key column means *leave unchanged*. Soft delete is a
    /// write to the `deletedAt` column; tombstoned rows stay in the base
    /// table so they dominate late-arriving resurrections, and readers
    /// filter them.
    pub fn upsert(&mut self, table: &str, delta: &Delta) -> Result<SessionToken> {
        if self.last_sequence_id < 0 {
            return Err(Error::NotMigrated);
        }
        let table_schema = self.table_schema(table)?;
        validate_delta(&table_schema, delta)?;
        let patch_table = self.ensure_patch_table(&table_schema)?;

        let at = self.hlc.create();
        let seq = self.last_sequence_id + 1;
        self.insert_patch(&patch_table, at, seq, self.peer_id, delta)?;
        self.last_sequence_id = seq;
        self.last_patch_at = at;
        self.merge_table(&table_schema, at)?;

        Ok(SessionToken {
            peer: self.peer_id,
            seq,
        })
    }

    /// Accepts a patch produced by a remote peer. Idempotent.
    ///
    /// Our own patches echoed back are discarded. A duplicate delivery is
    /// absorbed by the patch table's primary key and leaves every table
    /// untouched.
    pub fn receive_patch(&mut self, patch: &Patch) -> Result<()> {
        if patch.peer == self.peer_id {
            return Ok(());
        }
        if self.last_sequence_id < 0 {
            return Err(Error::NotMigrated);
        }
        if patch.schema_version > self.db_version {
            return Err(Error::SchemaVersionAhead {
                local: self.db_version,
                remote: patch.schema_version,
            });
        }

        self.hlc.receive(patch.at);
        let table_schema = self.table_schema(&patch.table)?;
        validate_delta(&table_schema, &patch.delta)?;
        let patch_table = self.ensure_patch_table(&table_schema)?;

        let inserted = self.insert_patch(
            &patch_table,
            patch.at,
            patch.seq,
            patch.peer,
            &patch.delta,
        )?;
        let now_ms = self.now_ms();
        self.peers
            .observe_patch(patch.peer, patch.seq, patch.at, now_ms, self.config.debug);

        // A duplicate delivery leaves nothing to fold.
        if inserted > 0 {
            self.merge_table(&table_schema, patch.at)?;
        }
        Ok(())
    }

    /// Accepts a liveness beacon, updating the sender's high-water marks.
    ///
    /// A ping advertising sequences beyond our contiguous frontier makes
    /// the next heartbeat request the missing range.
    pub fn receive_ping(&mut self, ping: &Ping) {
        if ping.peer == self.peer_id {
            return;
        }
        let now_ms = self.now_ms();
        self.peers
            .observe_ping(ping.peer, ping.last_seq, ping.last_at, now_ms);
    }

    /// Registers a remote peer with empty stats; our own id is ignored.
    pub fn add_remote_peer(&mut self, peer: i64) {
        if peer == self.peer_id {
            return;
        }
        self.peers.add(peer);
    }

    /// Returns an owned snapshot of the engine state.
    #[must_use]
    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            peer_id: self.peer_id,
            schema_version: self.db_version,
            last_sequence_id: self.last_sequence_id,
            last_patch_at: self.last_patch_at,
            clock_drift: self.hlc.drift(),
            peers: self.peers.snapshot(),
        }
    }

    /// Whether this node has contiguously seen `peer`'s patches through
    /// `seq`. Unknown peers answer `true`.
    #[must_use]
    pub fn is_consistent(&self, peer: i64, seq: i64) -> bool {
        self.peers.is_consistent(peer, seq)
    }

    /// Periodic maintenance; call at the configured cadence.
    ///
    /// Runs retention GC at most hourly, scans for sequence gaps at most
    /// once per heartbeat interval, and always emits a [`Ping`]. Returns
    /// the outbound messages for the transport to send.
    pub fn heartbeat(&mut self) -> Result<Vec<Message>> {
        if self.last_sequence_id < 0 {
            return Err(Error::NotMigrated);
        }
        let now_ms = self.now_ms();
        let mut outbound = Vec::new();

        if now_ms - self.last_gc_ms >= GC_INTERVAL_MS {
            self.last_gc_ms = now_ms;
            self.collect_garbage(now_ms)?;
        }

        if now_ms - self.last_gap_scan_ms >= self.config.heartbeat_interval_ms {
            self.last_gap_scan_ms = now_ms;
            for (peer, stats) in self.peers.gapped() {
                let min_seq = stats.guaranteed_contiguous_seq + 1;
                let max_seq = stats
                    .last_seq_id
                    .min(stats.guaranteed_contiguous_seq + self.config.max_patch_per_retransmission);
                if self.config.debug {
                    tracing::debug!(peer, min_seq, max_seq, "requesting missing patches");
                }
                outbound.push(Message::MissingPatchRequest(MissingPatchRequest {
                    peer,
                    min_seq,
                    max_seq,
                    for_peer: self.peer_id,
                }));
            }
        }

        outbound.push(Message::Ping(Ping {
            peer: self.peer_id,
            last_at: self.last_patch_at,
            last_seq: self.last_sequence_id,
        }));
        Ok(outbound)
    }

    /// Serves a retransmission request addressed to this node.
    ///
    /// Re-reads our own patches in the requested sequence range from every
    /// patch table and returns them as [`Patch`] messages, capped at the
    /// configured per-request maximum. Requests addressed to another peer
    /// yield nothing.
    pub fn patches_for(&self, request: &MissingPatchRequest) -> Result<Vec<Patch>> {
        if request.peer != self.peer_id {
            return Ok(Vec::new());
        }
        let cap = self.config.max_patch_per_retransmission;
        let max_seq = request.max_seq.min(request.min_seq + cap - 1);

        let mut patches = Vec::new();
        for patch_table in schema::list_patch_tables(&self.conn)? {
            let base = patch_table
                .strip_suffix(PATCH_TABLE_SUFFIX)
                .unwrap_or(&patch_table)
                .to_string();
            let sql = format!(
                "SELECT * FROM {} WHERE \"_peerId\" = ?1 \
                 AND \"_sequenceId\" BETWEEN ?2 AND ?3",
                quote_ident(&patch_table)
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let column_names: Vec<String> =
                stmt.column_names().iter().map(ToString::to_string).collect();
            let rows = stmt
                .query_map(params![self.peer_id, request.min_seq, max_seq], |row| {
                    let mut at = 0_i64;
                    let mut seq = 0_i64;
                    let mut delta = Delta::new();
                    for (index, name) in column_names.iter().enumerate() {
                        match name.as_str() {
                            "_patchedAt" => at = row.get(index)?,
                            "_sequenceId" => seq = row.get(index)?,
                            "_peerId" => {}
                            _ => {
                                let value = value_from_sql(row.get_ref(index)?);
                                if !value.is_null() {
                                    delta.insert(name.clone(), value);
                                }
                            }
                        }
                    }
                    Ok((at, seq, delta))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            for (at, seq, delta) in rows {
                patches.push(Patch {
                    at: Hlc::from_raw(at),
                    peer: self.peer_id,
                    seq,
                    schema_version: self.db_version,
                    table: base.clone(),
                    delta,
                });
            }
        }

        patches.sort_unstable_by_key(|patch| patch.seq);
        patches.truncate(usize::try_from(cap).unwrap_or(usize::MAX));
        Ok(patches)
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    fn now_ms(&self) -> i64 {
        self.hlc.clock_source().now_ms()
    }

    /// Introspects `table` once and caches the result until migration.
    fn table_schema(&mut self, table: &str) -> Result<TableSchema> {
        if let Some(table_schema) = self.schemas.get(table) {
            return Ok(table_schema.clone());
        }
        let table_schema = schema::introspect(&self.conn, table)?;
        self.schemas
            .insert(table.to_string(), table_schema.clone());
        Ok(table_schema)
    }

    /// Creates the companion patch table for a base table if needed.
    ///
    /// The patch table mirrors every base column as nullable, prefixed by
    /// the `(_patchedAt, _sequenceId, _peerId)` key and suffixed with
    /// `deletedAt` when the base table does not declare it.
    fn ensure_patch_table(&mut self, table_schema: &TableSchema) -> Result<String> {
        let patch_table = format!("{}{}", table_schema.name, PATCH_TABLE_SUFFIX);
        if self.ensured_patch_tables.contains(&patch_table) {
            return Ok(patch_table);
        }

        let mut columns = vec![
            "\"_patchedAt\" INTEGER NOT NULL".to_string(),
            "\"_sequenceId\" INTEGER NOT NULL".to_string(),
            "\"_peerId\" INTEGER NOT NULL".to_string(),
        ];
        for column in &table_schema.columns {
            let mut declaration = quote_ident(&column.name);
            if !column.decl_type.is_empty() {
                declaration.push(' ');
                declaration.push_str(&column.decl_type);
            }
            columns.push(declaration);
        }
        if !table_schema.has_column(DELETED_AT) {
            columns.push(format!("{} INTEGER", quote_ident(DELETED_AT)));
        }

        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} ({}, \
             PRIMARY KEY (\"_patchedAt\", \"_sequenceId\", \"_peerId\"))",
            quote_ident(&patch_table),
            columns.join(", ")
        );
        self.conn.execute(&sql, [])?;
        self.ensured_patch_tables.insert(patch_table.clone());
        Ok(patch_table)
    }

    /// Appends one patch row. Returns 0 when the row already existed.
    fn insert_patch(
        &self,
        patch_table: &str,
        at: Hlc,
        seq: i64,
        peer: i64,
        delta: &Delta,
    ) -> Result<usize> {
        let mut columns = vec![
            "\"_patchedAt\"".to_string(),
            "\"_sequenceId\"".to_string(),
            "\"_peerId\"".to_string(),
        ];
        let mut values: Vec<types::Value> = vec![
            types::Value::Integer(at.raw()),
            types::Value::Integer(seq),
            types::Value::Integer(peer),
        ];
        for (name, value) in delta {
            columns.push(quote_ident(name));
            values.push(sql_value(value));
        }
        let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();

        let sql = format!(
            "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
            quote_ident(patch_table),
            columns.join(", "),
            placeholders.join(", ")
        );
        Ok(self.conn.execute(&sql, params_from_iter(values))?)
    }

    /// Folds patches at or after `lower` into the base table.
    ///
    /// Replays rows in `(_patchedAt, _peerId)` order so the last non-null
    /// write per column wins; a full replay from `Hlc::ZERO` is always
    /// equivalent, the lower bound only skips already-settled history.
    fn merge_table(&self, table_schema: &TableSchema, lower: Hlc) -> Result<()> {
        let base = quote_ident(&table_schema.name);
        let patch_table = quote_ident(&format!("{}{}", table_schema.name, PATCH_TABLE_SUFFIX));
        let column_list: Vec<String> = table_schema
            .columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect();
        let column_list = column_list.join(", ");
        let key_list: Vec<String> = table_schema
            .primary_key
            .iter()
            .map(|name| quote_ident(name))
            .collect();
        let key_list = key_list.join(", ");

        let assignments: Vec<String> = table_schema
            .columns
            .iter()
            .filter(|c| !table_schema.is_primary_key(&c.name))
            .map(|c| {
                let column = quote_ident(&c.name);
                format!("{column} = coalesce(excluded.{column}, {base}.{column})")
            })
            .collect();

        let conflict_clause = if assignments.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", assignments.join(", "))
        };

        let sql = format!(
            "INSERT INTO {base} ({column_list}) \
             SELECT {column_list} FROM {patch_table} WHERE \"_patchedAt\" >= ?1 \
             ORDER BY \"_patchedAt\" ASC, \"_peerId\" ASC \
             ON CONFLICT ({key_list}) {conflict_clause}"
        );
        self.conn.execute(&sql, [lower.raw()])?;
        Ok(())
    }

    /// Recovers `last_sequence_id` / `last_patch_at` from the patch tables.
    fn init_peer_sequence(&mut self) -> Result<()> {
        let mut max_seq = 0_i64;
        let mut max_at = Hlc::ZERO;
        for patch_table in schema::list_patch_tables(&self.conn)? {
            let sql = format!(
                "SELECT MAX(\"_sequenceId\"), MAX(\"_patchedAt\") FROM {} \
                 WHERE \"_peerId\" = ?1",
                quote_ident(&patch_table)
            );
            let (seq, at): (Option<i64>, Option<i64>) =
                self.conn
                    .query_row(&sql, [self.peer_id], |row| Ok((row.get(0)?, row.get(1)?)))?;
            max_seq = max_seq.max(seq.unwrap_or(0));
            max_at = max_at.max(Hlc::from_raw(at.unwrap_or(0)));
        }
        self.last_sequence_id = max_seq;
        self.last_patch_at = max_at;
        // Never hand out a timestamp below our own persisted patches.
        self.hlc.receive(max_at);
        Ok(())
    }

    /// Deletes patches older than the retention window from every patch table.
    fn collect_garbage(&self, now_ms: i64) -> Result<()> {
        let oldest_ms = (now_ms - self.config.max_patch_retention_ms).max(EPOCH_MS);
        let oldest = Hlc::from_parts(oldest_ms, 0).unwrap_or(Hlc::ZERO);
        for patch_table in schema::list_patch_tables(&self.conn)? {
            let sql = format!(
                "DELETE FROM {} WHERE \"_patchedAt\" < ?1",
                quote_ident(&patch_table)
            );
            let deleted = self.conn.execute(&sql, [oldest.raw()])?;
            if deleted > 0 {
                tracing::debug!(table = %patch_table, deleted, "expired patches collected");
            }
        }
        Ok(())
    }
}

/// Rejects empty deltas, unknown columns, and missing or null key columns.
fn validate_delta(table_schema: &TableSchema, delta: &Delta) -> Result<()> {
    if delta.is_empty() {
        return Err(Error::EmptyDelta {
            table: table_schema.name.clone(),
        });
    }
    for column in delta.keys() {
        if column != DELETED_AT && !table_schema.has_column(column) {
            return Err(Error::UnknownColumn {
                table: table_schema.name.clone(),
                column: column.clone(),
            });
        }
    }
    for key_column in &table_schema.primary_key {
        match delta.get(key_column) {
            None | Some(Value::Null) => {
                return Err(Error::MissingPrimaryKey {
                    table: table_schema.name.clone(),
                    column: key_column.clone(),
                });
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Binds a delta value to the store's native storage classes.
fn sql_value(value: &Value) -> types::Value {
    match value {
        Value::Null => types::Value::Null,
        Value::Integer(i) => types::Value::Integer(*i),
        Value::Real(f) => types::Value::Real(*f),
        Value::Text(s) => types::Value::Text(s.clone()),
        Value::Blob(b) => types::Value::Blob(b.clone()),
    }
}

/// Reads a stored column back into a delta value.
fn value_from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}
