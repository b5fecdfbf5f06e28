//! Hot storage: the per-stream SQLite file backing `stream_meta`, `ops`,
//! `producers`, and `segments` (spec §4.2).
//!
//! One file lives at `{data_dir}/{project_id}/{stream_id}.db`. Because a
//! stream's sequencer is single-writer, `stream_meta` is a single-row
//! table rather than keyed by stream id. Mutating operations are built as
//! `(sql, params)` pairs and executed inside one `rusqlite` transaction
//! (`execute_batch`), matching the journal idiom used elsewhere in this
//! codebase for durable SQLite writers.

use rusqlite::{params, types::Value as SqlValue, Connection, OptionalExtension, Row};
use std::path::Path;

const ROW_CAP: i64 = 200;

#[derive(Debug)]
pub enum StorageError {
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::Sqlite(e) => write!(f, "sqlite error: {e}"),
            StorageError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}
impl std::error::Error for StorageError {}
impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Sqlite(e)
    }
}
impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e)
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// One statement in a transactional batch.
pub struct BatchStmt {
    pub sql: &'static str,
    pub params: Vec<SqlValue>,
}

/// A set of statements committed together, or not at all.
#[derive(Default)]
pub struct Batch(pub Vec<BatchStmt>);

impl Batch {
    pub fn new() -> Self {
        Batch(Vec::new())
    }

    pub fn push(&mut self, sql: &'static str, params: Vec<SqlValue>) {
        self.0.push(BatchStmt { sql, params });
    }

    pub fn push_stmt(&mut self, stmt: BatchStmt) {
        self.0.push(stmt);
    }
}

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StreamMeta {
    pub content_type: String,
    pub closed: bool,
    pub tail_offset: i64,
    pub read_seq: i64,
    pub segment_start: i64,
    pub segment_count: i64,
    pub segment_bytes: i64,
    pub last_stream_seq: Option<String>,
    pub ttl_secs: Option<i64>,
    pub expires_at: Option<i64>,
    pub created_at: i64,
    pub close_producer_id: Option<String>,
    pub close_epoch: Option<i64>,
    pub close_seq: Option<i64>,
    pub public: bool,
}

#[derive(Debug, Clone)]
pub struct Op {
    pub start_offset: i64,
    pub end_offset: i64,
    pub size_bytes: i64,
    pub body: Vec<u8>,
    pub created_at: i64,
    pub stream_seq: Option<String>,
    pub producer_id: Option<String>,
    pub producer_epoch: Option<i64>,
    pub producer_seq: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ProducerState {
    pub producer_id: String,
    pub epoch: i64,
    pub last_seq: i64,
    pub last_offset: i64,
    pub last_updated: i64,
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub read_seq: i64,
    pub key: String,
    pub start_offset: i64,
    pub end_offset: i64,
    pub content_type: String,
    pub size_bytes: i64,
    pub message_count: i64,
    pub expires_at: Option<i64>,
}

// ---------------------------------------------------------------------------
// Open + schema
// ---------------------------------------------------------------------------

pub fn open(path: &Path) -> StorageResult<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA foreign_keys=ON;",
    )?;
    apply_schema(&conn)?;
    migrate_public_flag(&conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> StorageResult<Connection> {
    let conn = Connection::open_in_memory()?;
    apply_schema(&conn)?;
    migrate_public_flag(&conn)?;
    Ok(conn)
}

fn apply_schema(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS stream_meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            content_type TEXT NOT NULL,
            closed INTEGER NOT NULL DEFAULT 0,
            tail_offset INTEGER NOT NULL DEFAULT 0,
            read_seq INTEGER NOT NULL DEFAULT 0,
            segment_start INTEGER NOT NULL DEFAULT 0,
            segment_count INTEGER NOT NULL DEFAULT 0,
            segment_bytes INTEGER NOT NULL DEFAULT 0,
            last_stream_seq TEXT,
            ttl_secs INTEGER,
            expires_at INTEGER,
            created_at INTEGER NOT NULL,
            close_producer_id TEXT,
            close_epoch INTEGER,
            close_seq INTEGER
         );
         CREATE TABLE IF NOT EXISTS ops (
            start_offset INTEGER PRIMARY KEY,
            end_offset INTEGER NOT NULL,
            size_bytes INTEGER NOT NULL,
            body BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            stream_seq TEXT,
            producer_id TEXT,
            producer_epoch INTEGER,
            producer_seq INTEGER
         );
         CREATE TABLE IF NOT EXISTS producers (
            producer_id TEXT PRIMARY KEY,
            epoch INTEGER NOT NULL,
            last_seq INTEGER NOT NULL,
            last_offset INTEGER NOT NULL,
            last_updated INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS segments (
            read_seq INTEGER PRIMARY KEY,
            key TEXT NOT NULL,
            start_offset INTEGER NOT NULL,
            end_offset INTEGER NOT NULL,
            content_type TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            message_count INTEGER NOT NULL,
            expires_at INTEGER
         );",
    )?;
    Ok(())
}

/// Idempotent post-deploy migration: older databases were created before
/// the public flag existed on `stream_meta`.
fn migrate_public_flag(conn: &Connection) -> StorageResult<()> {
    let has_column: bool = conn
        .prepare("SELECT 1 FROM pragma_table_info('stream_meta') WHERE name = 'public_flag'")?
        .exists([])?;
    if !has_column {
        conn.execute_batch("ALTER TABLE stream_meta ADD COLUMN public_flag INTEGER NOT NULL DEFAULT 0;")?;
    }
    Ok(())
}

pub fn execute_batch(conn: &mut Connection, batch: Batch) -> StorageResult<()> {
    let tx = conn.transaction()?;
    for stmt in batch.0 {
        tx.execute(stmt.sql, rusqlite::params_from_iter(stmt.params.iter()))?;
    }
    tx.commit()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// stream_meta
// ---------------------------------------------------------------------------

fn map_meta(row: &Row<'_>) -> rusqlite::Result<StreamMeta> {
    Ok(StreamMeta {
        content_type: row.get("content_type")?,
        closed: row.get::<_, i64>("closed")? != 0,
        tail_offset: row.get("tail_offset")?,
        read_seq: row.get("read_seq")?,
        segment_start: row.get("segment_start")?,
        segment_count: row.get("segment_count")?,
        segment_bytes: row.get("segment_bytes")?,
        last_stream_seq: row.get("last_stream_seq")?,
        ttl_secs: row.get("ttl_secs")?,
        expires_at: row.get("expires_at")?,
        created_at: row.get("created_at")?,
        close_producer_id: row.get("close_producer_id")?,
        close_epoch: row.get("close_epoch")?,
        close_seq: row.get("close_seq")?,
        public: row.get::<_, i64>("public_flag")? != 0,
    })
}

pub fn get_meta(conn: &Connection) -> StorageResult<Option<StreamMeta>> {
    Ok(conn
        .query_row("SELECT * FROM stream_meta WHERE id = 1", [], map_meta)
        .optional()?)
}

pub fn insert_stream_stmt(
    content_type: &str,
    ttl_secs: Option<i64>,
    expires_at: Option<i64>,
    created_at: i64,
    public: bool,
) -> BatchStmt {
    BatchStmt {
        sql: "INSERT INTO stream_meta
                (id, content_type, closed, tail_offset, read_seq, segment_start,
                 segment_count, segment_bytes, last_stream_seq, ttl_secs, expires_at,
                 created_at, public_flag)
              VALUES (1, ?1, 0, 0, 0, 0, 0, 0, NULL, ?2, ?3, ?4, ?5)",
        params: vec![
            content_type.into(),
            ttl_secs.into(),
            expires_at.into(),
            created_at.into(),
            (public as i64).into(),
        ],
    }
}

#[allow(clippy::too_many_arguments)]
pub fn update_after_append_stmt(
    tail_offset: i64,
    segment_count: i64,
    segment_bytes: i64,
    last_stream_seq: Option<&str>,
    closed: bool,
    close_producer_id: Option<&str>,
    close_epoch: Option<i64>,
    close_seq: Option<i64>,
) -> BatchStmt {
    BatchStmt {
        sql: "UPDATE stream_meta SET
                tail_offset = ?1,
                segment_count = ?2,
                segment_bytes = ?3,
                last_stream_seq = COALESCE(?4, last_stream_seq),
                closed = ?5,
                close_producer_id = ?6,
                close_epoch = ?7,
                close_seq = ?8
              WHERE id = 1",
        params: vec![
            tail_offset.into(),
            segment_count.into(),
            segment_bytes.into(),
            last_stream_seq.map(str::to_owned).into(),
            (closed as i64).into(),
            close_producer_id.map(str::to_owned).into(),
            close_epoch.into(),
            close_seq.into(),
        ],
    }
}

pub fn rotate_meta_stmt(new_read_seq: i64, new_segment_start: i64) -> BatchStmt {
    BatchStmt {
        sql: "UPDATE stream_meta SET read_seq = ?1, segment_start = ?2, segment_count = 0, segment_bytes = 0 WHERE id = 1",
        params: vec![new_read_seq.into(), new_segment_start.into()],
    }
}

// ---------------------------------------------------------------------------
// ops
// ---------------------------------------------------------------------------

fn map_op(row: &Row<'_>) -> rusqlite::Result<Op> {
    Ok(Op {
        start_offset: row.get("start_offset")?,
        end_offset: row.get("end_offset")?,
        size_bytes: row.get("size_bytes")?,
        body: row.get("body")?,
        created_at: row.get("created_at")?,
        stream_seq: row.get("stream_seq")?,
        producer_id: row.get("producer_id")?,
        producer_epoch: row.get("producer_epoch")?,
        producer_seq: row.get("producer_seq")?,
    })
}

#[allow(clippy::too_many_arguments)]
pub fn insert_op_stmt(
    start_offset: i64,
    end_offset: i64,
    size_bytes: i64,
    body: Vec<u8>,
    created_at: i64,
    stream_seq: Option<&str>,
    producer_id: Option<&str>,
    producer_epoch: Option<i64>,
    producer_seq: Option<i64>,
) -> BatchStmt {
    BatchStmt {
        sql: "INSERT INTO ops
                (start_offset, end_offset, size_bytes, body, created_at,
                 stream_seq, producer_id, producer_epoch, producer_seq)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params: vec![
            start_offset.into(),
            end_offset.into(),
            size_bytes.into(),
            body.into(),
            created_at.into(),
            stream_seq.map(str::to_owned).into(),
            producer_id.map(str::to_owned).into(),
            producer_epoch.into(),
            producer_seq.into(),
        ],
    }
}

/// The op most recently committed when `offset` is the stream's current
/// tail: the one whose `end_offset` lands exactly on it.
pub fn select_op_ending_at(conn: &Connection, offset: i64) -> StorageResult<Option<Op>> {
    Ok(conn
        .query_row("SELECT * FROM ops WHERE end_offset = ?1", params![offset], map_op)
        .optional()?)
}

/// An op whose range strictly contains `offset` (`start < offset < end`).
pub fn select_overlap(conn: &Connection, offset: i64) -> StorageResult<Option<Op>> {
    Ok(conn
        .query_row(
            "SELECT * FROM ops WHERE start_offset < ?1 AND end_offset > ?1 LIMIT 1",
            params![offset],
            map_op,
        )
        .optional()?)
}

/// Ops starting at or after `offset`, oldest first, capped at the row cap.
pub fn select_ops_from(conn: &Connection, offset: i64) -> StorageResult<Vec<Op>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM ops WHERE start_offset >= ?1 ORDER BY start_offset ASC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![offset, ROW_CAP], map_op)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn select_all_ops(conn: &Connection) -> StorageResult<Vec<Op>> {
    let mut stmt = conn.prepare("SELECT * FROM ops ORDER BY start_offset ASC")?;
    let rows = stmt.query_map([], map_op)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn aggregate_from(conn: &Connection, offset: i64) -> StorageResult<(i64, i64)> {
    conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM ops WHERE start_offset >= ?1",
        params![offset],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .map_err(StorageError::from)
}

pub fn delete_ops_in_range(from: i64, to: i64) -> BatchStmt {
    BatchStmt {
        sql: "DELETE FROM ops WHERE start_offset >= ?1 AND start_offset < ?2",
        params: vec![from.into(), to.into()],
    }
}

pub fn ops_count(conn: &Connection) -> StorageResult<i64> {
    Ok(conn.query_row("SELECT COUNT(*) FROM ops", [], |r| r.get(0))?)
}

/// Bytes already committed to cold segments, for the quota check (spec
/// §5): total stream footprint is this plus `stream_meta.segment_bytes`.
pub fn total_segment_bytes(conn: &Connection) -> StorageResult<i64> {
    Ok(conn.query_row("SELECT COALESCE(SUM(size_bytes), 0) FROM segments", [], |r| r.get(0))?)
}

// ---------------------------------------------------------------------------
// producers
// ---------------------------------------------------------------------------

fn map_producer(row: &Row<'_>) -> rusqlite::Result<ProducerState> {
    Ok(ProducerState {
        producer_id: row.get("producer_id")?,
        epoch: row.get("epoch")?,
        last_seq: row.get("last_seq")?,
        last_offset: row.get("last_offset")?,
        last_updated: row.get("last_updated")?,
    })
}

pub fn get_producer(conn: &Connection, producer_id: &str) -> StorageResult<Option<ProducerState>> {
    Ok(conn
        .query_row(
            "SELECT * FROM producers WHERE producer_id = ?1",
            params![producer_id],
            map_producer,
        )
        .optional()?)
}

pub fn upsert_producer_stmt(
    producer_id: &str,
    epoch: i64,
    last_seq: i64,
    last_offset: i64,
    last_updated: i64,
) -> BatchStmt {
    BatchStmt {
        sql: "INSERT INTO producers (producer_id, epoch, last_seq, last_offset, last_updated)
              VALUES (?1, ?2, ?3, ?4, ?5)
              ON CONFLICT(producer_id) DO UPDATE SET
                epoch = excluded.epoch,
                last_seq = excluded.last_seq,
                last_offset = excluded.last_offset,
                last_updated = excluded.last_updated",
        params: vec![
            producer_id.to_owned().into(),
            epoch.into(),
            last_seq.into(),
            last_offset.into(),
            last_updated.into(),
        ],
    }
}

pub fn delete_producer(conn: &Connection, producer_id: &str) -> StorageResult<()> {
    conn.execute("DELETE FROM producers WHERE producer_id = ?1", params![producer_id])?;
    Ok(())
}

// ---------------------------------------------------------------------------
// segments
// ---------------------------------------------------------------------------

fn map_segment(row: &Row<'_>) -> rusqlite::Result<Segment> {
    Ok(Segment {
        read_seq: row.get("read_seq")?,
        key: row.get("key")?,
        start_offset: row.get("start_offset")?,
        end_offset: row.get("end_offset")?,
        content_type: row.get("content_type")?,
        size_bytes: row.get("size_bytes")?,
        message_count: row.get("message_count")?,
        expires_at: row.get("expires_at")?,
    })
}

#[allow(clippy::too_many_arguments)]
pub fn insert_segment_stmt(
    read_seq: i64,
    key: &str,
    start_offset: i64,
    end_offset: i64,
    content_type: &str,
    size_bytes: i64,
    message_count: i64,
    expires_at: Option<i64>,
) -> BatchStmt {
    BatchStmt {
        sql: "INSERT INTO segments
                (read_seq, key, start_offset, end_offset, content_type, size_bytes, message_count, expires_at)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params: vec![
            read_seq.into(),
            key.to_owned().into(),
            start_offset.into(),
            end_offset.into(),
            content_type.to_owned().into(),
            size_bytes.into(),
            message_count.into(),
            expires_at.into(),
        ],
    }
}

pub fn get_segment(conn: &Connection, read_seq: i64) -> StorageResult<Option<Segment>> {
    Ok(conn
        .query_row("SELECT * FROM segments WHERE read_seq = ?1", params![read_seq], map_segment)
        .optional()?)
}

pub fn latest_segment(conn: &Connection) -> StorageResult<Option<Segment>> {
    Ok(conn
        .query_row(
            "SELECT * FROM segments ORDER BY read_seq DESC LIMIT 1",
            [],
            map_segment,
        )
        .optional()?)
}

pub fn list_segments(conn: &Connection) -> StorageResult<Vec<Segment>> {
    let mut stmt = conn.prepare("SELECT * FROM segments ORDER BY read_seq ASC")?;
    let rows = stmt.query_map([], map_segment)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

pub fn truncate_latest_segment(conn: &mut Connection) -> StorageResult<()> {
    if let Some(latest) = latest_segment(conn)? {
        conn.execute("DELETE FROM segments WHERE read_seq = ?1", params![latest.read_seq])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_database_has_no_stream_meta() {
        let conn = open_in_memory().unwrap();
        assert!(get_meta(&conn).unwrap().is_none());
    }

    #[test]
    fn insert_stream_stmt_round_trips_through_get_meta() {
        let mut conn = open_in_memory().unwrap();
        let mut batch = Batch::new();
        batch.push_stmt(insert_stream_stmt("text/plain", Some(60), None, 1_000, true));
        execute_batch(&mut conn, batch).unwrap();

        let meta = get_meta(&conn).unwrap().expect("stream should exist");
        assert_eq!(meta.content_type, "text/plain");
        assert_eq!(meta.ttl_secs, Some(60));
        assert!(meta.public);
        assert!(!meta.closed);
        assert_eq!(meta.tail_offset, 0);
    }

    #[test]
    fn update_after_append_stmt_advances_tail_and_preserves_stream_seq_when_none_given() {
        let mut conn = open_in_memory().unwrap();
        let mut batch = Batch::new();
        batch.push_stmt(insert_stream_stmt("text/plain", None, None, 0, false));
        batch.push_stmt(update_after_append_stmt(5, 1, 5, Some("s1"), false, None, None, None));
        execute_batch(&mut conn, batch).unwrap();

        let mut batch2 = Batch::new();
        batch2.push_stmt(update_after_append_stmt(10, 2, 10, None, false, None, None, None));
        execute_batch(&mut conn, batch2).unwrap();

        let meta = get_meta(&conn).unwrap().unwrap();
        assert_eq!(meta.tail_offset, 10);
        assert_eq!(meta.last_stream_seq.as_deref(), Some("s1"));
    }

    #[test]
    fn select_ops_from_returns_ops_at_or_after_the_given_offset_in_order() {
        let mut conn = open_in_memory().unwrap();
        let mut batch = Batch::new();
        batch.push_stmt(insert_stream_stmt("text/plain", None, None, 0, false));
        batch.push_stmt(insert_op_stmt(0, 3, 3, b"abc".to_vec(), 0, None, None, None, None));
        batch.push_stmt(insert_op_stmt(3, 6, 3, b"def".to_vec(), 0, None, None, None, None));
        execute_batch(&mut conn, batch).unwrap();

        let ops = select_ops_from(&conn, 3).unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].body, b"def");

        let overlap = select_overlap(&conn, 4).unwrap().expect("offset 4 is inside the second op");
        assert_eq!(overlap.start_offset, 3);

        let ending_at_tail = select_op_ending_at(&conn, 6).unwrap().expect("op ending at the tail");
        assert_eq!(ending_at_tail.body, b"def");
        assert!(select_op_ending_at(&conn, 4).unwrap().is_none());
    }

    #[test]
    fn producer_upsert_then_delete_round_trips() {
        let mut conn = open_in_memory().unwrap();
        let mut batch = Batch::new();
        batch.push_stmt(upsert_producer_stmt("p1", 1, 0, 0, 1_000));
        execute_batch(&mut conn, batch).unwrap();
        let state = get_producer(&conn, "p1").unwrap().expect("producer should exist");
        assert_eq!(state.epoch, 1);

        let mut batch2 = Batch::new();
        batch2.push_stmt(upsert_producer_stmt("p1", 2, 1, 5, 2_000));
        execute_batch(&mut conn, batch2).unwrap();
        let updated = get_producer(&conn, "p1").unwrap().unwrap();
        assert_eq!(updated.epoch, 2);
        assert_eq!(updated.last_offset, 5);

        delete_producer(&conn, "p1").unwrap();
        assert!(get_producer(&conn, "p1").unwrap().is_none());
    }

    #[test]
    fn segment_insert_list_and_truncate_round_trip() {
        let mut conn = open_in_memory().unwrap();
        let mut batch = Batch::new();
        batch.push_stmt(insert_segment_stmt(0, "seg-0", 0, 3, "text/plain", 3, 1, None));
        batch.push_stmt(insert_segment_stmt(1, "seg-1", 3, 6, "text/plain", 3, 1, None));
        execute_batch(&mut conn, batch).unwrap();

        assert_eq!(list_segments(&conn).unwrap().len(), 2);
        assert_eq!(latest_segment(&conn).unwrap().unwrap().read_seq, 1);
        assert_eq!(get_segment(&conn, 0).unwrap().unwrap().key, "seg-0");
        assert_eq!(total_segment_bytes(&conn).unwrap(), 6);

        truncate_latest_segment(&mut conn).unwrap();
        assert_eq!(list_segments(&conn).unwrap().len(), 1);
        assert_eq!(latest_segment(&conn).unwrap().unwrap().read_seq, 0);
    }

    #[test]
    fn migrate_public_flag_is_idempotent_across_repeated_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.db");
        {
            let _conn = open(&path).unwrap();
        }
        // Reopening an already-migrated database must not error on the
        // idempotent `ALTER TABLE` guard.
        let conn = open(&path).unwrap();
        assert!(get_meta(&conn).unwrap().is_none());
    }
}
