//! Sequencer host (spec §4.6): the single-writer critical section for one
//! stream, realized as an actor task that drains an mpsc command queue so
//! every mutation and every read that depends on mutation-visible state
//! runs non-overlapping (spec §5's "block-concurrency" primitive).
//!
//! The synchronous `rusqlite::Connection` lives inside the actor and is
//! only ever touched from `tokio::task::block_in_place` sections, so a
//! slow disk stalls this stream's worker thread and nothing else — the
//! practical equivalent of the teacher's per-batch `spawn_blocking`
//! pattern without the ownership churn of moving the connection across
//! tasks on every single statement.

use crate::blob::BlobStore;
use crate::config::Config;
use crate::engine::{self, AppendOutcome, CreateOutcome, ReadOutcome};
use crate::error::{AppError, AppResult};
use crate::fanout::{Fanout, FanoutConfig, PushFrame, WaiterOutcome};
use crate::hot_storage::{self, Op, Segment, StreamMeta};
use crate::metrics::MetricsSink;
use crate::offset::{Offset, ParsedOffset};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rusqlite::Connection;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamKey {
    pub project_id: String,
    pub stream_id: String,
}

impl StreamKey {
    pub fn db_path(&self, data_dir: &std::path::Path) -> PathBuf {
        data_dir.join(&self.project_id).join(format!("{}.db", self.stream_id))
    }
}

/// Handed to the fan-out pre-cache step by `sequencer.rs`; implemented by
/// `edge::cache::ResponseCache` in the full deployment. Kept here (rather
/// than imported from `edge`) so this module has no dependency on the
/// edge tier's internals.
#[async_trait::async_trait]
pub trait PreCacheSink: Send + Sync {
    async fn store(&self, url: &str, body: Vec<u8>, content_type: String, headers: Vec<(String, String)>);
}

pub struct NullPreCache;

#[async_trait::async_trait]
impl PreCacheSink for NullPreCache {
    async fn store(&self, _url: &str, _body: Vec<u8>, _content_type: String, _headers: Vec<(String, String)>) {}
}

pub enum Live {
    None,
    LongPoll { request_url: String },
    Sse,
}

pub struct ReadRequest {
    pub offset: ParsedOffset,
    pub max_chunk_bytes: usize,
    pub live: Live,
}

pub enum ReadReply {
    Immediate(ReadOutcome),
    /// Registered as a long-poll waiter; await `rx`, then re-issue a plain
    /// `Live::None` read from `resume_offset` (the tail captured at
    /// registration time, *not* the client's original `offset` — re-using
    /// `now`/`Now` on retry would re-resolve to the post-wake tail and
    /// return nothing) once it resolves, or let the caller's own timeout
    /// resolve it to a 204.
    LongPollPending { rx: oneshot::Receiver<WaiterOutcome>, resume_offset: ParsedOffset },
    /// An SSE subscription: frames already caught up through the tail are
    /// queued in `rx`; the edge `sse_bridge` drains it for the lifetime of
    /// the connection.
    PushOpened { channel_id: u64, rx: mpsc::Receiver<PushFrame> },
}

pub struct HeadReply {
    pub meta: StreamMeta,
}

enum Command {
    Create { req: engine::CreateRequest, reply: oneshot::Sender<AppResult<CreateOutcome>> },
    Append { req: engine::AppendRequest, reply: oneshot::Sender<AppResult<AppendOutcome>> },
    Read { req: ReadRequest, reply: oneshot::Sender<AppResult<ReadReply>> },
    Head { reply: oneshot::Sender<AppResult<HeadReply>> },
    Delete { reply: oneshot::Sender<AppResult<()>> },
    ClosePush { channel_id: u64 },
    #[cfg(feature = "debug-actions")]
    Debug { action: DebugAction, reply: oneshot::Sender<AppResult<DebugReply>> },
}

#[cfg(feature = "debug-actions")]
pub enum DebugAction {
    ForceRotate,
    OpsCount,
    TruncateLatestSegment,
    CoalesceStats,
}

#[cfg(feature = "debug-actions")]
pub enum DebugReply {
    OpsCount(i64),
    Rotated(bool),
    Truncated,
}

#[derive(Clone)]
pub struct SequencerHandle {
    tx: mpsc::Sender<Command>,
}

impl SequencerHandle {
    pub fn spawn(
        key: StreamKey,
        data_dir: PathBuf,
        config: Config,
        blob: Arc<dyn BlobStore>,
        cache: Arc<dyn PreCacheSink>,
        metrics: Arc<dyn MetricsSink>,
    ) -> AppResult<Self> {
        let conn = hot_storage::open(&key.db_path(&data_dir))?;
        let (tx, rx) = mpsc::channel(256);
        let actor = Actor {
            key,
            conn,
            fanout: Fanout::new(FanoutConfig {
                stagger: config.long_poll_stagger,
                timeout: config.long_poll_timeout,
                channel_capacity: 64,
            }),
            config,
            blob,
            cache,
            metrics,
            rotating: false,
        };
        tokio::spawn(actor.run(rx));
        Ok(SequencerHandle { tx })
    }

    pub async fn create(&self, req: engine::CreateRequest) -> AppResult<CreateOutcome> {
        self.call(|reply| Command::Create { req, reply }).await
    }

    pub async fn append(&self, req: engine::AppendRequest) -> AppResult<AppendOutcome> {
        self.call(|reply| Command::Append { req, reply }).await
    }

    pub async fn read(&self, req: ReadRequest) -> AppResult<ReadReply> {
        self.call(|reply| Command::Read { req, reply }).await
    }

    pub async fn head(&self) -> AppResult<HeadReply> {
        self.call(|reply| Command::Head { reply }).await
    }

    pub async fn delete(&self) -> AppResult<()> {
        self.call(|reply| Command::Delete { reply }).await
    }

    pub async fn close_push(&self, channel_id: u64) {
        let _ = self.tx.send(Command::ClosePush { channel_id }).await;
    }

    #[cfg(feature = "debug-actions")]
    pub async fn debug(&self, action: DebugAction) -> AppResult<DebugReply> {
        self.call(|reply| Command::Debug { action, reply }).await
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<AppResult<T>>) -> Command) -> AppResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| AppError::internal("sequencer actor is gone"))?;
        reply_rx.await.map_err(|_| AppError::internal("sequencer actor dropped the reply"))?
    }
}

struct Actor {
    key: StreamKey,
    conn: Connection,
    fanout: Fanout,
    config: Config,
    blob: Arc<dyn BlobStore>,
    cache: Arc<dyn PreCacheSink>,
    metrics: Arc<dyn MetricsSink>,
    rotating: bool,
}

impl Actor {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Create { req, reply } => {
                    let result = self.handle_create(req).await;
                    let _ = reply.send(result);
                }
                Command::Append { req, reply } => {
                    let result = self.handle_append(req).await;
                    let _ = reply.send(result);
                }
                Command::Read { req, reply } => {
                    let result = self.handle_read(req).await;
                    let _ = reply.send(result);
                }
                Command::Head { reply } => {
                    let result = self.with_conn(|conn| {
                        hot_storage::get_meta(conn)?
                            .map(|meta| HeadReply { meta })
                            .ok_or_else(|| AppError::not_found("stream not found"))
                    });
                    let _ = reply.send(result);
                }
                Command::Delete { reply } => {
                    let exists = self.with_conn(|conn| engine::validate_exists(conn));
                    if let Err(e) = exists {
                        let _ = reply.send(Err(e));
                        continue;
                    }
                    let path = self.key.db_path(&self.config.data_dir);
                    let _ = std::fs::remove_file(&path);
                    let _ = std::fs::remove_file(format!("{}-wal", path.display()));
                    let _ = std::fs::remove_file(format!("{}-shm", path.display()));
                    let _ = reply.send(Ok(()));
                    return;
                }
                Command::ClosePush { channel_id } => {
                    self.fanout.close_channel(channel_id);
                }
                #[cfg(feature = "debug-actions")]
                Command::Debug { action, reply } => {
                    let result = self.handle_debug(action).await;
                    let _ = reply.send(result);
                }
            }
        }
    }

    fn with_conn<T>(&mut self, f: impl FnOnce(&mut Connection) -> AppResult<T>) -> AppResult<T> {
        tokio::task::block_in_place(|| f(&mut self.conn))
    }

    async fn handle_create(&mut self, req: engine::CreateRequest) -> AppResult<CreateOutcome> {
        let outcome = self.with_conn(|conn| engine::create(conn, req))?;
        self.after_mutation(outcome.next_offset, outcome.closed).await;
        Ok(outcome)
    }

    async fn handle_append(&mut self, req: engine::AppendRequest) -> AppResult<AppendOutcome> {
        let outcome = self.with_conn(|conn| engine::append(conn, req))?;
        if !outcome.duplicate {
            self.after_mutation(outcome.next_offset, outcome.closed).await;
        }
        Ok(outcome)
    }

    /// Runs after any successful mutation that may have advanced the tail:
    /// pre-cache + wake long-poll waiters, broadcast to push channels,
    /// then rotate opportunistically (forcibly when the stream just
    /// closed).
    async fn after_mutation(&mut self, next_offset: Offset, closed: bool) {
        let meta = match self.with_conn(|conn| hot_storage::get_meta(conn).map_err(AppError::from)) {
            Ok(Some(meta)) => meta,
            _ => return,
        };
        let new_tail = meta.tail_offset;

        let pending: Vec<(String, i64)> =
            self.fanout.waiters_pending_wake(new_tail).map(|w| (w.url.clone(), w.notify_offset)).collect();
        for (url, notify_offset) in pending {
            if let Ok(outcome) =
                self.with_conn(|conn| engine::read(conn, &meta, ParsedOffset::Explicit(absolute_offset(&meta, notify_offset)), usize::MAX))
            {
                if let engine::ReadPlan::Done(read) = outcome {
                    let headers = vec![
                        ("Stream-Next-Offset".to_owned(), read.next_offset.encode()),
                        ("Stream-Up-To-Date".to_owned(), read.up_to_date.to_string()),
                    ];
                    self.cache.store(&url, read.body, meta.content_type.clone(), headers).await;
                }
            }
        }

        let absolute_end = meta.segment_start + next_offset.byte_offset as i64;
        let op = self
            .with_conn(|conn| hot_storage::select_op_ending_at(conn, absolute_end).map_err(AppError::from))
            .ok()
            .flatten();
        let frames = build_push_frames(&meta, next_offset, closed, op);
        self.fanout.wake_and_broadcast(new_tail, frames);

        self.metrics.record("stream.tail_offset", new_tail as f64, &[("stream_id", self.key.stream_id.as_str())]);

        let force = closed;
        let should = engine::should_rotate(&meta, self.config.segment_max_messages as i64, self.config.segment_max_bytes as i64, force);
        if should && !self.rotating {
            self.rotate().await;
        }
    }

    async fn rotate(&mut self) {
        self.rotating = true;
        let plan = self.with_conn(|conn| {
            let meta = hot_storage::get_meta(conn)?.ok_or_else(|| AppError::not_found("stream not found"))?;
            engine::plan_rotation(conn, &meta)
        });
        if let Ok(Some(plan)) = plan {
            let key = crate::blob::segment_key(&format!("{}/{}", self.key.project_id, self.key.stream_id), plan.new_read_seq - 1);
            if self.blob.put(&key, plan.blob.clone()).await.is_ok() {
                let _ = self.with_conn(|conn| engine::apply_rotation(conn, &plan, &key, false));
            }
        }
        self.rotating = false;
    }

    async fn handle_read(&mut self, req: ReadRequest) -> AppResult<ReadReply> {
        let meta = self
            .with_conn(|conn| hot_storage::get_meta(conn).map_err(AppError::from))?
            .ok_or_else(|| AppError::not_found("stream not found"))?;
        let plan = self.with_conn(|conn| engine::read(conn, &meta, req.offset, req.max_chunk_bytes))?;

        let outcome = match plan {
            engine::ReadPlan::Done(outcome) => outcome,
            engine::ReadPlan::NeedsSegment { segment, absolute } => self.load_cold(&meta, &segment, absolute, req.max_chunk_bytes).await?,
        };

        match req.live {
            Live::None => Ok(ReadReply::Immediate(outcome)),
            Live::LongPoll { request_url } => {
                if outcome.has_data || !outcome.up_to_date {
                    Ok(ReadReply::Immediate(outcome))
                } else {
                    let resume_offset = ParsedOffset::Explicit(absolute_offset(&meta, meta.tail_offset));
                    let rx = self.fanout.register_waiter(request_url, meta.tail_offset);
                    Ok(ReadReply::LongPollPending { rx, resume_offset })
                }
            }
            Live::Sse => {
                let (id, rx) = self.fanout.open_channel();
                Ok(ReadReply::PushOpened { channel_id: id, rx })
            }
        }
    }

    async fn load_cold(&mut self, meta: &StreamMeta, segment: &Segment, absolute: i64, max_chunk_bytes: usize) -> AppResult<ReadOutcome> {
        let blob = self
            .blob
            .get(&segment.key)
            .await
            .map_err(|e| AppError::internal(format!("blob store read failed: {e}")))?
            .ok_or_else(|| AppError::internal("segment blob missing"))?;
        engine::finish_cold_read(meta, segment, &blob, absolute, max_chunk_bytes)
    }

    #[cfg(feature = "debug-actions")]
    async fn handle_debug(&mut self, action: DebugAction) -> AppResult<DebugReply> {
        match action {
            DebugAction::OpsCount => {
                let count = self.with_conn(|conn| hot_storage::ops_count(conn).map_err(AppError::from))?;
                Ok(DebugReply::OpsCount(count))
            }
            DebugAction::ForceRotate => {
                self.rotate().await;
                Ok(DebugReply::Rotated(true))
            }
            DebugAction::TruncateLatestSegment => {
                self.with_conn(|conn| hot_storage::truncate_latest_segment(conn).map_err(AppError::from))?;
                Ok(DebugReply::Truncated)
            }
            DebugAction::CoalesceStats => Ok(DebugReply::OpsCount(self.fanout.waiter_count() as i64)),
        }
    }
}

fn absolute_offset(meta: &StreamMeta, absolute: i64) -> Offset {
    Offset::new(meta.read_seq as u64, (absolute - meta.segment_start) as u64)
}

/// One `data` frame for the bytes this mutation just committed (base64
/// when the stream's content type is non-textual), followed by one
/// `control` frame — spec §4.5. `op` is `None` for a close-only append
/// with no body, in which case only the control frame goes out.
fn build_push_frames(meta: &StreamMeta, next_offset: Offset, closed: bool, op: Option<Op>) -> Vec<PushFrame> {
    let mut frames = Vec::with_capacity(2);
    if let Some(op) = op {
        if !op.body.is_empty() {
            let is_json = crate::content_type::is_json(&meta.content_type);
            let (data, base64) = if is_json {
                (String::from_utf8_lossy(&op.body).into_owned(), false)
            } else {
                (BASE64.encode(&op.body), true)
            };
            frames.push(PushFrame::Data { data, base64 });
        }
    }
    frames.push(PushFrame::Control {
        stream_next_offset: next_offset.encode(),
        stream_cursor: None,
        stream_write_timestamp: None,
        stream_closed: closed,
        up_to_date: None,
    });
    frames
}

