//! Stream engine (spec §4.4): create, append, close, read, rotate. All
//! five operations are pure with respect to I/O beyond the given SQLite
//! connection; cold-segment blob I/O is two-phase (see `ReadPlan` and
//! `RotationPlan`) so the async sequencer actor can await the blob store
//! without holding this module's synchronous logic across an `.await`.

use crate::content_type;
use crate::error::AppError;
use crate::hot_storage::{self, Batch, Op, Segment, StreamMeta};
use crate::offset::{Offset, ParsedOffset};
use crate::producer::{self, Decision as ProducerDecision};
use rusqlite::Connection;

#[derive(Debug, Clone)]
pub struct ProducerHeaders {
    pub id: String,
    pub epoch: i64,
    pub seq: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct ProducerAck {
    pub epoch: i64,
    pub seq: i64,
}

/// Config-derived limits threaded into `create`/`append` so this module
/// stays independent of `Config` (and easy to unit test with ad hoc
/// values) while still enforcing the same caps the sequencer would.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_append_bytes: usize,
    pub quota_reject_bytes: u64,
    pub producer_expiry_secs: i64,
}

// ---------------------------------------------------------------------------
// create
// ---------------------------------------------------------------------------

pub struct CreateRequest {
    pub content_type: String,
    pub ttl_secs: Option<i64>,
    pub expires_at: Option<i64>,
    pub body: Vec<u8>,
    pub public: bool,
    pub producer: Option<ProducerHeaders>,
    pub stream_seq: Option<String>,
    pub now: i64,
    pub limits: Limits,
}

pub struct CreateOutcome {
    /// `true` for a brand new stream (201); `false` for an idempotent
    /// replay of an existing one (200).
    pub created: bool,
    pub next_offset: Offset,
    pub producer_ack: Option<ProducerAck>,
    pub closed: bool,
}

pub fn create(conn: &mut Connection, mut req: CreateRequest) -> Result<CreateOutcome, AppError> {
    if req.ttl_secs.is_some() && req.expires_at.is_some() {
        return Err(AppError::bad_input("TTL and Expires-At must not both be set"));
    }
    let content_type = content_type::normalize(&req.content_type);
    let is_json = content_type::is_json(&content_type);
    if is_json {
        req.body = normalize_empty_json_array(req.body);
    }

    let effective_expires_at = effective_expires_at(req.ttl_secs, req.expires_at, req.now);

    match hot_storage::get_meta(conn)? {
        Some(meta) => {
            let same_params = meta.content_type == content_type
                && meta.ttl_secs == req.ttl_secs
                && meta.expires_at == effective_expires_at;
            if !same_params {
                return Err(AppError::conflict("stream already exists with different parameters"));
            }
            if req.body.is_empty() {
                let offset = Offset::new(meta.read_seq as u64, (meta.tail_offset - meta.segment_start) as u64);
                return Ok(CreateOutcome {
                    created: false,
                    next_offset: offset,
                    producer_ack: None,
                    closed: meta.closed,
                });
            }
            let outcome = append(
                conn,
                AppendRequest {
                    content_type: req.content_type,
                    body: req.body,
                    close: false,
                    producer: req.producer,
                    stream_seq: req.stream_seq,
                    now: req.now,
                    limits: req.limits,
                },
            )?;
            Ok(CreateOutcome {
                created: false,
                next_offset: outcome.next_offset,
                producer_ack: outcome.producer_ack,
                closed: outcome.closed,
            })
        }
        None => {
            let mut batch = Batch::new();
            batch.push_stmt(hot_storage::insert_stream_stmt(
                &content_type,
                req.ttl_secs,
                effective_expires_at,
                req.now,
                req.public,
            ));
            hot_storage::execute_batch(conn, batch)?;

            if req.body.is_empty() {
                return Ok(CreateOutcome {
                    created: true,
                    next_offset: Offset::ZERO,
                    producer_ack: None,
                    closed: false,
                });
            }
            let outcome = append(
                conn,
                AppendRequest {
                    content_type: req.content_type,
                    body: req.body,
                    close: false,
                    producer: req.producer,
                    stream_seq: req.stream_seq,
                    now: req.now,
                    limits: req.limits,
                },
            )?;
            Ok(CreateOutcome {
                created: true,
                next_offset: outcome.next_offset,
                producer_ack: outcome.producer_ack,
                closed: outcome.closed,
            })
        }
    }
}

fn normalize_empty_json_array(body: Vec<u8>) -> Vec<u8> {
    let trimmed_is_empty_array = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .is_some_and(|v| matches!(v, serde_json::Value::Array(a) if a.is_empty()));
    if trimmed_is_empty_array {
        Vec::new()
    } else {
        body
    }
}

fn effective_expires_at(ttl_secs: Option<i64>, expires_at: Option<i64>, now: i64) -> Option<i64> {
    ttl_secs.map(|secs| now + secs * 1000).or(expires_at)
}

// ---------------------------------------------------------------------------
// append / close
// ---------------------------------------------------------------------------

pub struct AppendRequest {
    pub content_type: String,
    pub body: Vec<u8>,
    pub close: bool,
    pub producer: Option<ProducerHeaders>,
    pub stream_seq: Option<String>,
    pub now: i64,
    pub limits: Limits,
}

pub struct AppendOutcome {
    pub next_offset: Offset,
    pub producer_ack: Option<ProducerAck>,
    pub closed: bool,
    /// `true` when this append was an idempotent producer replay: no new
    /// op was created and the returned offset is the original one.
    pub duplicate: bool,
}

pub fn append(conn: &mut Connection, mut req: AppendRequest) -> Result<AppendOutcome, AppError> {
    let meta = hot_storage::get_meta(conn)?.ok_or_else(|| AppError::not_found("stream not found"))?;

    if req.body.len() > req.limits.max_append_bytes {
        return Err(AppError::payload_too_large("append body exceeds the configured maximum"));
    }

    let normalized_ct = content_type::normalize(&req.content_type);
    let is_json = content_type::is_json(&normalized_ct);
    if is_json {
        req.body = normalize_empty_json_array(req.body);
    }

    let close_only = req.close && req.body.is_empty();

    if !close_only {
        let segment_bytes_total = hot_storage::total_segment_bytes(conn)?;
        let usage = (meta.segment_bytes + segment_bytes_total) as u64;
        if usage >= req.limits.quota_reject_bytes {
            return Err(AppError::storage_exhausted("stream storage quota exceeded"));
        }
    }

    // Producer check runs before the content-type check so idempotent
    // close replays succeed even after the stream is already closed.
    let producer_decision = match &req.producer {
        Some(p) => {
            let state = load_live_producer(conn, &p.id, req.now, req.limits.producer_expiry_secs)?;
            producer::evaluate(state.as_ref(), &p.id, p.epoch, p.seq)
        }
        None => ProducerDecision::None,
    };

    if let ProducerDecision::Duplicate { offset } = producer_decision {
        let producer = req.producer.as_ref().unwrap();
        return Ok(AppendOutcome {
            next_offset: absolute_to_offset(&meta, offset),
            producer_ack: Some(ProducerAck { epoch: producer.epoch, seq: producer.seq }),
            closed: meta.closed,
            duplicate: true,
        });
    }
    if let ProducerDecision::Error(e) = producer_decision {
        return Err(e);
    }

    if meta.closed {
        return Err(AppError::conflict("stream is closed")
            .with_header(crate::error::header_name("Stream-Closed"), "true".to_owned()));
    }

    if !close_only {
        if req.body.is_empty() {
            return Err(AppError::bad_input("append body must be non-empty unless closing"));
        }
        if meta.content_type != normalized_ct {
            return Err(AppError::conflict("content-type does not match stream"));
        }
    }

    if let Some(stream_seq) = &req.stream_seq {
        if let Some(prior) = &meta.last_stream_seq {
            if stream_seq.as_str() <= prior.as_str() {
                return Err(AppError::conflict("Stream-Seq must strictly increase"));
            }
        }
    }

    let chunks = if close_only {
        Vec::new()
    } else if is_json {
        split_json_messages(&req.body)?
    } else {
        vec![req.body.clone()]
    };

    let mut batch = Batch::new();
    let mut tail = meta.tail_offset;
    let mut segment_count = meta.segment_count;
    let mut segment_bytes = meta.segment_bytes;
    let start_tail = tail;

    for chunk in &chunks {
        let (start, end) = if is_json {
            (tail, tail + 1)
        } else {
            (tail, tail + chunk.len() as i64)
        };
        batch.push_stmt(hot_storage::insert_op_stmt(
            start,
            end,
            chunk.len() as i64,
            chunk.clone(),
            req.now,
            req.stream_seq.as_deref(),
            req.producer.as_ref().map(|p| p.id.as_str()),
            req.producer.as_ref().map(|p| p.epoch),
            req.producer.as_ref().map(|p| p.seq),
        ));
        tail = end;
        segment_count += 1;
        segment_bytes += chunk.len() as i64;
    }

    let will_close = req.close;
    batch.push_stmt(hot_storage::update_after_append_stmt(
        tail,
        segment_count,
        segment_bytes,
        req.stream_seq.as_deref(),
        will_close,
        if will_close { req.producer.as_ref().map(|p| p.id.as_str()) } else { meta.close_producer_id.as_deref() },
        if will_close { req.producer.as_ref().map(|p| p.epoch) } else { meta.close_epoch },
        if will_close { req.producer.as_ref().map(|p| p.seq) } else { meta.close_seq },
    ));

    if let Some(p) = &req.producer {
        batch.push_stmt(hot_storage::upsert_producer_stmt(&p.id, p.epoch, p.seq, start_tail, req.now));
    }

    hot_storage::execute_batch(conn, batch)?;

    Ok(AppendOutcome {
        next_offset: absolute_to_offset(&meta, tail),
        producer_ack: req.producer.as_ref().map(|p| ProducerAck { epoch: p.epoch, seq: p.seq }),
        closed: will_close,
        duplicate: false,
    })
}

fn load_live_producer(
    conn: &mut Connection,
    producer_id: &str,
    now: i64,
    expiry_secs: i64,
) -> Result<Option<hot_storage::ProducerState>, AppError> {
    match hot_storage::get_producer(conn, producer_id)? {
        Some(state) if now - state.last_updated > expiry_secs * 1000 => {
            hot_storage::delete_producer(conn, producer_id)?;
            Ok(None)
        }
        other => Ok(other),
    }
}

fn split_json_messages(body: &[u8]) -> Result<Vec<Vec<u8>>, AppError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| AppError::bad_input(format!("invalid JSON body: {e}")))?;
    match value {
        serde_json::Value::Array(items) => items
            .into_iter()
            .map(|v| serde_json::to_vec(&v).map_err(|e| AppError::bad_input(e.to_string())))
            .collect(),
        other => Ok(vec![serde_json::to_vec(&other).map_err(|e| AppError::bad_input(e.to_string()))?]),
    }
}

fn absolute_to_offset(meta: &StreamMeta, absolute: i64) -> Offset {
    Offset::new(meta.read_seq as u64, (absolute - meta.segment_start) as u64)
}

// ---------------------------------------------------------------------------
// offset resolution (spec §4.1's resolveOffset, realized against storage)
// ---------------------------------------------------------------------------

pub enum Location {
    /// An absolute offset inside the stream's live (un-rotated) range.
    Hot(i64),
    /// An absolute offset inside a rotated, immutable cold segment.
    Cold { segment: Segment, absolute: i64 },
}

pub fn resolve_offset(conn: &Connection, meta: &StreamMeta, parsed: ParsedOffset) -> Result<Location, AppError> {
    let offset = match parsed {
        ParsedOffset::Now => return Ok(Location::Hot(meta.tail_offset)),
        ParsedOffset::Start => Offset::ZERO,
        ParsedOffset::Explicit(o) => o,
    };

    if offset.read_seq as i64 == meta.read_seq {
        let local = offset.byte_offset as i64;
        if local > meta.tail_offset - meta.segment_start {
            return Err(AppError::bad_input("offset exceeds tail"));
        }
        Ok(Location::Hot(meta.segment_start + local))
    } else if (offset.read_seq as i64) < meta.read_seq {
        let segment = hot_storage::get_segment(conn, offset.read_seq as i64)?
            .ok_or_else(|| AppError::bad_input("historical segment not found"))?;
        let local = offset.byte_offset as i64;
        let absolute = (segment.start_offset + local).min(segment.end_offset);
        Ok(Location::Cold { segment, absolute })
    } else {
        Err(AppError::bad_input("offset read_seq exceeds current"))
    }
}

// ---------------------------------------------------------------------------
// read
// ---------------------------------------------------------------------------

pub struct ReadOutcome {
    pub body: Vec<u8>,
    pub next_offset: Offset,
    pub up_to_date: bool,
    pub closed_at_tail: bool,
    pub write_timestamp: i64,
    pub has_data: bool,
}

/// `read` either finishes synchronously (hot path) or asks the caller to
/// fetch a cold segment and call `finish_cold_read`.
pub enum ReadPlan {
    Done(ReadOutcome),
    NeedsSegment { segment: Segment, absolute: i64 },
}

pub fn read(conn: &Connection, meta: &StreamMeta, parsed: ParsedOffset, max_chunk_bytes: usize) -> Result<ReadPlan, AppError> {
    let is_json = content_type::is_json(&meta.content_type);
    match resolve_offset(conn, meta, parsed)? {
        Location::Hot(abs) if abs == meta.tail_offset => Ok(ReadPlan::Done(ReadOutcome {
            body: empty_body(is_json),
            next_offset: absolute_to_offset(meta, meta.tail_offset),
            up_to_date: true,
            closed_at_tail: meta.closed,
            write_timestamp: 0,
            has_data: false,
        })),
        Location::Hot(abs) => {
            let ops = gather_hot_ops(conn, abs, max_chunk_bytes, is_json)?;
            let (body, next_abs, write_timestamp, has_data) = scan_ops(&ops, abs, max_chunk_bytes, is_json)?;
            Ok(ReadPlan::Done(ReadOutcome {
                body,
                next_offset: absolute_to_offset(meta, next_abs),
                up_to_date: next_abs == meta.tail_offset,
                closed_at_tail: next_abs == meta.tail_offset && meta.closed,
                write_timestamp,
                has_data,
            }))
        }
        Location::Cold { segment, absolute } => Ok(ReadPlan::NeedsSegment { segment, absolute }),
    }
}

pub fn finish_cold_read(
    meta: &StreamMeta,
    segment: &Segment,
    blob: &[u8],
    absolute: i64,
    max_chunk_bytes: usize,
) -> Result<ReadOutcome, AppError> {
    let is_json = content_type::is_json(&segment.content_type);
    let frames = crate::segment_codec::decode_frames(blob)
        .map_err(|e| AppError::internal(format!("corrupt segment: {e}")))?;
    let ops = synth_ops_from_frames(segment, frames, is_json);
    let (body, next_abs, write_timestamp, has_data) = scan_ops(&ops, absolute, max_chunk_bytes, is_json)?;
    Ok(ReadOutcome {
        body,
        next_offset: offset_after_cold_read(meta, segment, next_abs),
        up_to_date: false,
        closed_at_tail: false,
        write_timestamp,
        has_data,
    })
}

/// The next-offset token after a cold read either still lands inside the
/// same segment, or sits exactly at its end (by contiguity, that is also
/// the start of the next segment, or of the hot range if this was the
/// last segment) — either way `(read_seq + 1, 0)` is correct.
fn offset_after_cold_read(meta: &StreamMeta, segment: &Segment, absolute: i64) -> Offset {
    if absolute < segment.end_offset {
        Offset::new(segment.read_seq as u64, (absolute - segment.start_offset) as u64)
    } else if segment.read_seq + 1 == meta.read_seq {
        absolute_to_offset(meta, absolute)
    } else {
        Offset::new(segment.read_seq as u64 + 1, 0)
    }
}

fn synth_ops_from_frames(segment: &Segment, frames: Vec<Vec<u8>>, is_json: bool) -> Vec<Op> {
    let mut cursor = segment.start_offset;
    frames
        .into_iter()
        .map(|body| {
            let size = body.len() as i64;
            let (start, end) = if is_json { (cursor, cursor + 1) } else { (cursor, cursor + size) };
            cursor = end;
            Op {
                start_offset: start,
                end_offset: end,
                size_bytes: size,
                body,
                created_at: 0,
                stream_seq: None,
                producer_id: None,
                producer_epoch: None,
                producer_seq: None,
            }
        })
        .collect()
}

fn gather_hot_ops(conn: &Connection, abs: i64, max_chunk_bytes: usize, is_json: bool) -> Result<Vec<Op>, AppError> {
    let overlap_start = hot_storage::select_overlap(conn, abs)?.map(|op| op.start_offset).unwrap_or(abs);
    let mut ops = Vec::new();
    let mut next_from = overlap_start;
    let mut collected_bytes = 0usize;
    loop {
        let batch = hot_storage::select_ops_from(conn, next_from)?;
        if batch.is_empty() {
            break;
        }
        let batch_len = batch.len();
        next_from = batch.last().map(|op| op.end_offset).unwrap_or(next_from);
        for op in &batch {
            collected_bytes += op.size_bytes as usize;
        }
        ops.extend(batch);
        if batch_len < 200 || collected_bytes >= max_chunk_bytes || is_json {
            break;
        }
    }
    Ok(ops)
}

/// Scans `ops` (already ordered, already a superset of what's needed)
/// forward from `start_abs`, returning the concatenated/joined body, the
/// resulting absolute next-offset, the max `created_at` seen, and whether
/// any data was returned.
fn scan_ops(ops: &[Op], start_abs: i64, max_chunk_bytes: usize, is_json: bool) -> Result<(Vec<u8>, i64, i64, bool), AppError> {
    if let Some(overlap) = ops.iter().find(|op| op.start_offset < start_abs && op.end_offset > start_abs) {
        if is_json && overlap.start_offset != start_abs {
            return Err(AppError::bad_input("offset lands mid-message"));
        }
    }

    if is_json {
        let mut elements = Vec::new();
        let mut next_abs = start_abs;
        let mut max_created_at = 0i64;
        let mut size = 0usize;
        for op in ops.iter().filter(|op| op.start_offset >= start_abs) {
            if !elements.is_empty() && size + op.body.len() > max_chunk_bytes {
                break;
            }
            size += op.body.len();
            elements.push(op.body.as_slice());
            next_abs = op.end_offset;
            max_created_at = max_created_at.max(op.created_at);
        }
        let mut out = Vec::with_capacity(size + elements.len() + 2);
        out.push(b'[');
        for (i, el) in elements.iter().enumerate() {
            if i > 0 {
                out.push(b',');
            }
            out.extend_from_slice(el);
        }
        out.push(b']');
        let has_data = !elements.is_empty();
        return Ok((out, next_abs, max_created_at, has_data));
    }

    let mut out = Vec::new();
    let mut next_abs = start_abs;
    let mut max_created_at = 0i64;
    let mut included_any = false;
    for op in ops.iter().filter(|op| op.end_offset > start_abs) {
        let local_skip = (start_abs - op.start_offset).max(0) as usize;
        let slice = &op.body[local_skip.min(op.body.len())..];
        if included_any && out.len() + slice.len() > max_chunk_bytes {
            break;
        }
        out.extend_from_slice(slice);
        next_abs = op.end_offset;
        max_created_at = max_created_at.max(op.created_at);
        included_any = true;
    }
    Ok((out, next_abs, max_created_at, included_any))
}

fn empty_body(is_json: bool) -> Vec<u8> {
    if is_json {
        b"[]".to_vec()
    } else {
        Vec::new()
    }
}

// ---------------------------------------------------------------------------
// rotation
// ---------------------------------------------------------------------------

pub struct RotationPlan {
    pub new_read_seq: i64,
    pub segment_start: i64,
    pub segment_end: i64,
    pub content_type: String,
    pub message_count: i64,
    pub blob: Vec<u8>,
}

/// Whether the current segment counters exceed the configured thresholds
/// (or `force` is set). Does not mutate anything.
pub fn should_rotate(meta: &StreamMeta, max_messages: i64, max_bytes: i64, force: bool) -> bool {
    force || meta.segment_count >= max_messages || meta.segment_bytes >= max_bytes
}

pub fn plan_rotation(conn: &Connection, meta: &StreamMeta) -> Result<Option<RotationPlan>, AppError> {
    if meta.segment_start >= meta.tail_offset {
        return Ok(None);
    }
    let ops = hot_storage::select_all_ops(conn)?;
    let in_range: Vec<&Op> = ops
        .iter()
        .filter(|op| op.start_offset >= meta.segment_start && op.start_offset < meta.tail_offset)
        .collect();
    let blob = crate::segment_codec::encode_frames(in_range.iter().map(|op| op.body.as_slice()));
    Ok(Some(RotationPlan {
        new_read_seq: meta.read_seq + 1,
        segment_start: meta.segment_start,
        segment_end: meta.tail_offset,
        content_type: meta.content_type.clone(),
        message_count: in_range.len() as i64,
        blob,
    }))
}

/// Applies the SQL side of a rotation after the blob write has already
/// succeeded: insert the segment row, bump `read_seq`, reset segment
/// counters, and delete the ops just archived (unless `retain_ops`, used
/// by the debug truncate/replay tooling).
pub fn apply_rotation(conn: &mut Connection, plan: &RotationPlan, segment_key: &str, retain_ops: bool) -> Result<(), AppError> {
    let mut batch = Batch::new();
    batch.push_stmt(hot_storage::insert_segment_stmt(
        plan.new_read_seq - 1,
        segment_key,
        plan.segment_start,
        plan.segment_end,
        &plan.content_type,
        plan.blob.len() as i64,
        plan.message_count,
        None,
    ));
    batch.push_stmt(hot_storage::rotate_meta_stmt(plan.new_read_seq, plan.segment_end));
    if !retain_ops {
        batch.push_stmt(hot_storage::delete_ops_in_range(plan.segment_start, plan.segment_end));
    }
    hot_storage::execute_batch(conn, batch)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// delete
// ---------------------------------------------------------------------------

/// Stream delete is a file-level operation owned by the sequencer host
/// (the whole per-stream SQLite file is removed); this module has nothing
/// stateful to clean up beyond what the caller already has a handle to.
pub fn validate_exists(conn: &Connection) -> Result<(), AppError> {
    hot_storage::get_meta(conn)?
        .map(|_| ())
        .ok_or_else(|| AppError::not_found("stream not found"))
}
