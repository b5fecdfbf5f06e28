//! Internal push bridge (spec §4.10): translates the sequencer's internal
//! push channel into a browser-consumable event stream — plain `data:`
//! frames for appended bytes, `event: control` frames carrying the offset
//! bookkeeping a client needs to resume a plain read after disconnecting.

use crate::engine::ReadOutcome;
use crate::fanout::PushFrame;
use crate::offset::ParsedOffset;
use crate::sequencer::{Live, ReadReply, ReadRequest, SequencerHandle};
use crate::state::AppState;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;

pub async fn stream_response(state: &AppState, handle: SequencerHandle, offset: ParsedOffset, content_type: String) -> Response {
    let max_chunk_bytes = state.config.max_read_chunk_bytes;
    let is_json = crate::content_type::is_json(&content_type);

    let catchup = handle.read(ReadRequest { offset, max_chunk_bytes, live: Live::None }).await;
    let mut initial = VecDeque::new();
    if let Ok(ReadReply::Immediate(read)) = catchup {
        push_catchup_frames(&mut initial, read, is_json);
    }

    let (channel_id, rx) = match handle
        .read(ReadRequest { offset: ParsedOffset::Now, max_chunk_bytes, live: Live::Sse })
        .await
    {
        Ok(ReadReply::PushOpened { channel_id, rx }) => (channel_id, rx),
        Ok(_) => return crate::error::AppError::internal("sequencer did not open a push channel").into_response(),
        Err(e) => return e.into_response(),
    };

    let initial_events = initial.into_iter().map(frame_to_event).collect();
    let stream = SseFrameStream { initial: initial_events, rx, channel_id, handle };
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("keep-alive"))
        .into_response()
}

fn push_catchup_frames(out: &mut VecDeque<PushFrame>, read: ReadOutcome, is_json: bool) {
    if read.has_data {
        let (data, base64) = if is_json {
            (String::from_utf8_lossy(&read.body).into_owned(), false)
        } else {
            (BASE64.encode(&read.body), true)
        };
        out.push_back(PushFrame::Data { data, base64 });
    }
    out.push_back(PushFrame::Control {
        stream_next_offset: read.next_offset.encode(),
        stream_cursor: None,
        stream_write_timestamp: Some(read.write_timestamp),
        stream_closed: read.closed_at_tail,
        up_to_date: Some(read.up_to_date),
    });
}

fn frame_to_event(frame: PushFrame) -> Event {
    match &frame {
        PushFrame::Data { data, .. } => Event::default().data(data.clone()),
        PushFrame::Control { .. } => {
            let json = serde_json::to_string(&frame).unwrap_or_default();
            Event::default().event("control").data(json)
        }
    }
}

/// Drains queued catch-up frames first, then the live push channel.
/// Releases the channel back to the sequencer's fan-out table on drop —
/// covers both a client disconnect and the stream being dropped early.
struct SseFrameStream {
    initial: VecDeque<Event>,
    rx: mpsc::Receiver<PushFrame>,
    channel_id: u64,
    handle: SequencerHandle,
}

impl futures_util::Stream for SseFrameStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(event) = this.initial.pop_front() {
            return Poll::Ready(Some(Ok(event)));
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(frame)) => Poll::Ready(Some(Ok(frame_to_event(frame)))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for SseFrameStream {
    fn drop(&mut self) {
        let handle = self.handle.clone();
        let channel_id = self.channel_id;
        tokio::spawn(async move {
            handle.close_push(channel_id).await;
        });
    }
}
