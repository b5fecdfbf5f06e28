//! Realtime fan-out (spec §4.5): the long-poll waiter queue and the
//! push-channel set owned by each stream's sequencer actor.
//!
//! This module only owns the waiter/channel bookkeeping and the wake
//! scheduling; the "pre-cache the catch-up read before waking" step
//! needs `engine::read` plus a cache handle, so that orchestration lives
//! in `sequencer.rs`, which calls [`Fanout::waiters_pending_wake`] to
//! decide what to pre-cache before calling [`Fanout::wake_and_broadcast`].

use rand::Rng;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;

#[derive(Debug, Clone, Copy)]
pub struct FanoutConfig {
    pub stagger: Duration,
    /// How long past `timeout` a waiter is allowed to sit in the queue
    /// before `evict_stale` reclaims it. The HTTP handler is responsible
    /// for its own `tokio::time::timeout(timeout, rx)` — this is only
    /// cleanup for entries nobody ever collected.
    pub timeout: Duration,
    pub channel_capacity: usize,
}

pub struct Waiter {
    pub url: String,
    pub notify_offset: i64,
    arrived_at: Instant,
    reply: Option<oneshot::Sender<WaiterOutcome>>,
}

#[derive(Debug)]
pub enum WaiterOutcome {
    Woken { new_tail: i64 },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PushFrame {
    Data {
        data: String,
        base64: bool,
    },
    Control {
        #[serde(rename = "streamNextOffset")]
        stream_next_offset: String,
        #[serde(rename = "streamCursor", skip_serializing_if = "Option::is_none")]
        stream_cursor: Option<String>,
        #[serde(rename = "streamWriteTimestamp", skip_serializing_if = "Option::is_none")]
        stream_write_timestamp: Option<i64>,
        #[serde(rename = "streamClosed")]
        stream_closed: bool,
        #[serde(rename = "upToDate", skip_serializing_if = "Option::is_none")]
        up_to_date: Option<bool>,
    },
}

struct PushChannel {
    id: u64,
    tx: mpsc::Sender<PushFrame>,
}

pub struct Fanout {
    waiters: Vec<Waiter>,
    channels: Vec<PushChannel>,
    next_channel_id: u64,
    config: FanoutConfig,
}

impl Fanout {
    pub fn new(config: FanoutConfig) -> Self {
        Fanout { waiters: Vec::new(), channels: Vec::new(), next_channel_id: 0, config }
    }

    /// Enrolls a long-poll waiter; the caller should race the returned
    /// receiver against its own `timeout` deadline.
    pub fn register_waiter(&mut self, url: String, notify_offset: i64) -> oneshot::Receiver<WaiterOutcome> {
        self.evict_stale();
        let (tx, rx) = oneshot::channel();
        self.waiters.push(Waiter { url, notify_offset, arrived_at: Instant::now(), reply: Some(tx) });
        rx
    }

    /// URLs that an append to `new_tail` is about to wake, for the
    /// sequencer to pre-compute and cache a catch-up read under before
    /// actually waking anyone.
    pub fn waiters_pending_wake(&self, new_tail: i64) -> impl Iterator<Item = &Waiter> {
        self.waiters.iter().filter(move |w| w.notify_offset < new_tail)
    }

    /// Wakes matching waiters (staggered over `[0, stagger]` to
    /// desynchronize reconnection bursts) and then broadcasts `frames` to
    /// push channels, in that order, per the broadcast contract.
    pub fn wake_and_broadcast(&mut self, new_tail: i64, frames: Vec<PushFrame>) {
        let (to_wake, remaining): (Vec<_>, Vec<_>) =
            self.waiters.drain(..).partition(|w| w.notify_offset < new_tail);
        self.waiters = remaining;

        for mut waiter in to_wake {
            if let Some(reply) = waiter.reply.take() {
                let stagger_ms = self.config.stagger.as_millis().max(1) as u64;
                tokio::spawn(async move {
                    let jitter = rand::thread_rng().gen_range(0..stagger_ms);
                    sleep(Duration::from_millis(jitter)).await;
                    let _ = reply.send(WaiterOutcome::Woken { new_tail });
                });
            }
        }

        self.broadcast(&frames);
    }

    fn broadcast(&mut self, frames: &[PushFrame]) {
        self.channels.retain_mut(|channel| {
            for frame in frames {
                if channel.tx.try_send(frame.clone()).is_err() {
                    return false;
                }
            }
            true
        });
    }

    pub fn open_channel(&mut self) -> (u64, mpsc::Receiver<PushFrame>) {
        let id = self.next_channel_id;
        self.next_channel_id += 1;
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        self.channels.push(PushChannel { id, tx });
        (id, rx)
    }

    pub fn close_channel(&mut self, id: u64) {
        self.channels.retain(|c| c.id != id);
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }

    fn evict_stale(&mut self) {
        let deadline = self.config.timeout + Duration::from_secs(1);
        self.waiters.retain(|w| w.arrived_at.elapsed() < deadline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> FanoutConfig {
        FanoutConfig { stagger: Duration::from_millis(5), timeout: Duration::from_millis(50), channel_capacity: 8 }
    }

    #[tokio::test]
    async fn waiter_below_new_tail_is_woken() {
        let mut fanout = Fanout::new(config());
        let rx = fanout.register_waiter("u1".into(), 10);
        assert_eq!(fanout.waiters_pending_wake(20).count(), 1);
        fanout.wake_and_broadcast(20, Vec::new());
        match rx.await.unwrap() {
            WaiterOutcome::Woken { new_tail } => assert_eq!(new_tail, 20),
        }
        assert_eq!(fanout.waiter_count(), 0);
    }

    #[tokio::test]
    async fn waiter_at_or_above_new_tail_is_left_enrolled() {
        let mut fanout = Fanout::new(config());
        let _rx = fanout.register_waiter("u1".into(), 20);
        fanout.wake_and_broadcast(20, Vec::new());
        assert_eq!(fanout.waiter_count(), 1);
    }

    #[tokio::test]
    async fn broadcast_drops_channel_on_send_failure() {
        let mut fanout = Fanout::new(FanoutConfig { channel_capacity: 1, ..config() });
        let (_id, mut rx) = fanout.open_channel();
        let frame = PushFrame::Control {
            stream_next_offset: "x".into(),
            stream_cursor: None,
            stream_write_timestamp: None,
            stream_closed: false,
            up_to_date: None,
        };
        // Fill the channel, then force a second send past capacity so the
        // broadcast observes a full buffer and drops the subscriber.
        fanout.channels[0].tx.try_send(frame.clone()).unwrap();
        fanout.broadcast(&[frame]);
        assert_eq!(fanout.channel_count(), 0);
        assert!(rx.recv().await.is_some());
    }
}
