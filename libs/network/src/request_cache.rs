//! Request/Reply Correlation
//!
//! Every request that expects a reply registers a continuation here under a
//! fresh non-zero 16-bit sequence id, which travels as `msg_seq` in the request
//! header and comes back unchanged in the reply header.
//!
//! Each pending entry is completed exactly once, by whichever of these gets to
//! remove it from the map first:
//! - [`RequestCache::resolve`] when the matching reply arrives
//! - [`RequestCache::sweep_expired`] once the absolute deadline has passed
//! - [`RequestCache::cancel_for_stage`] when the owning stage is destroyed
//!
//! Removal is a single atomic operation on a concurrent map, so a reply racing
//! its own timeout can never complete the continuation twice.

use crate::error::RequestError;
use codec::RoutePacket;
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Result delivered to a waiting requester
pub type ReplyResult = Result<RoutePacket, RequestError>;

const MAX_SEQ: u32 = u16::MAX as u32;

struct PendingRequest {
    reply: oneshot::Sender<ReplyResult>,
    deadline: Instant,
    timeout: Duration,
    msg_id: String,
    owner_stage: Option<String>,
}

/// Pending request table for one node
pub struct RequestCache {
    pending: DashMap<u16, PendingRequest>,
    next_seq: AtomicU32,
    default_timeout: Duration,
}

/// Future resolving to the reply (or failure) of one request
pub struct ReplyFuture {
    msg_seq: u16,
    rx: oneshot::Receiver<ReplyResult>,
}

impl ReplyFuture {
    pub fn msg_seq(&self) -> u16 {
        self.msg_seq
    }
}

impl Future for ReplyFuture {
    type Output = ReplyResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let msg_seq = self.msg_seq;
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RequestError::Cancelled {
                msg_seq,
                reason: "request cache dropped".to_string(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl RequestCache {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            next_seq: AtomicU32::new(0),
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Register a new pending request and allocate its sequence id.
    ///
    /// `owner_stage` ties the request to a stage so that destroying the stage
    /// cancels it. `timeout` falls back to the cache default.
    pub fn register(
        &self,
        msg_id: &str,
        owner_stage: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<(u16, ReplyFuture), RequestError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let (tx, rx) = oneshot::channel();
        let mut entry = Some(PendingRequest {
            reply: tx,
            deadline: Instant::now() + timeout,
            timeout,
            msg_id: msg_id.to_string(),
            owner_stage: owner_stage.map(str::to_string),
        });

        for _ in 0..MAX_SEQ {
            let seq = (self.next_seq.fetch_add(1, Ordering::Relaxed) % MAX_SEQ + 1) as u16;
            if let dashmap::mapref::entry::Entry::Vacant(vacant) = self.pending.entry(seq) {
                if let Some(request) = entry.take() {
                    vacant.insert(request);
                }
                return Ok((seq, ReplyFuture { msg_seq: seq, rx }));
            }
        }

        Err(RequestError::SequenceExhausted {
            in_flight: self.pending.len(),
        })
    }

    /// Complete the request matching `reply.msg_seq`.
    ///
    /// Returns false (and drops the packet) when nothing is waiting for it,
    /// e.g. the request already timed out.
    pub fn resolve(&self, reply: RoutePacket) -> bool {
        let msg_seq = reply.header.seq();
        let Some((_, request)) = self.pending.remove(&msg_seq) else {
            warn!(
                msg_seq,
                msg_id = %reply.header.msg_id,
                from = %reply.header.from,
                "Reply without pending request dropped"
            );
            return false;
        };

        let error_code = reply.header.error();
        let result = if error_code != 0 {
            Err(RequestError::ErrorReply {
                msg_seq,
                msg_id: request.msg_id.clone(),
                error_code,
            })
        } else {
            Ok(reply)
        };
        if request.reply.send(result).is_err() {
            debug!(msg_seq, msg_id = %request.msg_id, "Requester went away before reply");
        }
        true
    }

    /// Time out every request whose deadline is at or before `now`
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expired: Vec<u16> = self
            .pending
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut completed = 0;
        for seq in expired {
            if let Some((_, request)) = self.pending.remove_if(&seq, |_, r| r.deadline <= now) {
                debug!(msg_seq = seq, msg_id = %request.msg_id, "Request timed out");
                let _ = request.reply.send(Err(RequestError::Timeout {
                    msg_seq: seq,
                    msg_id: request.msg_id,
                    timeout_ms: request.timeout.as_millis() as u64,
                }));
                completed += 1;
            }
        }
        completed
    }

    /// Cancel every request owned by `stage_id`
    pub fn cancel_for_stage(&self, stage_id: &str) -> usize {
        let owned: Vec<u16> = self
            .pending
            .iter()
            .filter(|entry| entry.owner_stage.as_deref() == Some(stage_id))
            .map(|entry| *entry.key())
            .collect();

        let mut cancelled = 0;
        for seq in owned {
            if let Some((_, request)) = self
                .pending
                .remove_if(&seq, |_, r| r.owner_stage.as_deref() == Some(stage_id))
            {
                let _ = request.reply.send(Err(RequestError::Cancelled {
                    msg_seq: seq,
                    reason: format!("stage {stage_id} destroyed"),
                }));
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            debug!(stage_id = %stage_id, cancelled, "Cancelled stage requests");
        }
        cancelled
    }

    /// Cancel everything, used at node shutdown
    pub fn cancel_all(&self, reason: &str) -> usize {
        let keys: Vec<u16> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut cancelled = 0;
        for seq in keys {
            if let Some((_, request)) = self.pending.remove(&seq) {
                let _ = request.reply.send(Err(RequestError::Cancelled {
                    msg_seq: seq,
                    reason: reason.to_string(),
                }));
                cancelled += 1;
            }
        }
        cancelled
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Run [`sweep_expired`](Self::sweep_expired) every `interval` until the
    /// cache is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    return;
                };
                cache.sweep_expired(Instant::now());
            }
        })
    }
}
