//! Admission gate: global and per-submitter concurrency with a bounded queue.
//!
//! All counters live behind one mutex. A submitter's count covers slots it
//! holds *and* requests it has queued, so a queued request can always run the
//! moment a global slot frees up and nothing ever has to be drained from the
//! queue for being over its submitter's limit. Promotion is FIFO.
//!
//! Closing the gate rejects new and queued requests with `Overloaded`; held
//! slots drain normally and [`AdmissionGate::wait_idle`] resolves once the
//! last one is released.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use sluice_core::AdmissionRejected;
use tokio::sync::{oneshot, Notify};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateLimits {
    pub global_max: usize,
    pub per_submitter_max: usize,
    pub queue_capacity: usize,
    /// `None` waits indefinitely.
    pub queue_timeout: Option<Duration>,
}

struct Waiter {
    id: u64,
    submitter: String,
    tx: oneshot::Sender<ExecutionSlot>,
}

#[derive(Default)]
struct GateState {
    active: usize,
    /// Held plus queued, per submitter. Absent means zero.
    reserved: HashMap<String, usize>,
    queue: VecDeque<Waiter>,
    next_waiter: u64,
    closed: bool,
}

impl GateState {
    fn reserve(&mut self, submitter: &str) {
        *self.reserved.entry(submitter.to_string()).or_insert(0) += 1;
    }

    fn unreserve(&mut self, submitter: &str) {
        if let Some(count) = self.reserved.get_mut(submitter) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.reserved.remove(submitter);
            }
        }
    }
}

struct GateInner {
    limits: GateLimits,
    state: Mutex<GateState>,
    idle: Notify,
}

impl GateInner {
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Give the freed slot to the next waiter, or return it to the pool.
    fn release(self: &Arc<Self>, submitter: &str) {
        let mut state = self.lock();
        state.unreserve(submitter);
        while let Some(waiter) = state.queue.pop_front() {
            let slot = ExecutionSlot {
                gate: Some(self.clone()),
                submitter: waiter.submitter.clone(),
            };
            match waiter.tx.send(slot) {
                Ok(()) => {
                    debug!(submitter = %waiter.submitter, "queued request promoted");
                    return;
                }
                Err(mut orphan) => {
                    // the waiter went away; disarm so its drop does not
                    // re-enter the lock we are holding
                    orphan.gate = None;
                    state.unreserve(&waiter.submitter);
                }
            }
        }
        state.active = state.active.saturating_sub(1);
        if state.active == 0 {
            self.idle.notify_waiters();
        }
    }

    /// Remove a queued waiter. False if it was already promoted.
    fn abandon(&self, waiter_id: u64) -> bool {
        let mut state = self.lock();
        match state.queue.iter().position(|w| w.id == waiter_id) {
            Some(index) => {
                if let Some(waiter) = state.queue.remove(index) {
                    state.unreserve(&waiter.submitter);
                }
                true
            }
            None => false,
        }
    }
}

/// A granted slot. Released exactly once, when dropped.
pub struct ExecutionSlot {
    gate: Option<Arc<GateInner>>,
    submitter: String,
}

impl ExecutionSlot {
    pub fn submitter(&self) -> &str {
        &self.submitter
    }
}

impl Drop for ExecutionSlot {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.release(&self.submitter);
        }
    }
}

impl std::fmt::Debug for ExecutionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionSlot")
            .field("submitter", &self.submitter)
            .finish()
    }
}

/// Removes a queued waiter if the acquiring future is dropped mid-wait.
struct QueuedTicket<'a> {
    gate: &'a GateInner,
    waiter_id: u64,
    armed: bool,
}

impl Drop for QueuedTicket<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.gate.abandon(self.waiter_id);
        }
    }
}

#[derive(Clone)]
pub struct AdmissionGate {
    inner: Arc<GateInner>,
}

impl AdmissionGate {
    pub fn new(limits: GateLimits) -> Self {
        Self {
            inner: Arc::new(GateInner {
                limits,
                state: Mutex::new(GateState::default()),
                idle: Notify::new(),
            }),
        }
    }

    pub fn limits(&self) -> GateLimits {
        self.inner.limits
    }

    /// Wait for a slot. Rejects immediately when the submitter is at its
    /// limit, or when no slot is free and the queue is full.
    pub async fn acquire(&self, submitter: &str) -> Result<ExecutionSlot, AdmissionRejected> {
        let limits = self.inner.limits;
        let (waiter_id, mut rx) = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(AdmissionRejected::Overloaded);
            }
            let reserved = state.reserved.get(submitter).copied().unwrap_or(0);
            if reserved >= limits.per_submitter_max {
                return Err(AdmissionRejected::UserLimit {
                    submitter: submitter.to_string(),
                    limit: limits.per_submitter_max,
                });
            }
            if state.active < limits.global_max {
                state.active += 1;
                state.reserve(submitter);
                return Ok(ExecutionSlot {
                    gate: Some(self.inner.clone()),
                    submitter: submitter.to_string(),
                });
            }
            if state.queue.len() >= limits.queue_capacity {
                return Err(AdmissionRejected::Overloaded);
            }
            state.reserve(submitter);
            state.next_waiter += 1;
            let id = state.next_waiter;
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter {
                id,
                submitter: submitter.to_string(),
                tx,
            });
            debug!(submitter, queued = state.queue.len(), "request queued");
            (id, rx)
        };

        let mut ticket = QueuedTicket {
            gate: &self.inner,
            waiter_id,
            armed: true,
        };
        let received = match limits.queue_timeout {
            None => (&mut rx).await,
            Some(wait) => match tokio::time::timeout(wait, &mut rx).await {
                Ok(received) => received,
                Err(_) => {
                    ticket.armed = false;
                    if self.inner.abandon(waiter_id) {
                        debug!(submitter, "queue wait timed out");
                        return Err(AdmissionRejected::Overloaded);
                    }
                    // promoted while timing out; the slot is already ours
                    rx.await
                }
            },
        };
        ticket.armed = false;
        received.map_err(|_| AdmissionRejected::Overloaded)
    }

    /// Stop admitting. Queued requests are rejected; returns how many.
    pub fn close(&self) -> usize {
        let mut state = self.inner.lock();
        state.closed = true;
        let waiters: Vec<Waiter> = state.queue.drain(..).collect();
        for waiter in &waiters {
            state.unreserve(&waiter.submitter);
        }
        // dropping the senders wakes each waiter with a rejection
        waiters.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Resolve once no slot is held.
    pub async fn wait_idle(&self) {
        loop {
            let mut notified = std::pin::pin!(self.inner.idle.notified());
            notified.as_mut().enable();
            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Slots currently held.
    pub fn active(&self) -> usize {
        self.inner.lock().active
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Held plus queued for one submitter.
    pub fn reserved_by(&self, submitter: &str) -> usize {
        self.inner
            .lock()
            .reserved
            .get(submitter)
            .copied()
            .unwrap_or(0)
    }
}
