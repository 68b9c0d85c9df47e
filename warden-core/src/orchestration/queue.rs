//! Task queue port and the in-memory reference queue.
//!
//! Delivery is at-least-once. A lease that is neither acked nor nacked before
//! it expires is handed out again by [`TaskQueue::reclaim_expired`], so
//! consumers must tolerate seeing the same task key more than once.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use warden_model::{JobId, ToolRunId};

use super::retry::RetryPolicy;
use super::task::{
    DeadLetter, EnqueueOutcome, LeaseId, NackOutcome, QueueDepth, TaskLease,
    ToolTask,
};
use crate::error::{OrchestratorError, Result};

/// Lease-based work queue for tool tasks.
///
/// At most one live entry exists per task key. Every delivery is a lease that
/// the consumer must ack, nack or defer before it expires; an expired lease
/// makes the task deliverable again.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Adds a task. A key that is already queued or leased is reported as a
    /// duplicate and not added twice.
    async fn enqueue(&self, task: ToolTask) -> Result<EnqueueOutcome>;

    /// Leases the next ready task to `worker`, or `None` when nothing is ready.
    async fn dequeue(&self, worker: &str) -> Result<Option<TaskLease>>;

    /// The task finished (successfully or terminally); forget it.
    async fn ack(&self, lease_id: LeaseId) -> Result<()>;

    /// Records a failed attempt. Retryable failures are requeued with backoff
    /// until the attempt budget is spent, then dead-lettered.
    async fn nack(
        &self,
        lease_id: LeaseId,
        retryable: bool,
        error: Option<String>,
    ) -> Result<NackOutcome>;

    /// Offers the task again after `delay` without consuming an attempt.
    async fn defer(&self, lease_id: LeaseId, delay: Duration) -> Result<()>;

    /// Drops queued (not leased) tasks of `job_id`. Returns how many.
    async fn cancel_job(&self, job_id: JobId) -> Result<usize>;

    /// Makes tasks with expired leases deliverable again. Returns how many.
    async fn reclaim_expired(&self) -> Result<usize>;

    /// Counts of entries by state.
    async fn depth(&self) -> Result<QueueDepth>;

    /// Parks an idle worker until work may be available or `max_wait` passes.
    async fn wait_for_work(&self, max_wait: Duration) {
        tokio::time::sleep(max_wait).await;
    }
}

#[derive(Debug)]
enum EntryState {
    Ready { at: Instant },
    Leased { lease_id: LeaseId, expires_at: Instant },
}

#[derive(Debug)]
struct Entry {
    task: ToolTask,
    attempts: u16,
    state: EntryState,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<ToolRunId, Entry>,
    /// Ready keys in offer order. Leased keys are not in here.
    order: VecDeque<ToolRunId>,
    leases: HashMap<LeaseId, ToolRunId>,
    dead_letters: Vec<DeadLetter>,
    closed: bool,
}

/// Single-process [`TaskQueue`] with the same lease, backoff and dead-letter
/// rules a broker-backed queue would apply.
pub struct InMemoryTaskQueue {
    retry: RetryPolicy,
    lease_ttl: Duration,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl fmt::Debug for InMemoryTaskQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("InMemoryTaskQueue");
        debug
            .field("retry", &self.retry)
            .field("lease_ttl", &self.lease_ttl);
        match self.state.try_lock() {
            Ok(state) => {
                debug
                    .field("entries", &state.entries.len())
                    .field("leases", &state.leases.len())
                    .field("dead_letters", &state.dead_letters.len());
            }
            Err(_) => {
                debug.field("state", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl InMemoryTaskQueue {
    /// `retry` sets the backoff and attempt budget for nacks; `lease_ttl` is
    /// how long a dequeued task stays leased.
    pub fn new(retry: RetryPolicy, lease_ttl: Duration) -> Self {
        Self {
            retry,
            lease_ttl,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Rejects further enqueues, as a broker outage would.
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
    }

    /// Accepts enqueues again after [`close`](Self::close).
    pub async fn reopen(&self) {
        self.state.lock().await.closed = false;
    }

    /// Tasks that ran out of attempts, oldest first.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.clone()
    }

    fn take_lease(state: &mut QueueState, lease_id: LeaseId) -> Result<ToolRunId> {
        state
            .leases
            .remove(&lease_id)
            .ok_or_else(|| OrchestratorError::Queue(format!("unknown or expired lease {lease_id}")))
    }

    fn make_ready(state: &mut QueueState, key: ToolRunId, at: Instant) {
        if let Some(entry) = state.entries.get_mut(&key) {
            entry.state = EntryState::Ready { at };
            state.order.push_back(key);
        }
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: ToolTask) -> Result<EnqueueOutcome> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(OrchestratorError::Queue("queue is not accepting tasks".into()));
        }
        if state.entries.contains_key(&task.key) {
            return Ok(EnqueueOutcome::Duplicate);
        }

        let key = task.key;
        state.entries.insert(
            key,
            Entry {
                task,
                attempts: 0,
                state: EntryState::Ready { at: Instant::now() },
            },
        );
        state.order.push_back(key);
        drop(state);

        self.notify.notify_one();
        Ok(EnqueueOutcome::Accepted)
    }

    async fn dequeue(&self, worker: &str) -> Result<Option<TaskLease>> {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        let position = state.order.iter().position(|key| {
            matches!(
                state.entries.get(key),
                Some(Entry { state: EntryState::Ready { at }, .. }) if *at <= now
            )
        });
        let Some(position) = position else {
            return Ok(None);
        };
        let Some(key) = state.order.remove(position) else {
            return Ok(None);
        };

        let lease_id = LeaseId::new();
        let expires_at = now + self.lease_ttl;
        let Some(entry) = state.entries.get_mut(&key) else {
            return Ok(None);
        };
        entry.state = EntryState::Leased { lease_id, expires_at };
        let lease = TaskLease {
            lease_id,
            task: entry.task.clone(),
            attempts: entry.attempts,
            worker: worker.to_string(),
            expires_at,
        };
        state.leases.insert(lease_id, key);
        Ok(Some(lease))
    }

    async fn ack(&self, lease_id: LeaseId) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = Self::take_lease(&mut state, lease_id)?;
        state.entries.remove(&key);
        Ok(())
    }

    async fn nack(
        &self,
        lease_id: LeaseId,
        retryable: bool,
        error: Option<String>,
    ) -> Result<NackOutcome> {
        let mut state = self.state.lock().await;
        let key = Self::take_lease(&mut state, lease_id)?;
        let Some(entry) = state.entries.get_mut(&key) else {
            return Err(OrchestratorError::Queue(format!("lease {lease_id} has no task")));
        };
        entry.attempts = entry.attempts.saturating_add(1);
        let attempts = entry.attempts;

        if retryable && self.retry.allows_another(attempts) {
            let delay = self.retry.delay_for(key, attempts);
            Self::make_ready(&mut state, key, Instant::now() + delay);
            drop(state);
            self.notify.notify_one();
            return Ok(NackOutcome::Requeued { attempts, delay });
        }

        if let Some(entry) = state.entries.remove(&key) {
            tracing::warn!(
                target: "warden::queue",
                run = %key,
                attempts,
                error = error.as_deref().unwrap_or(""),
                "task dead-lettered"
            );
            state.dead_letters.push(DeadLetter {
                task: entry.task,
                attempts,
                error,
            });
        }
        Ok(NackOutcome::DeadLettered { attempts })
    }

    async fn defer(&self, lease_id: LeaseId, delay: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = Self::take_lease(&mut state, lease_id)?;
        Self::make_ready(&mut state, key, Instant::now() + delay);
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn cancel_job(&self, job_id: JobId) -> Result<usize> {
        let mut state = self.state.lock().await;
        let QueueState { entries, order, .. } = &mut *state;
        let before = order.len();
        order.retain(|key| {
            let cancel = entries
                .get(key)
                .is_some_and(|entry| entry.task.job_id == job_id);
            if cancel {
                entries.remove(key);
            }
            !cancel
        });
        Ok(before - order.len())
    }

    async fn reclaim_expired(&self) -> Result<usize> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let expired: Vec<(LeaseId, ToolRunId)> = state
            .entries
            .iter()
            .filter_map(|(key, entry)| match entry.state {
                EntryState::Leased { lease_id, expires_at } if expires_at <= now => {
                    Some((lease_id, *key))
                }
                _ => None,
            })
            .collect();

        for (lease_id, key) in &expired {
            state.leases.remove(lease_id);
            Self::make_ready(&mut state, *key, now);
            tracing::info!(target: "warden::queue", run = %key, "lease expired, task redelivered");
        }
        drop(state);

        for _ in 0..expired.len() {
            self.notify.notify_one();
        }
        Ok(expired.len())
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let now = Instant::now();
        let state = self.state.lock().await;
        let mut depth = QueueDepth {
            dead_letter: state.dead_letters.len(),
            ..QueueDepth::default()
        };
        for entry in state.entries.values() {
            match entry.state {
                EntryState::Ready { at } if at <= now => depth.ready += 1,
                EntryState::Ready { .. } => depth.delayed += 1,
                EntryState::Leased { .. } => depth.leased += 1,
            }
        }
        Ok(depth)
    }

    async fn wait_for_work(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.notify.notified()).await;
    }
}
