//! Critical lane: the single-flight queue every mutating marketplace call
//! goes through.
//!
//! At most one operation runs at a time. High-priority tasks jump ahead of
//! pending normal tasks but never interrupt the one already running. Each
//! caller gets a [`LaneHandle`] that resolves when its own task settles.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{FailureKind, OpError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueOptions {
    pub priority: Priority,
    /// Settle immediately without invoking the operation
    pub dry_run: bool,
}

impl EnqueueOptions {
    pub fn high() -> Self {
        Self {
            priority: Priority::High,
            dry_run: false,
        }
    }

    pub fn dry_run(dry_run: bool) -> Self {
        Self {
            priority: Priority::Normal,
            dry_run,
        }
    }
}

/// How a lane task settled successfully
#[derive(Debug, Clone, PartialEq)]
pub enum Settled {
    Completed(Value),
    /// Dry run: the operation was never invoked
    Skipped { label: String },
}

impl Settled {
    pub fn to_json(&self) -> Value {
        match self {
            Settled::Completed(v) => v.clone(),
            Settled::Skipped { label } => serde_json::json!({
                "dry_run": true,
                "label": label,
                "status": "skipped",
            }),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        matches!(self, Settled::Skipped { .. })
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LaneError {
    #[error(transparent)]
    Operation(#[from] OpError),
    #[error("queue drained")]
    Drained,
    #[error("lane task abandoned before settling")]
    Abandoned,
}

pub type LaneResult = Result<Settled, LaneError>;

type Operation = Box<dyn FnOnce() -> BoxFuture<'static, Result<Value, OpError>> + Send>;

struct QueueTask {
    id: u64,
    label: String,
    operation: Operation,
    priority: Priority,
    enqueued_at: Instant,
    tx: oneshot::Sender<LaneResult>,
}

/// Lane counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaneStats {
    pub queue_length: usize,
    pub running_count: usize,
    pub completed: u64,
    pub failed: u64,
    pub drained: u64,
    pub skipped: u64,
}

#[derive(Default)]
struct LaneState {
    pending: VecDeque<QueueTask>,
    running: usize,
    worker_active: bool,
    stats: LaneStats,
}

struct LaneInner {
    state: Mutex<LaneState>,
    settle_delay: Duration,
    next_id: AtomicU64,
}

impl LaneInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Resolves with the outcome of one enqueued task.
pub struct LaneHandle {
    label: String,
    rx: oneshot::Receiver<LaneResult>,
}

impl LaneHandle {
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Future for LaneHandle {
    type Output = LaneResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(LaneError::Abandoned)))
    }
}

#[derive(Clone)]
pub struct CriticalLane {
    inner: Arc<LaneInner>,
}

impl CriticalLane {
    pub fn new(settle_delay: Duration) -> Self {
        Self {
            inner: Arc::new(LaneInner {
                state: Mutex::new(LaneState::default()),
                settle_delay,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Submit a mutating operation. Must be called from within a tokio runtime.
    pub fn enqueue<F, Fut>(
        &self,
        label: impl Into<String>,
        options: EnqueueOptions,
        operation: F,
    ) -> LaneHandle
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, OpError>> + Send + 'static,
    {
        let label = label.into();
        let (tx, rx) = oneshot::channel();
        let handle = LaneHandle {
            label: label.clone(),
            rx,
        };

        if options.dry_run {
            info!(label = %label, "dry run, operation skipped");
            self.inner.lock().stats.skipped += 1;
            let _ = tx.send(Ok(Settled::Skipped { label }));
            return handle;
        }

        let task = QueueTask {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            label,
            operation: Box::new(move || operation().boxed()),
            priority: options.priority,
            enqueued_at: Instant::now(),
            tx,
        };

        let mut state = self.inner.lock();
        debug!(id = task.id, label = %task.label, priority = ?task.priority, "task enqueued");
        match task.priority {
            // Ahead of every pending normal task, behind earlier high ones
            Priority::High => {
                let at = state
                    .pending
                    .iter()
                    .position(|t| t.priority != Priority::High)
                    .unwrap_or(state.pending.len());
                state.pending.insert(at, task);
            }
            Priority::Normal => state.pending.push_back(task),
        }
        state.stats.queue_length = state.pending.len();

        if !state.worker_active {
            state.worker_active = true;
            tokio::spawn(run_worker(self.inner.clone()));
        }
        handle
    }

    /// Reject every task that has not started yet. The running task, if any,
    /// settles normally. Returns how many tasks were rejected.
    pub fn drain(&self) -> usize {
        let drained: Vec<QueueTask> = {
            let mut state = self.inner.lock();
            let drained: Vec<QueueTask> = state.pending.drain(..).collect();
            state.stats.drained += drained.len() as u64;
            state.stats.queue_length = 0;
            drained
        };
        let count = drained.len();
        for task in drained {
            let _ = task.tx.send(Err(LaneError::Drained));
        }
        if count > 0 {
            warn!(count, "critical lane drained");
        }
        count
    }

    pub fn queue_length(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn running_count(&self) -> usize {
        self.inner.lock().running
    }

    pub fn stats(&self) -> LaneStats {
        let state = self.inner.lock();
        LaneStats {
            queue_length: state.pending.len(),
            running_count: state.running,
            ..state.stats.clone()
        }
    }
}

async fn run_worker(inner: Arc<LaneInner>) {
    loop {
        let task = {
            let mut state = inner.lock();
            match state.pending.pop_front() {
                Some(task) => {
                    state.running = 1;
                    state.stats.queue_length = state.pending.len();
                    task
                }
                None => {
                    state.worker_active = false;
                    return;
                }
            }
        };

        let QueueTask {
            id,
            label,
            operation,
            enqueued_at,
            tx,
            ..
        } = task;
        debug!(
            id,
            label = %label,
            waited_ms = enqueued_at.elapsed().as_millis() as u64,
            "task started"
        );

        let result = match AssertUnwindSafe(operation()).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(OpError::new(FailureKind::Unknown, "operation panicked")),
        };

        {
            let mut state = inner.lock();
            state.running = 0;
            match &result {
                Ok(_) => state.stats.completed += 1,
                Err(_) => state.stats.failed += 1,
            }
        }

        match &result {
            Ok(_) => info!(id, label = %label, "task settled"),
            Err(e) => warn!(id, label = %label, error = %e, "task failed"),
        }
        let _ = tx.send(result.map(Settled::Completed).map_err(LaneError::from));

        tokio::time::sleep(inner.settle_delay).await;
    }
}
