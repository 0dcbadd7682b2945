//! Bounded concurrent processing queue.
//!
//! One dispatcher loop owns all item state; workers are spawned per item
//! and report back over a channel. At most `max_concurrent` items are in
//! the `processing` state at any instant, dispatch is FIFO, and retryable
//! failures are re-enqueued after a capped exponential backoff with jitter.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::agent::FixAgent;
use crate::checks::CheckRunner;
use crate::config::AutofixConfig;
use crate::error::{AutofixError, ErrorCode};
use crate::issue::IssueGroup;
use crate::pipeline::{Pipeline, PipelineResult, PipelineStage, PipelineStatus, StageError};
use crate::tracker::IssueTracker;
use crate::vcs::Vcs;

/// Per-group processing function, normally the pipeline itself.
pub trait GroupProcessor: Send + Sync + 'static {
    fn process(
        &self,
        group: IssueGroup,
        attempt: u32,
    ) -> impl Future<Output = PipelineResult> + Send;
}

impl<V, A, C, T> GroupProcessor for Pipeline<V, A, C, T>
where
    V: Vcs + 'static,
    A: FixAgent + 'static,
    C: CheckRunner + 'static,
    T: IssueTracker + 'static,
{
    fn process(
        &self,
        group: IssueGroup,
        attempt: u32,
    ) -> impl Future<Output = PipelineResult> + Send {
        async move { self.process_group(&group, attempt).await }
    }
}

/// Adapter so plain closures can act as processors (used heavily in tests).
pub struct FnProcessor<F>(pub F);

impl<F, Fut> GroupProcessor for FnProcessor<F>
where
    F: Fn(IssueGroup, u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = PipelineResult> + Send + 'static,
{
    fn process(
        &self,
        group: IssueGroup,
        attempt: u32,
    ) -> impl Future<Output = PipelineResult> + Send {
        (self.0)(group, attempt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
struct QueueItem {
    group: IssueGroup,
    state: ItemState,
    attempts: u32,
    last_error: Option<String>,
    result: Option<PipelineResult>,
}

/// Derived view over the item states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Lifecycle events, emitted synchronously from the mutator. Handlers must
/// be fast and must not call back into the queue in ways that deadlock.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    ItemQueued {
        group: IssueGroup,
        timestamp: DateTime<Utc>,
    },
    ItemStarted {
        group: IssueGroup,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },
    ItemRetrying {
        group: IssueGroup,
        attempt: u32,
        delay_ms: u64,
        error: String,
        timestamp: DateTime<Utc>,
    },
    ItemCompleted {
        group: IssueGroup,
        result: Box<PipelineResult>,
        timestamp: DateTime<Utc>,
    },
    ItemFailed {
        group: IssueGroup,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl QueueEvent {
    pub fn group_id(&self) -> &str {
        match self {
            Self::ItemQueued { group, .. }
            | Self::ItemStarted { group, .. }
            | Self::ItemRetrying { group, .. }
            | Self::ItemCompleted { group, .. }
            | Self::ItemFailed { group, .. } => &group.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ItemQueued { .. } => "item_queued",
            Self::ItemStarted { .. } => "item_started",
            Self::ItemRetrying { .. } => "item_retrying",
            Self::ItemCompleted { .. } => "item_completed",
            Self::ItemFailed { .. } => "item_failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_concurrent: usize,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1_000),
            max_backoff: Duration::from_millis(30_000),
        }
    }
}

impl QueueSettings {
    pub fn from_config(cfg: &AutofixConfig) -> Self {
        Self {
            max_concurrent: cfg.queue.max_concurrent,
            max_attempts: cfg.queue.max_attempts,
            initial_backoff: Duration::from_millis(cfg.queue.initial_backoff_ms),
            max_backoff: Duration::from_millis(cfg.queue.max_backoff_ms),
        }
    }
}

enum WorkerMsg {
    Done { idx: usize, result: PipelineResult },
    RetryDue { idx: usize },
}

enum Disposition {
    Completed(Box<PipelineResult>),
    Failed(String),
    Retry {
        attempt: u32,
        delay: Duration,
        error: String,
    },
}

struct QueueState {
    items: Vec<QueueItem>,
    ready: VecDeque<usize>,
}

type EventHandler = Box<dyn Fn(&QueueEvent) + Send + Sync>;

/// The bounded concurrent driver.
pub struct ProcessQueue<P: GroupProcessor> {
    settings: QueueSettings,
    processor: Mutex<Option<Arc<P>>>,
    state: Mutex<QueueState>,
    handlers: Mutex<Vec<(u64, EventHandler)>>,
    next_handler_id: AtomicU64,
    paused: AtomicBool,
    stopping: AtomicBool,
    force_stopped: AtomicBool,
    active: AtomicBool,
    wake: Notify,
}

impl<P: GroupProcessor> ProcessQueue<P> {
    pub fn new(max_concurrent: usize, max_attempts: u32) -> Self {
        Self::with_settings(QueueSettings {
            max_concurrent,
            max_attempts,
            ..QueueSettings::default()
        })
    }

    pub fn with_settings(settings: QueueSettings) -> Self {
        Self {
            settings,
            processor: Mutex::new(None),
            state: Mutex::new(QueueState {
                items: Vec::new(),
                ready: VecDeque::new(),
            }),
            handlers: Mutex::new(Vec::new()),
            next_handler_id: AtomicU64::new(1),
            paused: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            force_stopped: AtomicBool::new(false),
            active: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// Supply the per-group processing function.
    pub fn set_processor(&self, processor: Arc<P>) {
        *self.processor.lock().expect("processor lock poisoned") = Some(processor);
    }

    /// Append groups to the pending set. Emits one `item_queued` per group.
    pub fn enqueue(&self, groups: Vec<IssueGroup>) {
        let queued: Vec<IssueGroup> = {
            let mut state = self.state.lock().expect("queue state lock poisoned");
            groups
                .into_iter()
                .map(|group| {
                    let idx = state.items.len();
                    state.items.push(QueueItem {
                        group: group.clone(),
                        state: ItemState::Pending,
                        attempts: 0,
                        last_error: None,
                        result: None,
                    });
                    state.ready.push_back(idx);
                    group
                })
                .collect()
        };
        for group in queued {
            debug!(group = %group.id, "item queued");
            self.emit(&QueueEvent::ItemQueued {
                group,
                timestamp: Utc::now(),
            });
        }
        self.wake.notify_one();
    }

    /// Subscribe to lifecycle events; returns a subscription id for
    /// [`off`](Self::off).
    pub fn on(&self, handler: impl Fn(&QueueEvent) + Send + Sync + 'static) -> u64 {
        let id = self.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.handlers
            .lock()
            .expect("handler list lock poisoned")
            .push((id, Box::new(handler)));
        id
    }

    pub fn off(&self, id: u64) {
        self.handlers
            .lock()
            .expect("handler list lock poisoned")
            .retain(|(hid, _)| *hid != id);
    }

    fn emit(&self, event: &QueueEvent) {
        let handlers = self.handlers.lock().expect("handler list lock poisoned");
        for (_, handler) in handlers.iter() {
            handler(event);
        }
    }

    pub fn get_stats(&self) -> QueueStats {
        let state = self.state.lock().expect("queue state lock poisoned");
        let mut stats = QueueStats {
            total: state.items.len(),
            pending: 0,
            processing: 0,
            completed: 0,
            failed: 0,
        };
        for item in &state.items {
            match item.state {
                ItemState::Pending => stats.pending += 1,
                ItemState::Processing => stats.processing += 1,
                ItemState::Completed => stats.completed += 1,
                ItemState::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Terminal results in enqueue order.
    pub fn get_results(&self) -> Vec<PipelineResult> {
        let state = self.state.lock().expect("queue state lock poisoned");
        state
            .items
            .iter()
            .filter(|i| matches!(i.state, ItemState::Completed | ItemState::Failed))
            .filter_map(|i| i.result.clone())
            .collect()
    }

    /// True when no item is pending or processing.
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock().expect("queue state lock poisoned");
        !state
            .items
            .iter()
            .any(|i| matches!(i.state, ItemState::Pending | ItemState::Processing))
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop dispatching after the in-flight items finish. Repeated calls
    /// have no further effect.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("queue paused");
        }
        self.wake.notify_one();
    }

    /// Resume dispatching from where pause left off.
    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("queue resumed");
        }
        self.wake.notify_one();
    }

    /// Graceful shutdown: in-flight items complete, nothing new dispatches,
    /// `start` resolves. Items waiting out a retry backoff are failed with
    /// their last error so every started item still reaches a terminal
    /// state.
    pub fn stop(&self) {
        if !self.stopping.swap(true, Ordering::SeqCst) {
            info!("queue stopping");
        }
        self.wake.notify_one();
    }

    /// Immediate shutdown: stop waiting for in-flight items. The processor
    /// is not interrupted mid-call; it must honor cooperative cancellation
    /// itself.
    pub fn force_stop(&self) {
        if !self.force_stopped.swap(true, Ordering::SeqCst) {
            warn!("queue force-stopped");
        }
        self.active.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Drive every enqueued item to a terminal state and return the results
    /// in enqueue order.
    pub async fn start(&self) -> Result<Vec<PipelineResult>, AutofixError> {
        let processor = self
            .processor
            .lock()
            .expect("processor lock poisoned")
            .clone()
            .ok_or_else(|| AutofixError::Queue("No processor function set".into()))?;
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(AutofixError::Queue("queue is already running".into()));
        }
        self.stopping.store(false, Ordering::SeqCst);
        self.force_stopped.store(false, Ordering::SeqCst);

        let (tx, mut rx) = mpsc::unbounded_channel::<WorkerMsg>();
        let mut in_flight: usize = 0;
        let mut pending_timers: usize = 0;

        loop {
            if self.force_stopped.load(Ordering::SeqCst) {
                break;
            }

            // Dispatch FIFO while a worker slot is free. Indices whose item
            // is no longer pending (e.g. failed during a graceful stop) are
            // skipped.
            while !self.paused.load(Ordering::SeqCst)
                && !self.stopping.load(Ordering::SeqCst)
                && in_flight < self.settings.max_concurrent
            {
                let dispatched = {
                    let mut state = self.state.lock().expect("queue state lock poisoned");
                    loop {
                        match state.ready.pop_front() {
                            Some(idx) if state.items[idx].state == ItemState::Pending => {
                                let item = &mut state.items[idx];
                                item.state = ItemState::Processing;
                                item.attempts += 1;
                                break Some((idx, item.group.clone(), item.attempts));
                            }
                            Some(_) => continue,
                            None => break None,
                        }
                    }
                };
                let Some((idx, group, attempt)) = dispatched else {
                    break;
                };
                in_flight += 1;
                self.emit(&QueueEvent::ItemStarted {
                    group: group.clone(),
                    attempt,
                    timestamp: Utc::now(),
                });
                self.spawn_worker(Arc::clone(&processor), idx, group, attempt, tx.clone());
            }

            let all_terminal = {
                let state = self.state.lock().expect("queue state lock poisoned");
                state
                    .items
                    .iter()
                    .all(|i| matches!(i.state, ItemState::Completed | ItemState::Failed))
            };
            if in_flight == 0 {
                if self.stopping.load(Ordering::SeqCst) {
                    // A retry scheduled before stop() would otherwise leave
                    // its item pending forever: the timer's message lands in
                    // a dropped channel. Fail it with its last error so the
                    // event stream terminates.
                    self.fail_retry_waiters();
                    break;
                }
                if all_terminal && pending_timers == 0 {
                    break;
                }
            }

            tokio::select! {
                _ = self.wake.notified() => {}
                msg = rx.recv() => {
                    match msg {
                        Some(WorkerMsg::Done { idx, result }) => {
                            in_flight -= 1;
                            self.settle(idx, result, &mut pending_timers, &tx);
                        }
                        Some(WorkerMsg::RetryDue { idx }) => {
                            pending_timers -= 1;
                            let mut state =
                                self.state.lock().expect("queue state lock poisoned");
                            state.ready.push_back(idx);
                        }
                        None => break,
                    }
                }
            }
        }

        self.active.store(false, Ordering::SeqCst);
        Ok(self.get_results())
    }

    fn spawn_worker(
        &self,
        processor: Arc<P>,
        idx: usize,
        group: IssueGroup,
        attempt: u32,
        tx: mpsc::UnboundedSender<WorkerMsg>,
    ) {
        tokio::spawn(async move {
            let fallback_group = group.clone();
            let outcome = std::panic::AssertUnwindSafe(async {
                processor.process(group, attempt).await
            })
            .catch_unwind()
            .await;

            let result = outcome.unwrap_or_else(|_| {
                PipelineResult::failure(
                    fallback_group,
                    attempt,
                    StageError::new(
                        PipelineStage::Init,
                        ErrorCode::PipelineFailed,
                        "processor panicked",
                    ),
                )
            });
            let _ = tx.send(WorkerMsg::Done { idx, result });
        });
    }

    /// Record a worker's result: terminal completion/failure, or a retry
    /// scheduled after the backoff delay.
    fn settle(
        &self,
        idx: usize,
        result: PipelineResult,
        pending_timers: &mut usize,
        tx: &mpsc::UnboundedSender<WorkerMsg>,
    ) {
        let (group, disposition) = {
            let mut state = self.state.lock().expect("queue state lock poisoned");
            let item = &mut state.items[idx];
            let group = item.group.clone();

            match result.status {
                PipelineStatus::Completed | PipelineStatus::Skipped => {
                    item.state = ItemState::Completed;
                    item.last_error = None;
                    item.result = Some(result.clone());
                    (group, Disposition::Completed(Box::new(result)))
                }
                PipelineStatus::Failed => {
                    let error = result
                        .error_summary
                        .clone()
                        .unwrap_or_else(|| "unknown failure".into());
                    let retryable = result
                        .error
                        .as_ref()
                        .map(StageError::is_retryable)
                        .unwrap_or(true);
                    let shutting_down = self.stopping.load(Ordering::SeqCst)
                        || self.force_stopped.load(Ordering::SeqCst);

                    if retryable && item.attempts < self.settings.max_attempts && !shutting_down {
                        item.state = ItemState::Pending;
                        item.last_error = Some(error.clone());
                        // Keep the failed result: a stop() racing the retry
                        // timer finalizes the item from it.
                        item.result = Some(result);
                        let attempt = item.attempts;
                        let delay = self.backoff_delay(attempt);
                        (
                            group,
                            Disposition::Retry {
                                attempt,
                                delay,
                                error,
                            },
                        )
                    } else {
                        item.state = ItemState::Failed;
                        item.last_error = Some(error.clone());
                        item.result = Some(result);
                        (group, Disposition::Failed(error))
                    }
                }
            }
        };

        match disposition {
            Disposition::Completed(result) => {
                debug!(group = %group.id, "item completed");
                self.emit(&QueueEvent::ItemCompleted {
                    group,
                    result,
                    timestamp: Utc::now(),
                });
            }
            Disposition::Failed(error) => {
                warn!(group = %group.id, %error, "item failed terminally");
                self.emit(&QueueEvent::ItemFailed {
                    group,
                    error,
                    timestamp: Utc::now(),
                });
            }
            Disposition::Retry {
                attempt,
                delay,
                error,
            } => {
                info!(
                    group = %group.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying item"
                );
                self.emit(&QueueEvent::ItemRetrying {
                    group,
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                    error,
                    timestamp: Utc::now(),
                });
                *pending_timers += 1;
                let tx = tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(WorkerMsg::RetryDue { idx });
                });
            }
        }
    }

    /// Terminally fail every item parked between attempts (retry timer or
    /// re-queued but undispatched) during a graceful stop, emitting
    /// `item_failed` so each started item's event stream ends properly.
    /// Never-started items stay pending.
    fn fail_retry_waiters(&self) {
        let failed: Vec<(IssueGroup, String)> = {
            let mut state = self.state.lock().expect("queue state lock poisoned");
            let mut failed = Vec::new();
            for item in state.items.iter_mut() {
                if item.state == ItemState::Pending && item.attempts > 0 {
                    item.state = ItemState::Failed;
                    let error = item
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "stopped before retry".into());
                    failed.push((item.group.clone(), error));
                }
            }
            failed
        };
        for (group, error) in failed {
            warn!(group = %group.id, %error, "stop before retry; failing item");
            self.emit(&QueueEvent::ItemFailed {
                group,
                error,
                timestamp: Utc::now(),
            });
        }
    }

    /// Exponential backoff for the wait after `attempt` attempts have
    /// failed: `initial × 2^(attempt-1)`, capped, with ±20% uniform jitter.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base_ms = (self.settings.initial_backoff.as_millis() as u64)
            .saturating_mul(1u64 << exp)
            .min(self.settings.max_backoff.as_millis() as u64);
        let span = base_ms / 5;
        let jitter = rand::thread_rng().gen_range(0..=2 * span) as i64 - span as i64;
        Duration::from_millis(base_ms.saturating_add_signed(jitter))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::issue::{Issue, IssueGroup, IssuePriority, IssueType};

    pub(crate) fn group(id: &str) -> IssueGroup {
        IssueGroup {
            id: id.to_string(),
            name: format!("group {id}"),
            grouping_key: "test".into(),
            branch: format!("fix/{id}-1"),
            issues: vec![Issue {
                number: 1,
                title: "a test issue".into(),
                body: String::new(),
                labels: vec![],
                issue_type: IssueType::Bug,
                priority: IssuePriority::Medium,
                assignees: vec![],
                related_files: vec![],
                related_issues: vec![],
                acceptance_criteria: vec![],
                source_url: None,
            }],
            components: vec![],
            priority: IssuePriority::Medium,
            related_files: vec![],
        }
    }
}
