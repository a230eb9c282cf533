//! Backing-store write-back.
//!
//! Every write of an entity goes through one queue drained by a single tokio
//! task, so the backing store applies writes in submission order. Blocking
//! writes make one attempt and report the outcome to the caller. Detached
//! writes get bounded retry; a write that still fails is logged, counted and
//! handed to the failure hook.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use metrics::histogram;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use super::error::StoreError;
use super::metrics::{METRIC_WRITE_FAILED, METRIC_WRITE_MS, METRIC_WRITE_RETRY, count};
use crate::application::repos::{EntityRepo, RepoError};
use crate::domain::filter::Filter;
use crate::domain::value::Record;

const DEFAULT_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF: Duration = Duration::from_millis(50);

/// Retry budget of detached writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: NonZeroU32,
    /// Delay before the second attempt; grows linearly per attempt.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: NonZeroU32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    pub fn no_retry() -> Self {
        Self::new(NonZeroU32::MIN, Duration::ZERO)
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: NonZeroU32::new(DEFAULT_ATTEMPTS).unwrap_or(NonZeroU32::MIN),
            backoff: DEFAULT_BACKOFF,
        }
    }
}

/// Detached write that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFailure {
    pub entity: String,
    pub operation: &'static str,
    pub attempts: u32,
    pub error: String,
}

pub type FailureHook = Arc<dyn Fn(&WriteFailure) + Send + Sync>;

/// Handle to a backing-store write.
///
/// Dropping it never cancels a detached write.
pub struct PendingWrite {
    state: PendingState,
}

enum PendingState {
    Completed,
    Detached(oneshot::Receiver<Result<(), StoreError>>),
}

impl PendingWrite {
    pub(crate) fn completed() -> Self {
        Self {
            state: PendingState::Completed,
        }
    }

    fn detached(outcome: oneshot::Receiver<Result<(), StoreError>>) -> Self {
        Self {
            state: PendingState::Detached(outcome),
        }
    }

    pub fn is_detached(&self) -> bool {
        matches!(self.state, PendingState::Detached(_))
    }

    /// Wait for the write to settle, retries included.
    pub async fn wait(self) -> Result<(), StoreError> {
        match self.state {
            PendingState::Completed => Ok(()),
            PendingState::Detached(outcome) => outcome.await.map_err(|_| {
                StoreError::Detached("write-back worker stopped before the write settled".into())
            })?,
        }
    }
}

impl fmt::Debug for PendingWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingWrite")
            .field("detached", &self.is_detached())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum WriteOp {
    /// Upsert a full record.
    Save(Record),
    /// Overwrite `fields` on the stored row, leaving its other columns.
    Patch { filter: Filter, fields: Record },
    /// Load the row and remove it.
    Remove { filter: Filter },
}

impl WriteOp {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            WriteOp::Save(_) => "save",
            WriteOp::Patch { .. } => "patch",
            WriteOp::Remove { .. } => "remove",
        }
    }

    async fn apply(&self, repo: &dyn EntityRepo) -> Result<(), RepoError> {
        match self {
            WriteOp::Save(record) => repo.save(record).await.map(|_| ()),
            WriteOp::Patch { filter, fields } => repo.patch(filter, fields).await,
            WriteOp::Remove { filter } => {
                let row = repo.find_one_or_fail(filter).await?;
                repo.remove(&row).await
            }
        }
    }
}

fn is_transient(err: &RepoError) -> bool {
    matches!(err, RepoError::Persistence(_) | RepoError::Timeout)
}

struct Job {
    op: WriteOp,
    detached: bool,
    done: oneshot::Sender<Result<(), StoreError>>,
}

/// Applies writes against the repository of one entity.
#[derive(Clone)]
struct Writer {
    entity: String,
    repo: Arc<dyn EntityRepo>,
    policy: RetryPolicy,
    on_failure: Option<FailureHook>,
}

/// Write path of one entity.
#[derive(Clone)]
pub(crate) struct WriteBack {
    writer: Writer,
    queue: Arc<OnceLock<mpsc::UnboundedSender<Job>>>,
}

impl WriteBack {
    pub(crate) fn new(entity: &str, repo: Arc<dyn EntityRepo>, policy: RetryPolicy) -> Self {
        Self {
            writer: Writer {
                entity: entity.to_string(),
                repo,
                policy,
                on_failure: None,
            },
            queue: Arc::new(OnceLock::new()),
        }
    }

    /// Set before the first write; the worker keeps the hook it started with.
    pub(crate) fn set_failure_hook(&mut self, hook: FailureHook) {
        self.writer.on_failure = Some(hook);
    }

    pub(crate) fn policy(&self) -> RetryPolicy {
        self.writer.policy
    }

    /// Queue `op` behind every earlier write of this entity.
    ///
    /// With `blocking` the call returns once the write is applied.
    pub(crate) async fn submit(
        &self,
        op: WriteOp,
        blocking: bool,
    ) -> Result<PendingWrite, StoreError> {
        let (done, outcome) = oneshot::channel();
        let job = Job {
            op,
            detached: !blocking,
            done,
        };
        self.queue().send(job).map_err(|_| {
            StoreError::Detached(format!("write-back worker of `{}` has stopped", self.writer.entity))
        })?;

        let pending = PendingWrite::detached(outcome);
        if blocking {
            pending.wait().await?;
            return Ok(PendingWrite::completed());
        }
        Ok(pending)
    }

    /// The worker is spawned on first use, on the runtime of that caller.
    fn queue(&self) -> &mpsc::UnboundedSender<Job> {
        self.queue.get_or_init(|| {
            let (jobs, queued) = mpsc::unbounded_channel();
            tokio::spawn(self.writer.clone().drain(queued));
            jobs
        })
    }
}

impl Writer {
    async fn drain(self, mut queued: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = queued.recv().await {
            let result = if job.detached {
                self.run_detached(&job.op).await
            } else {
                self.run_once(&job.op).await
            };
            // The caller may have dropped its handle; the write still counts.
            let _ = job.done.send(result);
        }
        debug!(entity = %self.entity, "write-back worker stopped");
    }

    async fn attempt(&self, op: &WriteOp) -> Result<(), RepoError> {
        let started = Instant::now();
        let result = op.apply(self.repo.as_ref()).await;
        histogram!(METRIC_WRITE_MS, "entity" => self.entity.clone(), "op" => op.kind())
            .record(started.elapsed().as_secs_f64() * 1000.0);
        result
    }

    async fn run_once(&self, op: &WriteOp) -> Result<(), StoreError> {
        self.attempt(op)
            .await
            .map_err(|err| StoreError::repo(&self.entity, err, || op.kind().to_string()))
    }

    async fn run_detached(&self, op: &WriteOp) -> Result<(), StoreError> {
        let max_attempts = self.policy.max_attempts.get();
        let mut attempt = 1;
        loop {
            match self.attempt(op).await {
                Ok(()) => {
                    debug!(entity = %self.entity, op = op.kind(), attempt, "write-back applied");
                    return Ok(());
                }
                Err(err) if attempt < max_attempts && is_transient(&err) => {
                    warn!(
                        entity = %self.entity,
                        op = op.kind(),
                        attempt,
                        error = %err,
                        "write-back failed, retrying"
                    );
                    count(METRIC_WRITE_RETRY, &self.entity);
                    tokio::time::sleep(self.policy.delay_after(attempt)).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(
                        entity = %self.entity,
                        op = op.kind(),
                        attempts = attempt,
                        error = %err,
                        "write-back abandoned"
                    );
                    count(METRIC_WRITE_FAILED, &self.entity);
                    if let Some(hook) = &self.on_failure {
                        hook(&WriteFailure {
                            entity: self.entity.clone(),
                            operation: op.kind(),
                            attempts: attempt,
                            error: err.to_string(),
                        });
                    }
                    return Err(StoreError::repo(&self.entity, err, || op.kind().to_string()));
                }
            }
        }
    }
}
