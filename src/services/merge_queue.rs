use crate::services::merge_service::MergeService;
use crate::services::proctoring_service::ProctoringService;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Retry budget per job; with the initial attempt a job runs at most
/// 1 + MAX_RETRIES times.
pub const MAX_RETRIES: u32 = 3;
/// Fixed spacing between attempts of one job. Exponential growth belongs
/// to the client's upload retries, not here.
pub const RETRY_DELAY: Duration = Duration::from_secs(60);
/// Pause between jobs to bound ffmpeg/disk contention.
pub const INTER_JOB_DELAY: Duration = Duration::from_secs(2);
const DB_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct MergeJob {
    pub attempt_id: Uuid,
    pub retries: u32,
    pub enqueued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug)]
pub enum TakeResult {
    Empty,
    /// Head job is still backing off; nothing may overtake it.
    Backoff(Duration),
    Ready(MergeJob),
}

#[derive(Debug, PartialEq, Eq)]
pub enum FailureDisposition {
    Requeued { retries: u32 },
    Exhausted,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStats {
    pub attempt_id: Uuid,
    pub retries: u32,
    pub enqueued_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl From<&MergeJob> for JobStats {
    fn from(job: &MergeJob) -> Self {
        Self {
            attempt_id: job.attempt_id,
            retries: job.retries,
            enqueued_at: job.enqueued_at,
            last_attempt_at: job.last_attempt_at,
            last_error: job.last_error.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub depth: usize,
    pub in_flight: usize,
    pub jobs: Vec<JobStats>,
    /// The job currently held by the worker, if any.
    pub running: Vec<JobStats>,
}

struct QueueInner {
    queue: VecDeque<MergeJob>,
    in_flight: HashMap<Uuid, MergeJob>,
}

/// In-process, at-least-once merge queue: strict FIFO, one logical
/// worker, bounded retries with fixed backoff. Constructed once at
/// process start and shared through `AppState`.
pub struct MergeQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl Default for MergeQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MergeQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                queue: VecDeque::new(),
                in_flight: HashMap::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Idempotent: an attempt that is already queued or running is not
    /// enqueued again. Returns whether a new job was added.
    pub fn enqueue(&self, attempt_id: Uuid) -> bool {
        let added = {
            let mut inner = self.inner.lock().unwrap();
            if inner.in_flight.contains_key(&attempt_id)
                || inner.queue.iter().any(|j| j.attempt_id == attempt_id)
            {
                false
            } else {
                inner.queue.push_back(MergeJob {
                    attempt_id,
                    retries: 0,
                    enqueued_at: Utc::now(),
                    last_attempt_at: None,
                    last_error: None,
                });
                true
            }
        };
        if added {
            info!(attempt_id = %attempt_id, "Merge job enqueued");
            self.notify.notify_one();
        }
        added
    }

    /// Inspect the head of the queue. A head within its backoff window
    /// pauses the whole queue rather than being reordered past.
    pub fn try_take(&self) -> TakeResult {
        let mut inner = self.inner.lock().unwrap();
        let Some(head) = inner.queue.front() else {
            return TakeResult::Empty;
        };
        if let Some(last) = head.last_attempt_at {
            let elapsed = Utc::now()
                .signed_duration_since(last)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if elapsed < RETRY_DELAY {
                return TakeResult::Backoff(RETRY_DELAY - elapsed);
            }
        }
        let mut job = inner.queue.pop_front().unwrap();
        job.last_attempt_at = Some(Utc::now());
        inner.in_flight.insert(job.attempt_id, job.clone());
        TakeResult::Ready(job)
    }

    /// Block until a job is ready, sleeping through empty queues and
    /// head backoff windows.
    pub async fn next_job(&self) -> MergeJob {
        loop {
            match self.try_take() {
                TakeResult::Ready(job) => return job,
                TakeResult::Empty => self.notify.notified().await,
                TakeResult::Backoff(remaining) => tokio::time::sleep(remaining).await,
            }
        }
    }

    pub fn complete_success(&self, attempt_id: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_flight.remove(&attempt_id);
    }

    /// Record a failed attempt and either requeue at the tail or give
    /// up. The in-flight marker is cleared under the same lock so no
    /// duplicate enqueue can slip in between.
    pub fn complete_failure(&self, mut job: MergeJob, error: &str) -> FailureDisposition {
        let mut inner = self.inner.lock().unwrap();
        inner.in_flight.remove(&job.attempt_id);
        job.retries += 1;
        job.last_attempt_at = Some(Utc::now());
        job.last_error = Some(error.to_string());
        if job.retries <= MAX_RETRIES {
            let retries = job.retries;
            inner.queue.push_back(job);
            FailureDisposition::Requeued { retries }
        } else {
            FailureDisposition::Exhausted
        }
    }

    /// Read-only operational snapshot; never mutates queue state. Both
    /// the queued jobs and the one the worker currently holds are
    /// visible with their retry and error state.
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().unwrap();
        QueueStats {
            depth: inner.queue.len(),
            in_flight: inner.in_flight.len(),
            jobs: inner.queue.iter().map(JobStats::from).collect(),
            running: inner.in_flight.values().map(JobStats::from).collect(),
        }
    }
}

/// Single worker loop. Job failures are contained here; nothing a merge
/// does can take the loop down.
pub async fn run_worker(
    queue: Arc<MergeQueue>,
    pool: PgPool,
    merge: MergeService,
    proctoring: ProctoringService,
) {
    info!("Merge queue worker started");
    loop {
        let job = queue.next_job().await;
        // The readiness check sits between taking a job and running it:
        // a job that arrives during an outage waits here instead of
        // burning a retry on an unreachable database.
        wait_for_database(&pool).await;

        let attempt_id = job.attempt_id;
        info!(attempt_id = %attempt_id, retries = job.retries, "Merge job running");

        match merge.merge_attempt(attempt_id).await {
            Ok(()) => {
                info!(attempt_id = %attempt_id, "Merge job succeeded");
                queue.complete_success(attempt_id);
            }
            Err(e) => {
                let message = e.to_string();
                match queue.complete_failure(job, &message) {
                    FailureDisposition::Requeued { retries } => {
                        warn!(
                            attempt_id = %attempt_id,
                            retries,
                            error = %message,
                            "Merge job failed, requeued"
                        );
                    }
                    FailureDisposition::Exhausted => {
                        error!(
                            attempt_id = %attempt_id,
                            error = %message,
                            "Merge job failed permanently, retry budget exhausted"
                        );
                        if let Err(mark_err) =
                            proctoring.mark_merge_failed(attempt_id, &message).await
                        {
                            error!(
                                attempt_id = %attempt_id,
                                error = ?mark_err,
                                "Failed to record terminal merge failure"
                            );
                        }
                    }
                }
            }
        }

        tokio::time::sleep(INTER_JOB_DELAY).await;
    }
}

async fn wait_for_database(pool: &PgPool) {
    loop {
        match sqlx::query("SELECT 1").execute(pool).await {
            Ok(_) => return,
            Err(e) => {
                warn!(error = ?e, "Database unreachable, merge worker backing off");
                tokio::time::sleep(DB_RETRY_DELAY).await;
            }
        }
    }
}
