use crate::{
    config::JobRetention,
    models::{ApiError, TryOnRequest, TryOnResponse},
    pipeline::TryOnPipeline,
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    jobs: Arc<Mutex<HashMap<Uuid, Tracked>>>,
    retention: JobRetention,
    shutdown: CancellationToken,
}

struct Job {
    id: Uuid,
    request: TryOnRequest,
    cancel: CancellationToken,
}

struct Tracked {
    state: JobState,
    cancel: CancellationToken,
    finished_at: Option<Instant>,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed {
        result: TryOnResponse,
    },
    Failed {
        error: String,
        stage: Option<String>,
    },
    Cancelled,
}

impl JobState {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed { .. } | JobState::Failed { .. } | JobState::Cancelled
        )
    }
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

impl JobQueue {
    /// Starts the dispatcher. Each dequeued job runs on its own task so a
    /// slow provider never blocks the jobs behind it. Finished jobs are
    /// dropped once older than `retention.ttl` or beyond
    /// `retention.max_finished`.
    pub fn spawn(
        pipeline: TryOnPipeline,
        capacity: usize,
        retention: JobRetention,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        let jobs: Arc<Mutex<HashMap<Uuid, Tracked>>> = Arc::new(Mutex::new(HashMap::new()));
        let jobs_bg = jobs.clone();
        let stop = shutdown.clone();
        let sweep_every =
            (retention.ttl / 2).clamp(Duration::from_secs(1), Duration::from_secs(60));

        let handle = tokio::spawn(async move {
            let mut sweep = tokio::time::interval(sweep_every);
            loop {
                let job = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                    _ = sweep.tick() => {
                        prune(&mut *jobs_bg.lock().await, retention, Instant::now());
                        continue;
                    }
                };
                if !transition(&jobs_bg, job.id, JobState::Running, retention).await {
                    continue;
                }

                let pipeline = pipeline.clone();
                let jobs = jobs_bg.clone();
                tokio::spawn(async move {
                    let state = match pipeline.run(job.request, &job.cancel).await {
                        Ok(result) => JobState::Completed { result },
                        Err(err) => JobState::Failed {
                            error: err.detail().to_string(),
                            stage: Some(err.stage().to_string()),
                        },
                    };
                    transition(&jobs, job.id, state, retention).await;
                });
            }
            info!(target = "thrift.jobs", "job dispatcher stopped");
        });

        (
            Self {
                tx,
                jobs,
                retention,
                shutdown,
            },
            handle,
        )
    }

    pub async fn enqueue(&self, request: TryOnRequest) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        let cancel = self.shutdown.child_token();
        self.jobs.lock().await.insert(
            id,
            Tracked {
                state: JobState::Queued,
                cancel: cancel.clone(),
                finished_at: None,
            },
        );
        let job = Job {
            id,
            request,
            cancel,
        };
        if self.tx.send(job).await.is_err() {
            self.jobs.lock().await.remove(&id);
            return Err(ApiError {
                error: "queue_send_failed".into(),
                detail: Some("worker not available".into()),
            });
        }
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.jobs.lock().await;
        guard.get(&id).map(|tracked| JobInfo {
            id: id.to_string(),
            state: tracked.state.clone(),
        })
    }

    /// Stops local polling for a queued or running job. Finished jobs keep
    /// their result. Returns `None` for unknown ids.
    pub async fn cancel(&self, id: Uuid) -> Option<JobInfo> {
        let mut guard = self.jobs.lock().await;
        let tracked = guard.get_mut(&id)?;
        if !tracked.state.is_terminal() {
            tracked.cancel.cancel();
            tracked.state = JobState::Cancelled;
            tracked.finished_at = Some(Instant::now());
            info!(target = "thrift.jobs", job_id = %id, "job_cancelled");
        }
        let info = JobInfo {
            id: id.to_string(),
            state: tracked.state.clone(),
        };
        prune(&mut guard, self.retention, Instant::now());
        Some(info)
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

/// Applies a state change unless the job already reached a terminal state.
async fn transition(
    jobs: &Mutex<HashMap<Uuid, Tracked>>,
    id: Uuid,
    next: JobState,
    retention: JobRetention,
) -> bool {
    let mut guard = jobs.lock().await;
    let Some(tracked) = guard.get_mut(&id) else {
        warn!(target = "thrift.jobs", job_id = %id, "job_missing");
        return false;
    };
    if tracked.state.is_terminal() {
        return false;
    }
    let finished = next.is_terminal();
    tracked.state = next;
    if finished {
        let now = Instant::now();
        tracked.finished_at = Some(now);
        prune(&mut guard, retention, now);
    }
    true
}

/// Drops finished jobs past their TTL, then the oldest finished ones beyond
/// the cap. Queued and running jobs are never dropped.
fn prune(jobs: &mut HashMap<Uuid, Tracked>, retention: JobRetention, now: Instant) {
    let before = jobs.len();
    jobs.retain(|_, tracked| match tracked.finished_at {
        Some(at) => now.saturating_duration_since(at) < retention.ttl,
        None => true,
    });

    let mut finished: Vec<(Instant, Uuid)> = jobs
        .iter()
        .filter_map(|(id, tracked)| tracked.finished_at.map(|at| (at, *id)))
        .collect();
    if finished.len() > retention.max_finished {
        finished.sort_unstable();
        let excess = finished.len() - retention.max_finished;
        for (_, id) in finished.into_iter().take(excess) {
            jobs.remove(&id);
        }
    }

    let dropped = before - jobs.len();
    if dropped > 0 {
        debug!(target = "thrift.jobs", dropped, remaining = jobs.len(), "finished_jobs_pruned");
    }
}
