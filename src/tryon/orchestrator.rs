use super::{JobStatus, ProviderStatus, TryOnProvider, TryOnSubmission};
use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::time::{Instant, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Terminal state of one submitted try-on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobRun {
    Completed {
        job_id: String,
        output_url: String,
        polls: u32,
    },
    Failed {
        job_id: Option<String>,
        error: String,
    },
    TimedOut {
        job_id: String,
        polls: u32,
    },
    /// Local polling stopped; the provider-side job keeps running.
    Cancelled {
        job_id: Option<String>,
    },
}

impl JobRun {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            JobRun::Completed { job_id, .. } | JobRun::TimedOut { job_id, .. } => Some(job_id),
            JobRun::Failed { job_id, .. } | JobRun::Cancelled { job_id } => job_id.as_deref(),
        }
    }
}

/// Provider-side job as observed while polling.
#[derive(Debug)]
struct TryOnJob {
    id: String,
    status: JobStatus,
    output: Option<String>,
    error: Option<String>,
    polls: u32,
}

impl TryOnJob {
    fn new(id: String) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            output: None,
            error: None,
            polls: 0,
        }
    }

    fn observe(&mut self, reported: ProviderStatus) {
        self.status = reported.status;
        self.output = reported.output.into_iter().find(|url| !url.trim().is_empty());
        self.error = reported.error;
    }

    fn terminal(&self) -> Option<JobRun> {
        match self.status {
            JobStatus::Pending => None,
            JobStatus::Completed => Some(match &self.output {
                Some(url) => JobRun::Completed {
                    job_id: self.id.clone(),
                    output_url: url.clone(),
                    polls: self.polls,
                },
                None => JobRun::Failed {
                    job_id: Some(self.id.clone()),
                    error: "completed without output".into(),
                },
            }),
            JobStatus::Failed => Some(JobRun::Failed {
                job_id: Some(self.id.clone()),
                error: self
                    .error
                    .clone()
                    .unwrap_or_else(|| "provider reported failure".into()),
            }),
        }
    }
}

/// Submits a job and polls it to a terminal state. Knows nothing about model
/// selection or metrics.
#[derive(Clone)]
pub struct Orchestrator {
    provider: Arc<dyn TryOnProvider>,
    poll_interval: Duration,
    max_polls: u32,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn TryOnProvider>, poll_interval: Duration, max_polls: u32) -> Self {
        Self {
            provider,
            poll_interval,
            max_polls: max_polls.max(1),
        }
    }

    /// Wall-clock ceiling for one run, submission included.
    pub fn polling_budget(&self) -> Duration {
        self.poll_interval * self.max_polls
    }

    pub async fn run(
        &self,
        garment_url: &str,
        model_url: &str,
        category: &str,
        cancel: &CancellationToken,
    ) -> JobRun {
        let deadline = Instant::now() + self.polling_budget();
        let submission = TryOnSubmission {
            model_image: model_url.to_string(),
            garment_image: garment_url.to_string(),
            category: category.to_string(),
        };

        let submitted = tokio::select! {
            biased;
            _ = cancel.cancelled() => return JobRun::Cancelled { job_id: None },
            result = timeout_at(deadline, self.provider.submit(&submission)) => result,
        };
        let mut job = match submitted {
            Ok(Ok(id)) => TryOnJob::new(id),
            Ok(Err(err)) => {
                warn!(target = "thrift.tryon", error = %err, "tryon_submission_failed");
                return JobRun::Failed {
                    job_id: None,
                    error: err.to_string(),
                };
            }
            Err(_) => {
                warn!(target = "thrift.tryon", "tryon_submission_timed_out");
                return JobRun::Failed {
                    job_id: None,
                    error: "submission timed out".into(),
                };
            }
        };
        info!(target = "thrift.tryon", job_id = %job.id, category = category, "tryon_submitted");

        while job.polls < self.max_polls {
            let wake = (Instant::now() + self.poll_interval).min(deadline);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return cancelled(&job),
                _ = sleep_until(wake) => {}
            }

            job.polls += 1;
            crate::metrics::poll_attempt(&job.id, job.polls);
            let reported = tokio::select! {
                biased;
                _ = cancel.cancelled() => return cancelled(&job),
                reported = timeout_at(deadline, self.provider.status(&job.id)) => reported,
            };
            match reported {
                Ok(Ok(reported)) => {
                    job.observe(reported);
                    if let Some(terminal) = job.terminal() {
                        if let JobRun::Failed { error, .. } = &terminal {
                            warn!(
                                target = "thrift.tryon",
                                job_id = %job.id,
                                error = %error,
                                "tryon_failed"
                            );
                        }
                        return terminal;
                    }
                }
                Ok(Err(err)) => {
                    warn!(
                        target = "thrift.tryon",
                        job_id = %job.id,
                        attempt = job.polls,
                        error = %err,
                        "tryon_poll_error"
                    );
                }
                // Deadline reached while the status call was in flight.
                Err(_) => break,
            }
        }

        warn!(
            target = "thrift.tryon",
            job_id = %job.id,
            polls = job.polls,
            budget_ms = self.polling_budget().as_millis() as u64,
            "tryon_timed_out"
        );
        JobRun::TimedOut {
            job_id: job.id,
            polls: job.polls,
        }
    }
}

fn cancelled(job: &TryOnJob) -> JobRun {
    info!(target = "thrift.tryon", job_id = %job.id, polls = job.polls, "tryon_cancelled");
    JobRun::Cancelled {
        job_id: Some(job.id.clone()),
    }
}
