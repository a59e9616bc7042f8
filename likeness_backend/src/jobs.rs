//! Deferred and background work: scene images, presence returns, follow-ups.
//!
//! Delivery is at-least-once. Handlers must tolerate stale or repeated jobs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::JobsConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    GenerateSceneImage {
        conversation_id: String,
        scene_version: u64,
    },
    PresenceReturn {
        conversation_id: String,
        return_at: DateTime<Utc>,
    },
    FollowUp {
        conversation_id: String,
        activity_version: u64,
        hint: Option<String>,
    },
}

impl Job {
    pub fn conversation_id(&self) -> &str {
        match self {
            Job::GenerateSceneImage { conversation_id, .. }
            | Job::PresenceReturn { conversation_id, .. }
            | Job::FollowUp { conversation_id, .. } => conversation_id,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Job::GenerateSceneImage { .. } => "scene_image",
            Job::PresenceReturn { .. } => "presence_return",
            Job::FollowUp { .. } => "follow_up",
        }
    }
}

pub trait JobScheduler: Send + Sync {
    fn schedule_after(&self, delay: Duration, job: Job) -> Result<()>;

    fn enqueue_now(&self, job: Job) -> Result<()> {
        self.schedule_after(Duration::ZERO, job)
    }
}

/// Executes jobs. An `Err` asks for a retry.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<()>;
}

struct Envelope {
    job: Job,
    attempt: u32,
}

/// In-process scheduler: delayed jobs sleep on tokio timers, due jobs go
/// through a flume queue to a worker that runs each one in its own task.
pub struct TokioJobScheduler {
    tx: flume::Sender<Envelope>,
    rx: flume::Receiver<Envelope>,
    config: JobsConfig,
    cancel: CancellationToken,
}

impl TokioJobScheduler {
    pub fn new(config: JobsConfig) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            tx,
            rx,
            config,
            cancel: CancellationToken::new(),
        }
    }

    fn submit(
        tx: flume::Sender<Envelope>,
        cancel: CancellationToken,
        delay: Duration,
        envelope: Envelope,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            anyhow::bail!("Job scheduler is shut down");
        }
        if delay.is_zero() {
            return tx
                .send(envelope)
                .map_err(|_| anyhow::anyhow!("Job queue closed"));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .context("Delayed jobs need a tokio runtime")?;
        runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Dropping delayed {} job on shutdown", envelope.job.label());
                }
                _ = tokio::time::sleep(delay) => {
                    if tx.send_async(envelope).await.is_err() {
                        tracing::warn!("Job queue closed before delayed job was due");
                    }
                }
            }
        });
        Ok(())
    }

    /// Start the worker loop.
    pub fn start(&self, handler: Arc<dyn JobHandler>) -> JoinHandle<()> {
        let rx = self.rx.clone();
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        let max_attempts = self.config.max_attempts.max(1);
        let backoff = Duration::from_secs(self.config.backoff_secs);

        tokio::spawn(async move {
            tracing::info!("Job worker started");
            loop {
                let envelope = tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv_async() => match received {
                        Ok(envelope) => envelope,
                        Err(_) => break,
                    },
                };

                let handler = handler.clone();
                let tx = tx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let Envelope { job, attempt } = envelope;
                    match handler.handle(&job).await {
                        Ok(()) => {
                            tracing::debug!(
                                "{} job for {} done (attempt {})",
                                job.label(),
                                job.conversation_id(),
                                attempt
                            );
                        }
                        Err(e) if attempt < max_attempts => {
                            let delay = backoff * attempt;
                            tracing::warn!(
                                "{} job for {} failed (attempt {}/{}), retrying in {:?}: {:#}",
                                job.label(),
                                job.conversation_id(),
                                attempt,
                                max_attempts,
                                delay,
                                e
                            );
                            let retry = Envelope {
                                job,
                                attempt: attempt + 1,
                            };
                            if let Err(e) = Self::submit(tx, cancel, delay, retry) {
                                tracing::warn!("Could not reschedule job: {}", e);
                            }
                        }
                        Err(e) => {
                            tracing::error!(
                                "{} job for {} gave up after {} attempts: {:#}",
                                job.label(),
                                job.conversation_id(),
                                attempt,
                                e
                            );
                        }
                    }
                });
            }
            tracing::info!("Job worker stopped");
        })
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl JobScheduler for TokioJobScheduler {
    fn schedule_after(&self, delay: Duration, job: Job) -> Result<()> {
        tracing::debug!(
            "Scheduling {} job for {} in {:?}",
            job.label(),
            job.conversation_id(),
            delay
        );
        Self::submit(
            self.tx.clone(),
            self.cancel.clone(),
            delay,
            Envelope { job, attempt: 1 },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyHandler {
        failures_left: AtomicU32,
        done: flume::Sender<Job>,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl JobHandler for FlakyHandler {
        async fn handle(&self, job: &Job) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("not yet");
            }
            let _ = self.done.send(job.clone());
            Ok(())
        }
    }

    fn image_job(version: u64) -> Job {
        Job::GenerateSceneImage {
            conversation_id: "c1".to_string(),
            scene_version: version,
        }
    }

    #[tokio::test]
    async fn failed_jobs_are_retried() {
        let scheduler = TokioJobScheduler::new(JobsConfig {
            max_attempts: 3,
            backoff_secs: 0,
        });
        let (done_tx, done_rx) = flume::unbounded();
        let handler = Arc::new(FlakyHandler {
            failures_left: AtomicU32::new(2),
            done: done_tx,
            attempts: AtomicU32::new(0),
        });
        let worker = scheduler.start(handler.clone());

        scheduler.enqueue_now(image_job(1)).expect("enqueue");
        let job = tokio::time::timeout(Duration::from_secs(5), done_rx.recv_async())
            .await
            .expect("job finished in time")
            .expect("job delivered");
        assert_eq!(job, image_job(1));
        assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);

        scheduler.shutdown();
        worker.await.expect("worker stops");
        assert!(scheduler.enqueue_now(image_job(2)).is_err());
    }

    #[tokio::test]
    async fn delayed_jobs_arrive_after_delay() {
        let scheduler = TokioJobScheduler::new(JobsConfig::default());
        let (done_tx, done_rx) = flume::unbounded();
        let handler = Arc::new(FlakyHandler {
            failures_left: AtomicU32::new(0),
            done: done_tx,
            attempts: AtomicU32::new(0),
        });
        scheduler.start(handler);

        let started = std::time::Instant::now();
        scheduler
            .schedule_after(Duration::from_millis(50), image_job(7))
            .expect("schedule");
        let job = tokio::time::timeout(Duration::from_secs(5), done_rx.recv_async())
            .await
            .expect("job finished in time")
            .expect("job delivered");
        assert_eq!(job, image_job(7));
        assert!(started.elapsed() >= Duration::from_millis(50));
        scheduler.shutdown();
    }

    #[test]
    fn jobs_serialize_with_kind_tag() {
        let json = serde_json::to_value(image_job(3)).expect("encode");
        assert_eq!(json["kind"], "generate_scene_image");
        assert_eq!(json["scene_version"], 3);
    }
}
