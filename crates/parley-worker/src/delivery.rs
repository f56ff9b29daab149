//! The single consumer of the dispatch queue.
//!
//! Jobs are processed strictly one at a time. After every processed job,
//! successful or not, the worker pauses for a random interval before it
//! claims the next one.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use parley_core::{DispatchJob, MediaSource, OutboundContent, to_user_jid};
use parley_db::{FailureDisposition, QueuedJob};

use crate::config::DeliveryConfig;
use crate::error::{DeliveryError, Result};
use crate::events::WorkerEvent;
use crate::queue::DispatchQueue;
use crate::registry::SessionRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Sent,
    Failed {
        error: String,
        disposition: FailureDisposition,
    },
    Discarded {
        error: String,
    },
    /// Attempted, but the outcome could not be written.
    Unrecorded {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job_id: i64,
    pub tenant_id: String,
    pub outcome: JobOutcome,
}

pub struct DeliveryWorker {
    queue: DispatchQueue,
    registry: Arc<SessionRegistry>,
    config: DeliveryConfig,
    events: Option<mpsc::Sender<WorkerEvent>>,
}

impl DeliveryWorker {
    pub fn new(queue: DispatchQueue, registry: Arc<SessionRegistry>, config: DeliveryConfig) -> Self {
        Self {
            queue,
            registry,
            config,
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::Sender<WorkerEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Drain the queue until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        self.recover_expired().await;

        info!("Delivery worker started");
        while !*shutdown.borrow() {
            let pause = match self.run_once().await {
                Ok(Some(_)) => self.pacing_delay(),
                Ok(None) => self.config.idle_poll(),
                Err(e) => {
                    error!("Delivery worker error: {}", e);
                    self.config.idle_poll()
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Delivery worker stopped");
    }

    /// Claim and process one due job, without the pacing pause. When nothing
    /// is due, jobs whose lease ran out are handed back first.
    ///
    /// Once a job is claimed this always returns a report. If its outcome
    /// could not be stored the job keeps its lease until it expires.
    pub async fn run_once(&self) -> Result<Option<JobReport>> {
        let job = match self.queue.claim().await? {
            Some(job) => job,
            None if self.recover_expired().await > 0 => match self.queue.claim().await? {
                Some(job) => job,
                None => return Ok(None),
            },
            None => return Ok(None),
        };

        let outcome = match self.process(&job).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(job_id = job.id, tenant_id = %job.tenant_id, "Failed to record job outcome: {}", e);
                JobOutcome::Unrecorded {
                    error: e.to_string(),
                }
            }
        };

        Ok(Some(JobReport {
            job_id: job.id,
            tenant_id: job.tenant_id,
            outcome,
        }))
    }

    async fn process(&self, job: &QueuedJob) -> Result<JobOutcome> {
        let payload = match job.job() {
            Ok(payload) => payload,
            Err(e) => {
                let error = format!("unreadable job payload: {e}");
                error!(job_id = job.id, "{}", error);
                self.queue.discard(job, &error).await?;
                return Ok(JobOutcome::Discarded { error });
            }
        };

        match self.deliver(&payload).await {
            Ok(()) => {
                self.queue.complete(job, &payload).await?;
                info!(job_id = job.id, tenant_id = %job.tenant_id, "Message sent");
                self.emit(WorkerEvent::MessageSent {
                    tenant_id: job.tenant_id.clone(),
                    job_id: job.id,
                    recipient: payload.recipient.clone(),
                });
                Ok(JobOutcome::Sent)
            }
            Err(e) => self.record_failure(job, &payload, e).await,
        }
    }

    async fn recover_expired(&self) -> u64 {
        match self.queue.recover().await {
            Ok(0) => 0,
            Ok(n) => {
                info!(requeued = n, "Requeued jobs with expired leases");
                n
            }
            Err(e) => {
                error!("Failed to requeue expired jobs: {}", e);
                0
            }
        }
    }

    async fn record_failure(
        &self,
        job: &QueuedJob,
        payload: &DispatchJob,
        err: DeliveryError,
    ) -> Result<JobOutcome> {
        let error = err.to_string();
        let disposition = self
            .queue
            .fail(job, payload, &error, err.is_permanent())
            .await?;

        let will_retry = matches!(disposition, FailureDisposition::Retry { .. });
        warn!(
            job_id = job.id,
            tenant_id = %job.tenant_id,
            attempt = job.attempts + 1,
            will_retry,
            "Message failed: {}",
            error
        );
        self.emit(WorkerEvent::MessageFailed {
            tenant_id: job.tenant_id.clone(),
            job_id: job.id,
            error: error.clone(),
            will_retry,
        });

        Ok(JobOutcome::Failed { error, disposition })
    }

    async fn deliver(&self, payload: &DispatchJob) -> std::result::Result<(), DeliveryError> {
        let connection = self
            .registry
            .ready_connection(&payload.tenant_id)
            .await
            .ok_or(DeliveryError::SessionNotReady)?;

        let jid = to_user_jid(&payload.recipient)
            .ok_or_else(|| DeliveryError::InvalidRecipient(payload.recipient.clone()))?;

        let content = outbound_content(payload).await;
        debug!(tenant_id = %payload.tenant_id, jid, "Sending message");
        connection.send(&jid, &content).await?;
        Ok(())
    }

    fn pacing_delay(&self) -> Duration {
        let min = self.config.pacing_min_ms.min(self.config.pacing_max_ms);
        let max = self.config.pacing_max_ms.max(min);
        Duration::from_millis(rand::rng().random_range(min..=max))
    }

    fn emit(&self, event: WorkerEvent) {
        if let Some(events) = &self.events
            && events.try_send(event).is_err()
        {
            debug!("Worker event dropped");
        }
    }
}

/// A local file that exists wins over a URL; without either the job is plain text.
async fn outbound_content(job: &DispatchJob) -> OutboundContent {
    if let Some(path) = &job.file_path {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            return OutboundContent::Image {
                source: MediaSource::File { path: path.clone() },
                caption: job.text.clone(),
            };
        }
        warn!(path = %path.display(), "Media file missing, falling back");
    }

    if let Some(url) = &job.media_url {
        return OutboundContent::Image {
            source: MediaSource::Url { url: url.clone() },
            caption: job.text.clone(),
        };
    }

    OutboundContent::Text {
        text: job.text.clone(),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::service::SendRequest;
    use crate::testing::Fixture;
    use parley_core::JobStatus;

    fn job() -> DispatchJob {
        DispatchJob {
            tenant_id: "t1".into(),
            campaign_id: None,
            recipient: "15550001".into(),
            text: "hello".into(),
            media_url: None,
            file_path: None,
        }
    }

    #[tokio::test]
    async fn existing_file_wins_over_url() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let job = DispatchJob {
            media_url: Some("https://cdn.example/a.png".into()),
            file_path: Some(file.path().to_path_buf()),
            ..job()
        };

        assert_eq!(
            outbound_content(&job).await,
            OutboundContent::Image {
                source: MediaSource::File {
                    path: file.path().to_path_buf()
                },
                caption: "hello".into(),
            }
        );
    }

    #[tokio::test]
    async fn missing_file_falls_back_to_url_then_text() {
        let with_url = DispatchJob {
            media_url: Some("https://cdn.example/a.png".into()),
            file_path: Some(PathBuf::from("/nonexistent/a.png")),
            ..job()
        };
        assert!(matches!(
            outbound_content(&with_url).await,
            OutboundContent::Image {
                source: MediaSource::Url { .. },
                ..
            }
        ));

        let bare = DispatchJob {
            file_path: Some(PathBuf::from("/nonexistent/a.png")),
            ..job()
        };
        assert_eq!(
            outbound_content(&bare).await,
            OutboundContent::Text {
                text: "hello".into()
            }
        );
    }

    #[tokio::test]
    async fn expired_lease_is_recovered_without_a_restart() {
        let fx = Fixture::new(5).await;
        fx.connect("t1").await;
        let id = fx
            .service
            .enqueue_send(SendRequest {
                tenant_id: "t1".into(),
                recipient: "15550001".into(),
                text: "hello".into(),
                ..SendRequest::default()
            })
            .await
            .unwrap();

        // held by a worker that never recorded an outcome
        fx.db.claim_next_job(-1).await.unwrap().unwrap();

        let report = fx.worker.run_once().await.unwrap().unwrap();
        assert_eq!(report.job_id, id);
        assert_eq!(report.outcome, JobOutcome::Sent);
        assert_eq!(fx.connector.sent().len(), 1);

        let stored = fx.db.get_job(id).await.unwrap().unwrap();
        assert_eq!(stored.status().unwrap(), JobStatus::Completed);
        assert_eq!(fx.db.outstanding_jobs("t1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn live_lease_is_left_alone() {
        let fx = Fixture::new(5).await;
        fx.connect("t1").await;
        fx.service
            .enqueue_send(SendRequest {
                tenant_id: "t1".into(),
                recipient: "15550001".into(),
                text: "hello".into(),
                ..SendRequest::default()
            })
            .await
            .unwrap();
        fx.db.claim_next_job(60_000).await.unwrap().unwrap();

        assert!(fx.worker.run_once().await.unwrap().is_none());
        assert!(fx.connector.sent().is_empty());
    }
}
