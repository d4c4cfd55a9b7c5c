//! Message processor: decode, score, decide, republish, settle
//!
//! Every delivery ends in exactly one [`ProcessOutcome`]. Malformed payloads
//! and inference failures are acknowledged so they are not redelivered
//! forever; a missing resource and a failed republish are rejected for
//! requeue because both are expected to clear. A message is delivered at
//! most `max_deliveries` times; past that it is rejected to the dead-letter
//! queue instead of requeued.

use crate::queue::{Delivery, QueueClient, Subscription};
use futures::StreamExt;
use postguard_classifiers::ScoringHandle;
use postguard_core::{InboundMessage, OutboundMessage, ScoreError, ScoreResult};
use postguard_telemetry::PipelineMetrics;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub input_queue: String,
    pub output_queue: String,
    /// Flag when the score is strictly greater than this
    pub threshold: f32,
    /// Deliveries in flight at once
    pub max_concurrency: usize,
    /// Deliveries of one message before it is dead-lettered
    pub max_deliveries: u32,
}

/// Why a delivery was handed back to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueReason {
    NotLoaded,
    PublishFailed,
}

/// Terminal state of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Flagged and republished; acknowledged
    Published,
    /// Scored at or below the threshold; acknowledged
    NotFlagged,
    /// Undecodable or missing its identifier; acknowledged
    Malformed,
    /// The resource failed on this input; acknowledged
    InferenceFailed,
    /// Rejected for redelivery
    Requeued(RequeueReason),
    /// Delivery limit reached; rejected without requeue
    DeadLettered,
}

impl ProcessOutcome {
    /// Whether the delivery is acknowledged (as opposed to rejected)
    pub fn is_acknowledged(&self) -> bool {
        !matches!(self, Self::Requeued(_) | Self::DeadLettered)
    }
}

impl fmt::Display for ProcessOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Published => write!(f, "published"),
            Self::NotFlagged => write!(f, "not_flagged"),
            Self::Malformed => write!(f, "malformed"),
            Self::InferenceFailed => write!(f, "inference_failed"),
            Self::Requeued(RequeueReason::NotLoaded) => write!(f, "requeued:not_loaded"),
            Self::Requeued(RequeueReason::PublishFailed) => write!(f, "requeued:publish_failed"),
            Self::DeadLettered => write!(f, "dead_lettered"),
        }
    }
}

pub struct MessageProcessor {
    scoring: ScoringHandle,
    queue: Arc<dyn QueueClient>,
    settings: ProcessorSettings,
    metrics: PipelineMetrics,
}

impl MessageProcessor {
    /// A processor can only be built from a [`ScoringHandle`], which only a
    /// successful load produces.
    pub fn new(
        scoring: ScoringHandle,
        queue: Arc<dyn QueueClient>,
        settings: ProcessorSettings,
        metrics: PipelineMetrics,
    ) -> Self {
        Self {
            scoring,
            queue,
            settings,
            metrics,
        }
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    /// Process one delivery to completion and settle it
    pub async fn handle(&self, delivery: Delivery) -> ProcessOutcome {
        self.metrics.record_received();
        let tag = delivery.tag().to_string();

        // Prior deliveries plus this one
        let attempt = delivery.delivery_count().saturating_add(1);
        let outcome = if attempt > self.settings.max_deliveries {
            ProcessOutcome::DeadLettered
        } else {
            match self.evaluate(&delivery).await {
                ProcessOutcome::Requeued(_) if attempt >= self.settings.max_deliveries => {
                    ProcessOutcome::DeadLettered
                }
                outcome => outcome,
            }
        };
        if outcome == ProcessOutcome::DeadLettered {
            tracing::error!(
                delivery_tag = %tag,
                attempt,
                max_deliveries = self.settings.max_deliveries,
                "Delivery limit reached, dead-lettering"
            );
        }
        self.record(outcome);

        let settled = match outcome {
            ProcessOutcome::Requeued(_) => delivery.reject(true).await,
            ProcessOutcome::DeadLettered => delivery.reject(false).await,
            _ => delivery.ack().await,
        };
        if let Err(e) = settled {
            // The transport still owns the delivery and will redeliver it.
            tracing::warn!(delivery_tag = %tag, %outcome, error = %e, "Failed to settle delivery");
        }

        outcome
    }

    async fn evaluate(&self, delivery: &Delivery) -> ProcessOutcome {
        let message = match InboundMessage::decode(delivery.payload()) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    delivery_tag = %delivery.tag(),
                    error = %e,
                    "Dropping malformed message"
                );
                return ProcessOutcome::Malformed;
            }
        };

        let started = Instant::now();
        let score = match self.scoring.score(&message.content).await {
            Ok(score) => score,
            Err(ScoreError::NotLoaded) => {
                tracing::warn!(post_id = %message.post_id, "No scoring resource loaded, requeueing");
                return ProcessOutcome::Requeued(RequeueReason::NotLoaded);
            }
            Err(e) => {
                tracing::error!(post_id = %message.post_id, error = %e, "Scoring failed");
                return ProcessOutcome::InferenceFailed;
            }
        };
        self.metrics
            .record_score(score, started.elapsed().as_micros() as u64);

        let result = ScoreResult::new(message.post_id.clone(), score, self.settings.threshold);
        if !result.flagged {
            tracing::debug!(post_id = %result.post_id, score, "Below threshold");
            return ProcessOutcome::NotFlagged;
        }

        let outbound = OutboundMessage::from_scored(message, &result);
        let published = match outbound.encode() {
            Ok(payload) => self.queue.publish(&self.settings.output_queue, payload).await,
            Err(e) => Err(e),
        };

        match published {
            Ok(()) => {
                tracing::info!(
                    post_id = %result.post_id,
                    score,
                    queue = %self.settings.output_queue,
                    "Flagged post published"
                );
                ProcessOutcome::Published
            }
            Err(e) => {
                tracing::warn!(post_id = %result.post_id, error = %e, "Publish failed, requeueing");
                ProcessOutcome::Requeued(RequeueReason::PublishFailed)
            }
        }
    }

    fn record(&self, outcome: ProcessOutcome) {
        match outcome {
            ProcessOutcome::Published => self.metrics.record_published(),
            ProcessOutcome::NotFlagged => self.metrics.record_not_flagged(),
            ProcessOutcome::Malformed => self.metrics.record_malformed(),
            ProcessOutcome::InferenceFailed => self.metrics.record_inference_failed(),
            ProcessOutcome::Requeued(_) => self.metrics.record_requeued(),
            ProcessOutcome::DeadLettered => self.metrics.record_dead_lettered(),
        }
    }

    /// Consume `subscription` until `shutdown` fires or the stream ends, with
    /// at most `max_concurrency` deliveries in flight. Returns after every
    /// started delivery has been handled.
    ///
    /// A delivery is only pulled once a slot is free, so nothing is taken
    /// off the queue that cannot be worked on right away.
    pub async fn run(self: Arc<Self>, mut subscription: Subscription, shutdown: CancellationToken) {
        let slots = Arc::new(Semaphore::new(self.settings.max_concurrency.max(1)));
        let mut tasks = JoinSet::new();

        tracing::info!(
            queue = %self.settings.input_queue,
            max_concurrency = self.settings.max_concurrency,
            "Consumer started"
        );

        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    Self::reap(joined);
                    continue;
                }
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = subscription.next() => match next {
                    Some(delivery) => delivery,
                    None => {
                        tracing::info!(queue = %self.settings.input_queue, "Subscription ended");
                        break;
                    }
                },
            };

            let processor = Arc::clone(&self);
            tasks.spawn(async move {
                let _permit = permit;
                processor.handle(delivery).await
            });
        }

        // Stop intake before draining.
        drop(subscription);

        if !tasks.is_empty() {
            tracing::info!(in_flight = tasks.len(), "Draining in-flight deliveries");
        }
        while let Some(joined) = tasks.join_next().await {
            Self::reap(joined);
        }

        tracing::info!(queue = %self.settings.input_queue, "Consumer stopped");
    }

    fn reap(joined: Result<ProcessOutcome, JoinError>) {
        if let Err(e) = joined {
            if e.is_panic() {
                tracing::error!(error = %e, "Delivery task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_acknowledgment() {
        assert!(ProcessOutcome::Published.is_acknowledged());
        assert!(ProcessOutcome::NotFlagged.is_acknowledged());
        assert!(ProcessOutcome::Malformed.is_acknowledged());
        assert!(ProcessOutcome::InferenceFailed.is_acknowledged());
        assert!(!ProcessOutcome::Requeued(RequeueReason::NotLoaded).is_acknowledged());
        assert!(!ProcessOutcome::Requeued(RequeueReason::PublishFailed).is_acknowledged());
        assert!(!ProcessOutcome::DeadLettered.is_acknowledged());
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(ProcessOutcome::NotFlagged.to_string(), "not_flagged");
        assert_eq!(
            ProcessOutcome::Requeued(RequeueReason::PublishFailed).to_string(),
            "requeued:publish_failed"
        );
    }
}
