//! Push notification dispatch.
//!
//! Fanout hands jobs to a bounded queue and returns immediately; a pool of
//! worker tasks drains it. Outbound requests are bounded by a semaphore
//! counted per delivery, so a burst of offline recipients (or one user with
//! many devices) cannot open unbounded connections. When the queue is full
//! the job is dropped with a warning: the unread counter already carries
//! the signal.

use futures_util::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};

use super::transport::{DeliveryOutcome, PushPayload, PushTransport};
use crate::config::PushConfig;
use crate::db::models::PushSubscription;
use crate::db::{self, run_blocking, DbPool};
use crate::error::{CoreError, CoreResult};

/// What happened to each of a user's subscriptions.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NotifyReport {
    pub attempted: usize,
    pub delivered: usize,
    pub transient_failures: usize,
    /// Subscription ids deleted after a permanent failure.
    pub removed: Vec<String>,
}

struct PushJob {
    user_id: String,
    payload: PushPayload,
}

/// Delivers one user's notification to each of their subscriptions.
struct Notifier {
    db: DbPool,
    transport: Arc<dyn PushTransport>,
    deliveries: Semaphore,
}

/// Queued plus running jobs, with a wakeup when the count reaches zero.
#[derive(Default)]
struct Backlog {
    jobs: AtomicUsize,
    idle: Notify,
}

impl Backlog {
    fn finish(&self) {
        if self.jobs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

pub struct NotificationDispatcher {
    notifier: Arc<Notifier>,
    queue: mpsc::Sender<PushJob>,
    backlog: Arc<Backlog>,
    enabled: bool,
}

impl NotificationDispatcher {
    /// Build the dispatcher and spawn its workers on the current runtime.
    /// Workers exit once the dispatcher is dropped and the queue drains.
    pub fn new(db: DbPool, transport: Arc<dyn PushTransport>, config: &PushConfig) -> Self {
        let max_in_flight = config.max_in_flight.max(1) as usize;
        let notifier = Arc::new(Notifier {
            db,
            transport,
            deliveries: Semaphore::new(max_in_flight),
        });
        let backlog = Arc::new(Backlog::default());
        let (queue, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        if config.enabled {
            for _ in 0..max_in_flight {
                tokio::spawn(run_worker(rx.clone(), notifier.clone(), backlog.clone()));
            }
        }

        Self {
            notifier,
            queue,
            backlog,
            enabled: config.enabled,
        }
    }

    /// Deliver `payload` to every subscription of `user_id`. Each
    /// subscription is attempted independently; one failure never stops
    /// the others. Permanently failed subscriptions are deleted.
    pub async fn notify(&self, user_id: &str, payload: &PushPayload) -> CoreResult<NotifyReport> {
        self.notifier.notify(user_id, payload).await
    }

    /// Queue a notification job without waiting. Returns false if push is
    /// disabled or the queue is full.
    pub fn dispatch(&self, user_id: String, payload: PushPayload) -> bool {
        if !self.enabled {
            return false;
        }

        self.backlog.jobs.fetch_add(1, Ordering::AcqRel);
        match self.queue.try_send(PushJob { user_id, payload }) {
            Ok(()) => true,
            Err(err) => {
                self.backlog.finish();
                let (job, reason) = match err {
                    mpsc::error::TrySendError::Full(job) => (job, "queue full"),
                    mpsc::error::TrySendError::Closed(job) => (job, "workers gone"),
                };
                tracing::warn!(
                    user_id = %job.user_id,
                    message_id = %job.payload.message_id,
                    reason,
                    "Dropping push notification"
                );
                false
            }
        }
    }

    /// Wait until every queued job has finished.
    pub async fn wait_idle(&self) {
        loop {
            // Registered before the check so a wakeup in between is not lost.
            let idle = self.backlog.idle.notified();
            if self.backlog.jobs.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }
}

async fn run_worker(
    rx: Arc<Mutex<mpsc::Receiver<PushJob>>>,
    notifier: Arc<Notifier>,
    backlog: Arc<Backlog>,
) {
    loop {
        // Only one idle worker waits on the queue at a time.
        let job = rx.lock().await.recv().await;
        let Some(PushJob { user_id, payload }) = job else {
            break;
        };

        match notifier.notify(&user_id, &payload).await {
            Ok(report) => tracing::debug!(
                user_id = %user_id,
                message_id = %payload.message_id,
                attempted = report.attempted,
                delivered = report.delivered,
                removed = report.removed.len(),
                "Push dispatch finished"
            ),
            Err(e) => tracing::warn!(
                user_id = %user_id,
                message_id = %payload.message_id,
                error = %e,
                "Push dispatch failed"
            ),
        }
        backlog.finish();
    }
}

impl Notifier {
    async fn notify(&self, user_id: &str, payload: &PushPayload) -> CoreResult<NotifyReport> {
        let uid = user_id.to_string();
        let subscriptions =
            run_blocking(&self.db, move |conn| db::subscriptions::list_for_user(conn, &uid)).await?;

        let mut report = NotifyReport {
            attempted: subscriptions.len(),
            ..NotifyReport::default()
        };
        if subscriptions.is_empty() {
            return Ok(report);
        }

        let outcomes = join_all(
            subscriptions
                .iter()
                .map(|subscription| self.deliver(subscription, payload)),
        )
        .await;

        for (subscription, outcome) in subscriptions.into_iter().zip(outcomes) {
            match outcome {
                DeliveryOutcome::Delivered => report.delivered += 1,
                DeliveryOutcome::TransientFailure(reason) => {
                    report.transient_failures += 1;
                    tracing::warn!(
                        user_id = %user_id,
                        subscription_id = %subscription.id,
                        error = %CoreError::TransientDeliveryFailure(reason),
                        "Push delivery failed, keeping subscription"
                    );
                }
                DeliveryOutcome::PermanentFailure(reason) => {
                    let sid = subscription.id.clone();
                    match run_blocking(&self.db, move |conn| {
                        db::subscriptions::delete_subscription(conn, &sid)
                    })
                    .await
                    {
                        Ok(_) => {
                            tracing::info!(
                                user_id = %user_id,
                                subscription_id = %subscription.id,
                                error = %CoreError::PermanentDeliveryFailure(reason),
                                "Removed dead push subscription"
                            );
                            report.removed.push(subscription.id);
                        }
                        Err(e) => {
                            tracing::warn!(
                                subscription_id = %subscription.id,
                                error = %e,
                                "Failed to remove dead push subscription"
                            );
                        }
                    }
                }
            }
        }

        Ok(report)
    }

    /// One request, holding a delivery permit for its duration.
    async fn deliver(&self, subscription: &PushSubscription, payload: &PushPayload) -> DeliveryOutcome {
        let Ok(_permit) = self.deliveries.acquire().await else {
            return DeliveryOutcome::TransientFailure("dispatcher shut down".to_string());
        };
        self.transport.deliver(subscription, payload).await
    }
}
