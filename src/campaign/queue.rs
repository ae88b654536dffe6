//! Per-campaign dispatch queue.
//!
//! Each campaign has at most one consumer task at a time. The consumer runs
//! batches until the outbox is drained, the campaign becomes terminal, or a
//! batch keeps failing past the retry budget. Enqueueing a campaign that is
//! already being consumed only marks it for another pass.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::campaign::dispatcher::{BatchOutcome, CampaignDispatcher};
use crate::config::CampaignSection;
use crate::db::DbHandle;
use crate::errors::CampaignError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub continue_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &CampaignSection) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.retry_backoff_ms),
            continue_delay: Duration::from_millis(config.continue_delay_ms),
        }
    }

    /// Exponential backoff after the `attempt`-th failure (1-based).
    fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff * 2u32.saturating_pow(attempt.saturating_sub(1).min(10))
    }
}

#[derive(Clone)]
pub struct CampaignQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    dispatcher: CampaignDispatcher,
    db: DbHandle,
    policy: RetryPolicy,
    /// Campaigns with a live consumer; the flag asks for one more pass.
    active: Mutex<HashMap<i64, bool>>,
}

impl CampaignQueue {
    pub fn new(dispatcher: CampaignDispatcher, db: DbHandle, policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                dispatcher,
                db,
                policy,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Schedule dispatch for `campaign_id`. Returns true if a new consumer
    /// was started, false if one was already running.
    pub fn enqueue(&self, campaign_id: i64) -> bool {
        {
            let mut active = self.inner.lock_active();
            if let Some(again) = active.get_mut(&campaign_id) {
                *again = true;
                debug!(campaign_id, "Campaign already being dispatched");
                return false;
            }
            active.insert(campaign_id, false);
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let slot = ActiveSlot {
                inner: inner.clone(),
                campaign_id,
                armed: true,
            };
            inner.consume(campaign_id).await;
            slot.disarm();
        });
        true
    }

    pub fn is_active(&self, campaign_id: i64) -> bool {
        self.inner.lock_active().contains_key(&campaign_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock_active().len()
    }

    /// Enqueue every campaign left QUEUED or SENDING, e.g. after a restart.
    pub async fn resume_unfinished(&self) -> anyhow::Result<usize> {
        let ids = self.inner.db.call(|db| db.unfinished_campaign_ids()).await?;
        for id in &ids {
            self.enqueue(*id);
        }
        if !ids.is_empty() {
            info!(count = ids.len(), "Resumed unfinished campaigns");
        }
        Ok(ids.len())
    }
}

impl QueueInner {
    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<i64, bool>> {
        // The map holds plain flags, so a poisoned lock is still consistent.
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn consume(&self, campaign_id: i64) {
        loop {
            let more = match self.run_batch(campaign_id).await {
                Some(outcome) => outcome.has_more(),
                None => false,
            };
            if more {
                if !self.policy.continue_delay.is_zero() {
                    tokio::time::sleep(self.policy.continue_delay).await;
                }
                continue;
            }

            // Done, unless someone asked for another pass meanwhile. The
            // slot is released under the same lock that enqueue checks.
            let finished = {
                let mut active = self.lock_active();
                match active.get(&campaign_id) {
                    Some(true) => {
                        active.insert(campaign_id, false);
                        false
                    }
                    _ => {
                        active.remove(&campaign_id);
                        true
                    }
                }
            };
            if finished {
                break;
            }
        }
        debug!(campaign_id, "Campaign consumer finished");
    }

    /// One batch with bounded retries. `None` means stop consuming.
    async fn run_batch(&self, campaign_id: i64) -> Option<BatchOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.dispatcher.dispatch_batch(campaign_id).await {
                Ok(outcome) => return Some(outcome),
                Err(CampaignError::NotFound { .. }) => {
                    warn!(campaign_id, "Campaign disappeared before dispatch");
                    return None;
                }
                Err(e) => {
                    let message = e.to_string();
                    warn!(campaign_id, attempt, "Campaign batch failed: {}", message);
                    if let Err(store_err) = self
                        .db
                        .call(move |db| db.set_campaign_error(campaign_id, &message))
                        .await
                    {
                        warn!(campaign_id, "Failed to record campaign error: {:#}", store_err);
                    }
                    if attempt >= self.policy.max_attempts {
                        error!(
                            campaign_id,
                            attempts = attempt,
                            "Giving up on campaign batch; it stays resumable"
                        );
                        return None;
                    }
                    tokio::time::sleep(self.policy.delay_after(attempt)).await;
                }
            }
        }
    }
}

/// Frees the campaign's consumer slot if the consumer dies without
/// releasing it itself.
struct ActiveSlot {
    inner: Arc<QueueInner>,
    campaign_id: i64,
    armed: bool,
}

impl ActiveSlot {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        if self.armed {
            self.inner.lock_active().remove(&self.campaign_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::dispatcher::tests::{RecordingMailer, campaign_with};
    use crate::db::Db;
    use crate::models::CampaignStatus;

    fn queue(db: &DbHandle, mailer: Arc<RecordingMailer>, batch_size: usize) -> CampaignQueue {
        let config = CampaignSection {
            batch_size,
            retry_backoff_ms: 10,
            ..Default::default()
        };
        let dispatcher =
            CampaignDispatcher::new(db.clone(), mailer, "http://localhost".into(), &config);
        CampaignQueue::new(dispatcher, db.clone(), RetryPolicy::from_config(&config))
    }

    async fn wait_idle(queue: &CampaignQueue) {
        for _ in 0..200 {
            if queue.active_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue did not drain");
    }

    #[tokio::test]
    async fn test_consumer_drains_campaign_across_batches() {
        let db = DbHandle::new(Db::new_in_memory().unwrap());
        let emails: Vec<String> = (0..7).map(|i| format!("r{}@example.com", i)).collect();
        let refs: Vec<&str> = emails.iter().map(String::as_str).collect();
        let id = campaign_with(&db, &refs, "body").await;
        let mailer = Arc::new(RecordingMailer::failing(&["r3@example.com"]));
        let queue = queue(&db, mailer.clone(), 3);

        assert!(queue.enqueue(id));
        wait_idle(&queue).await;

        let campaign = db.call(move |db| db.get_campaign(id)).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);
        assert_eq!(campaign.sent_count, 6);
        assert_eq!(campaign.failed_count, 1);
        assert_eq!(campaign.pending_count, 0);
        assert_eq!(mailer.sent_to().len(), 6);
    }

    #[tokio::test]
    async fn test_second_enqueue_does_not_double_send() {
        let db = DbHandle::new(Db::new_in_memory().unwrap());
        let emails: Vec<String> = (0..20).map(|i| format!("r{}@example.com", i)).collect();
        let refs: Vec<&str> = emails.iter().map(String::as_str).collect();
        let id = campaign_with(&db, &refs, "body").await;
        let mailer = Arc::new(RecordingMailer::default());
        let queue = queue(&db, mailer.clone(), 2);

        assert!(queue.enqueue(id));
        for _ in 0..5 {
            queue.enqueue(id);
        }
        wait_idle(&queue).await;

        let mut sent = mailer.sent_to();
        assert_eq!(sent.len(), 20);
        sent.sort();
        sent.dedup();
        assert_eq!(sent.len(), 20, "no recipient may be sent twice");
        assert!(!queue.is_active(id));
    }

    #[tokio::test]
    async fn test_missing_campaign_stops_consumer() {
        let db = DbHandle::new(Db::new_in_memory().unwrap());
        let queue = queue(&db, Arc::new(RecordingMailer::default()), 10);
        queue.enqueue(99);
        wait_idle(&queue).await;
        assert!(!queue.is_active(99));
    }

    #[tokio::test]
    async fn test_resume_unfinished() {
        let db = DbHandle::new(Db::new_in_memory().unwrap());
        let pending = campaign_with(&db, &["a@example.com"], "body").await;
        let cancelled = campaign_with(&db, &["b@example.com"], "body").await;
        db.call(move |db| db.cancel_campaign(cancelled)).await.unwrap();

        let mailer = Arc::new(RecordingMailer::default());
        let queue = queue(&db, mailer.clone(), 10);
        assert_eq!(queue.resume_unfinished().await.unwrap(), 1);
        wait_idle(&queue).await;

        assert_eq!(mailer.sent_to(), vec!["a@example.com"]);
        let campaign = db.call(move |db| db.get_campaign(pending)).await.unwrap().unwrap();
        assert_eq!(campaign.status, CampaignStatus::Completed);
    }

    #[test]
    fn test_backoff_grows_exponentially() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(100),
            continue_delay: Duration::ZERO,
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
    }

    #[test]
    fn test_policy_needs_at_least_one_attempt() {
        let config = CampaignSection {
            max_attempts: 0,
            ..Default::default()
        };
        assert_eq!(RetryPolicy::from_config(&config).max_attempts, 1);
    }
}
