//! Divvy payment monitor.
//!
//! Drains a feed of incoming handle payments, records each one and pays its
//! distributions out straight away with the token owner's identity token.

use crate::divvy::{DistributionReport, DivvyService, IncomingPayment};
use crate::error::{Result, StoreError};
use crate::persistence::Database;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Source of payments received by token handles.
#[async_trait]
pub trait PaymentFeed: Send + Sync {
    /// Payments observed since the last poll.
    async fn poll(&self) -> Result<Vec<IncomingPayment>>;

    /// Resolve when new payments may be available, or after `interval`.
    async fn wait(&self, interval: Duration) {
        tokio::time::sleep(interval).await;
    }
}

/// In-process queue filled by the webhook endpoint.
#[derive(Default)]
pub struct WebhookQueue {
    pending: Mutex<VecDeque<IncomingPayment>>,
    notify: Notify,
}

impl WebhookQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, payment: IncomingPayment) {
        self.pending.lock().push_back(payment);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PaymentFeed for WebhookQueue {
    async fn poll(&self) -> Result<Vec<IncomingPayment>> {
        Ok(self.pending.lock().drain(..).collect())
    }

    async fn wait(&self, interval: Duration) {
        tokio::select! {
            _ = self.notify.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

pub struct DivvyMonitor {
    db: Arc<Database>,
    service: Arc<DivvyService>,
    feed: Arc<dyn PaymentFeed>,
    poll_interval: Duration,
    in_flight: Mutex<HashSet<String>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DivvyMonitor {
    pub fn new(
        db: Arc<Database>,
        service: Arc<DivvyService>,
        feed: Arc<dyn PaymentFeed>,
        poll_interval: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        DivvyMonitor {
            db,
            service,
            feed,
            poll_interval,
            in_flight: Mutex::new(HashSet::new()),
            shutdown,
            task: Mutex::new(None),
        }
    }

    /// Spawn the monitor loop. Calling it while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        self.shutdown.send_replace(false);

        let monitor = Arc::clone(self);
        let mut stop = self.shutdown.subscribe();
        *task = Some(tokio::spawn(async move {
            info!(interval = ?monitor.poll_interval, "divvy monitor started");
            loop {
                monitor.drain_feed().await;
                tokio::select! {
                    _ = monitor.feed.wait(monitor.poll_interval) => {}
                    _ = stop.changed() => {}
                }
                if *stop.borrow() {
                    break;
                }
            }
            info!("divvy monitor stopped");
        }));
    }

    /// Signal the loop to stop and wait for the payment in progress to finish.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "divvy monitor task failed");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    async fn drain_feed(&self) {
        let payments = match self.feed.poll().await {
            Ok(payments) => payments,
            Err(e) => {
                error!(error = %e, "failed to poll payment feed");
                return;
            }
        };
        for payment in payments {
            let tx_id = payment.tx_id.clone();
            if let Err(e) = self.handle_payment(payment).await {
                error!(tx_id = %tx_id, error = %e, "failed to process payment");
            }
        }
    }

    /// Record a payment and distribute it. Returns `None` when the payment is
    /// already being processed or was recorded before.
    pub async fn handle_payment(
        &self,
        payment: IncomingPayment,
    ) -> Result<Option<DistributionReport>> {
        if !self.in_flight.lock().insert(payment.tx_id.clone()) {
            info!(tx_id = %payment.tx_id, "payment already being processed");
            return Ok(None);
        }

        let outcome = self.process(&payment).await;
        self.in_flight.lock().remove(&payment.tx_id);
        outcome
    }

    async fn process(&self, payment: &IncomingPayment) -> Result<Option<DistributionReport>> {
        if self.db.payment_recorded(&payment.tx_id)? {
            info!(tx_id = %payment.tx_id, "payment already processed");
            return Ok(None);
        }

        info!(
            tx_id = %payment.tx_id,
            handle = %payment.handcash_handle,
            amount = payment.amount,
            currency = %payment.currency,
            "processing payment"
        );
        let recorded = self.service.record_payment(payment)?;

        let token = self
            .db
            .get_token(&recorded.payment.token_id)?
            .ok_or_else(|| StoreError::NotFound("Token not found".to_string()))?;
        let owner = self
            .db
            .get_user(&token.owner_id)?
            .ok_or_else(|| StoreError::NotFound("User not found".to_string()))?;

        let report = self
            .service
            .distribute(&recorded.payment.id, &owner.auth_token)
            .await?;
        if report.failed > 0 {
            warn!(
                payment = %recorded.payment.id,
                failed = report.failed,
                "some dividend payouts failed"
            );
        }
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payment(tx_id: &str) -> IncomingPayment {
        IncomingPayment {
            handcash_handle: "@alice".to_string(),
            amount: 1_000,
            currency: "BSV".to_string(),
            tx_id: tx_id.to_string(),
            from_handle: None,
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn test_queue_drains_in_order() {
        let queue = WebhookQueue::new();
        queue.push(payment("a"));
        queue.push(payment("b"));
        assert_eq!(queue.len(), 2);

        let drained = queue.poll().await.unwrap();
        let ids: Vec<&str> = drained.iter().map(|p| p.tx_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_push_wakes_waiter() {
        let queue = Arc::new(WebhookQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait(Duration::from_secs(30)).await })
        };
        queue.push(payment("wake"));
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should wake on push")
            .unwrap();
    }
}
