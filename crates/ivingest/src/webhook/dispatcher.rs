//! Fan-out of bus events to subscribed webhook endpoints.
//!
//! Every matching active subscription gets its own delivery sequence with
//! bounded retries. Per-subscription ordering follows publication order
//! because each subscription drains a serial queue; global concurrency is
//! bounded by a semaphore.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::bus::EventBus;
use crate::config::WebhookConfig;
use crate::error::WebhookError;
use crate::events::{Event, EventType};
use crate::store::{Subscription, SubscriptionRepo};
use crate::webhook::delivery::{DeliveryClient, DeliveryOutcome, DeliveryRequest};
use crate::webhook::signature;

/// Work item on a subscription's serial queue.
struct PendingDelivery {
    event_id: String,
    event_type: EventType,
    /// Serialized body shared across subscriptions; signatures differ.
    body: Arc<String>,
}

#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub enqueued: AtomicU64,
    pub delivered: AtomicU64,
    pub exhausted: AtomicU64,
}

pub struct WebhookDispatcher {
    subs: Arc<SubscriptionRepo>,
    client: Arc<DeliveryClient>,
    config: WebhookConfig,
    semaphore: Arc<Semaphore>,
    senders: Mutex<HashMap<String, mpsc::UnboundedSender<PendingDelivery>>>,
    consumer_handles: Mutex<Vec<JoinHandle<()>>>,
    bus_handle: Mutex<Option<JoinHandle<()>>>,
    pub stats: DispatcherStats,
}

impl WebhookDispatcher {
    /// Creates the dispatcher and wires it to every bus topic.
    pub fn start(
        config: WebhookConfig,
        subs: Arc<SubscriptionRepo>,
        bus: &EventBus,
    ) -> Result<Arc<Self>, WebhookError> {
        let client = Arc::new(DeliveryClient::new(&config)?);
        let dispatcher = Arc::new(Self {
            subs,
            client,
            semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
            config,
            senders: Mutex::new(HashMap::new()),
            consumer_handles: Mutex::new(Vec::new()),
            bus_handle: Mutex::new(None),
            stats: DispatcherStats::default(),
        });

        let routing = Arc::clone(&dispatcher);
        let handle = bus.subscribe_handler("*", move |event| {
            Self::route(&routing, &event);
        });
        *dispatcher.bus_handle.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);

        Ok(dispatcher)
    }

    /// Routes one event: enqueue a delivery per matching subscription.
    fn route(this: &Arc<Self>, event: &Event) {
        let matching = match this.subs.active_for_event(event.event_type) {
            Ok(subs) => subs,
            Err(e) => {
                warn!("subscription lookup failed for {}: {}", event.topic(), e);
                return;
            }
        };
        if matching.is_empty() {
            return;
        }

        let body = match serde_json::to_string(event) {
            Ok(body) => Arc::new(body),
            Err(e) => {
                warn!("event {} not serializable: {}", event.id, e);
                return;
            }
        };

        for sub in matching {
            this.stats.enqueued.fetch_add(1, Ordering::Relaxed);
            Self::enqueue(
                this,
                sub,
                PendingDelivery {
                    event_id: event.id.clone(),
                    event_type: event.event_type,
                    body: Arc::clone(&body),
                },
            );
        }
    }

    /// Puts a delivery on the subscription's serial queue, spawning its
    /// consumer on first use.
    fn enqueue(this: &Arc<Self>, sub: Subscription, pending: PendingDelivery) {
        let mut senders = match this.senders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let sender = senders.entry(sub.id.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let dispatcher = Arc::clone(this);
            let handle = tokio::spawn(dispatcher.consume(sub.id.clone(), rx));
            match this.consumer_handles.lock() {
                Ok(mut handles) => handles.push(handle),
                Err(poisoned) => poisoned.into_inner().push(handle),
            }
            tx
        });

        if sender.send(pending).is_err() {
            warn!("delivery queue for subscription {} is closed", sub.id);
        }
    }

    /// Serial consumer for one subscription.
    async fn consume(
        self: Arc<Self>,
        sub_id: String,
        mut rx: mpsc::UnboundedReceiver<PendingDelivery>,
    ) {
        while let Some(pending) = rx.recv().await {
            // Re-read the subscription each time: secret rotation and the
            // active flag take effect between deliveries.
            let sub = match self.subs.get(&sub_id) {
                Ok(Some(sub)) if sub.active => sub,
                Ok(_) => {
                    debug!("subscription {} gone or inactive, dropping delivery", sub_id);
                    continue;
                }
                Err(e) => {
                    warn!("subscription {} lookup failed: {}", sub_id, e);
                    continue;
                }
            };
            self.deliver_with_retries(&sub, pending).await;
        }
    }

    /// Runs the bounded retry schedule for one (event, subscription) pair.
    async fn deliver_with_retries(&self, sub: &Subscription, pending: PendingDelivery) {
        let signature = signature::sign(&sub.secret, pending.body.as_bytes());
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let delivery_id = uuid::Uuid::new_v4().to_string();
            let outcome = {
                let _permit = self
                    .semaphore
                    .acquire()
                    .await
                    .expect("delivery semaphore never closes");
                self.client
                    .deliver(DeliveryRequest {
                        url: &sub.url,
                        body: &pending.body,
                        signature: &signature,
                        event_type: pending.event_type.as_str(),
                        delivery_id: &delivery_id,
                        attempt,
                    })
                    .await
            };

            // Counters are per attempt: a success after two failures reads
            // total=3, succeeded=1, failed=2.
            match outcome {
                DeliveryOutcome::Delivered { status } => {
                    info!(
                        "delivered {} to subscription {} (attempt {}, status {})",
                        pending.event_id, sub.id, attempt, status
                    );
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = self.subs.record_delivery(&sub.id, true, Utc::now()) {
                        warn!("delivery counter update failed for {}: {}", sub.id, e);
                    }
                    return;
                }
                DeliveryOutcome::TransientFail { status, reason } => {
                    debug!(
                        "delivery {} attempt {}/{} to {} failed: {} (status {:?})",
                        pending.event_id, attempt, max_attempts, sub.url, reason, status
                    );
                    if let Err(e) = self.subs.record_delivery(&sub.id, false, Utc::now()) {
                        warn!("delivery counter update failed for {}: {}", sub.id, e);
                    }
                    if attempt < max_attempts {
                        tokio::time::sleep(self.retry_delay(attempt)).await;
                    }
                }
            }
        }

        // Attempts exhausted: drop the delivery and move on; the source
        // job's state is unaffected.
        warn!(
            "delivery {} to subscription {} dropped after {} attempts",
            pending.event_id, sub.id, max_attempts
        );
        self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let table = &self.config.retry_delays_secs;
        let index = (attempt.saturating_sub(1) as usize).min(table.len().saturating_sub(1));
        Duration::from_secs(table.get(index).copied().unwrap_or(1))
    }

    /// Sends a single `test` event to one subscription and reports the
    /// outcome of the one attempt.
    pub async fn test_subscription(&self, sub_id: &str) -> Result<DeliveryOutcome, WebhookError> {
        let sub = self
            .subs
            .get(sub_id)
            .map_err(|_| WebhookError::InvalidUrl(sub_id.to_string()))?
            .ok_or_else(|| WebhookError::InvalidUrl(format!("unknown subscription {}", sub_id)))?;

        let event = Event::new(
            EventType::Test,
            serde_json::json!({ "subscriptionId": sub.id }),
        );
        let body = serde_json::to_string(&event)
            .map_err(|e| WebhookError::InvalidUrl(e.to_string()))?;
        let signature = signature::sign(&sub.secret, body.as_bytes());
        let delivery_id = uuid::Uuid::new_v4().to_string();

        let outcome = self
            .client
            .deliver(DeliveryRequest {
                url: &sub.url,
                body: &body,
                signature: &signature,
                event_type: EventType::Test.as_str(),
                delivery_id: &delivery_id,
                attempt: 1,
            })
            .await;

        self.subs
            .record_delivery(&sub.id, outcome.is_delivered(), Utc::now())
            .ok();
        Ok(outcome)
    }

    /// Flushes queued deliveries and stops all dispatcher tasks.
    pub async fn shutdown(&self, timeout: Duration) {
        if let Some(handle) = self
            .bus_handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            handle.abort();
        }

        let handles: Vec<JoinHandle<()>> = {
            let mut senders = match self.senders.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            senders.clear();

            let mut consumer_handles = match self.consumer_handles.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            consumer_handles.drain(..).collect()
        };

        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("dispatcher drain timed out after {:?}", timeout);
        }
    }
}
