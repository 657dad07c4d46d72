//! Notification consumers.
//!
//! Consumers receive notification events from the durable queue with
//! at-least-once delivery. The worker wrapping each consumer dedups on
//! the event id before invoking it, so a consumer's side effect runs at
//! most once per event even when the queue redelivers.

use crate::CoreError;
use async_trait::async_trait;
use mealflow_queue::{MessageQueue, Subscription};
use mealflow_storage::StorageService;
use mealflow_types::{truncate_id, NotificationEvent, StorageKey};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub mod email;
pub mod preparing;
pub mod status;

pub use email::EmailVerificationConsumer;
pub use preparing::OrderPreparingConsumer;
pub use status::StatusUpdateConsumer;

/// Outbound notification channel.
///
/// The delivery mechanism (email, push, SMS) lives behind this trait;
/// implementations must tolerate repeated sends with the same
/// idempotency key, which is stable across queue redeliveries.
#[async_trait]
pub trait Notifier: Send + Sync {
	async fn send(
		&self,
		idempotency_key: &str,
		user_id: &str,
		message: &str,
	) -> Result<(), CoreError>;
}

/// Notifier that writes notifications to the log. The default channel
/// until a real delivery provider is wired in.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
	async fn send(
		&self,
		idempotency_key: &str,
		user_id: &str,
		message: &str,
	) -> Result<(), CoreError> {
		info!(
			key = %truncate_id(idempotency_key),
			user_id = %truncate_id(user_id),
			message = %message,
			"Notification sent"
		);
		Ok(())
	}
}

/// A consumer of notification events on a single topic.
#[async_trait]
pub trait NotificationConsumer: Send + Sync {
	/// Stable name, part of the dedup key so distinct consumers on the
	/// same topic track handled events independently.
	fn name(&self) -> &'static str;

	/// The queue topic this consumer subscribes to.
	fn topic(&self) -> &'static str;

	/// Handles one event. Errors are retried by the worker via the
	/// queue's redelivery machinery.
	async fn handle(&self, event: &NotificationEvent) -> Result<(), CoreError>;
}

/// Runs a consumer against its topic subscription.
///
/// The worker owns the at-least-once plumbing: parse, dedup check,
/// handle, mark handled, ack. A failure anywhere before the ack leaves
/// the message on the queue for redelivery, and the handled marker
/// makes the retry skip straight to the ack.
pub struct ConsumerWorker {
	storage: Arc<StorageService>,
	queue: Arc<MessageQueue>,
	consumer: Arc<dyn NotificationConsumer>,
	dedup_retention: Duration,
}

impl ConsumerWorker {
	pub fn new(
		storage: Arc<StorageService>,
		queue: Arc<MessageQueue>,
		consumer: Arc<dyn NotificationConsumer>,
		dedup_retention: Duration,
	) -> Self {
		Self {
			storage,
			queue,
			consumer,
			dedup_retention,
		}
	}

	/// Receives and processes a single delivery.
	pub async fn process_one(&self, subscription: &Subscription) -> Result<(), CoreError> {
		let delivery = subscription.recv().await?;

		let event: NotificationEvent = match serde_json::from_slice(delivery.payload()) {
			Ok(event) => event,
			Err(e) => {
				// Unparsable payloads can never succeed; let the queue
				// walk them to its dead-letter store
				warn!(
					consumer = self.consumer.name(),
					error = %e,
					"Discarding malformed notification payload"
				);
				subscription.nack(delivery).await?;
				return Ok(());
			},
		};

		let dedup_id = format!("{}:{}", self.consumer.name(), event.event_id);
		if self
			.storage
			.exists(StorageKey::ConsumerHandled, &dedup_id)
			.await?
		{
			debug!(
				consumer = self.consumer.name(),
				event_id = %truncate_id(&event.event_id),
				"Skipping already-handled event"
			);
			subscription.ack(delivery).await?;
			return Ok(());
		}

		match self.consumer.handle(&event).await {
			Ok(()) => {
				// Marker before ack: a crash in between redelivers, and
				// the marker turns the redelivery into a bare ack
				self.storage
					.store(
						StorageKey::ConsumerHandled,
						&dedup_id,
						&event.occurred_at,
						Some(self.dedup_retention),
					)
					.await?;
				subscription.ack(delivery).await?;
			},
			Err(e) => {
				warn!(
					consumer = self.consumer.name(),
					event_id = %truncate_id(&event.event_id),
					error = %e,
					"Consumer failed; message will be redelivered"
				);
				subscription.nack(delivery).await?;
			},
		}
		Ok(())
	}

	/// Runs the consumer loop until shutdown is signalled.
	pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
		let subscription = self
			.queue
			.subscribe(self.consumer.topic(), self.consumer.name());
		info!(
			consumer = self.consumer.name(),
			topic = self.consumer.topic(),
			"Consumer started"
		);
		loop {
			tokio::select! {
				result = self.process_one(&subscription) => {
					if let Err(e) = result {
						error!(
							consumer = self.consumer.name(),
							error = %e,
							"Consumer worker error"
						);
						tokio::time::sleep(Duration::from_secs(1)).await;
					}
				}
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						info!(consumer = self.consumer.name(), "Consumer shutting down");
						break;
					}
				}
			}
		}
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use mealflow_queue::QueueConfig;
	use mealflow_storage::implementations::memory::MemoryStorage;
	use mealflow_types::{NotificationPayload, OrderStatus, TOPIC_ORDER_PREPARING};
	use std::sync::atomic::{AtomicU32, Ordering};
	use std::sync::Mutex;

	/// Notifier that counts sends and records idempotency keys.
	pub(crate) struct CountingNotifier {
		pub sends: AtomicU32,
		pub keys: Mutex<Vec<String>>,
		/// Upcoming sends that fail.
		pub failing: AtomicU32,
	}

	impl CountingNotifier {
		pub fn new() -> Self {
			Self {
				sends: AtomicU32::new(0),
				keys: Mutex::new(Vec::new()),
				failing: AtomicU32::new(0),
			}
		}
	}

	#[async_trait]
	impl Notifier for CountingNotifier {
		async fn send(
			&self,
			idempotency_key: &str,
			_user_id: &str,
			_message: &str,
		) -> Result<(), CoreError> {
			if self
				.failing
				.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
				.is_ok()
			{
				return Err(CoreError::Storage("injected notifier failure".into()));
			}
			self.sends.fetch_add(1, Ordering::SeqCst);
			if let Ok(mut keys) = self.keys.lock() {
				keys.push(idempotency_key.to_string());
			}
			Ok(())
		}
	}

	fn event(event_id: &str) -> NotificationEvent {
		NotificationEvent {
			event_id: event_id.to_string(),
			order_id: "o-1".into(),
			from_status: Some(OrderStatus::Pending),
			to_status: OrderStatus::Preparing,
			occurred_at: 100,
			payload: NotificationPayload {
				user_id: "u-1".into(),
				restaurant_id: "r-1".into(),
				total_price: "19.00".parse().unwrap(),
			},
		}
	}

	fn setup() -> (Arc<StorageService>, Arc<MessageQueue>, Arc<CountingNotifier>, ConsumerWorker) {
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		let queue = Arc::new(MessageQueue::new(
			storage.clone(),
			QueueConfig {
				max_attempts: 3,
				initial_backoff_ms: 1,
				max_backoff_ms: 5,
				ack_timeout_ms: 30_000,
			},
		));
		let notifier = Arc::new(CountingNotifier::new());
		let worker = ConsumerWorker::new(
			storage.clone(),
			queue.clone(),
			Arc::new(OrderPreparingConsumer::new(notifier.clone())),
			Duration::from_secs(3600),
		);
		(storage, queue, notifier, worker)
	}

	async fn publish(queue: &MessageQueue, event: &NotificationEvent) {
		queue
			.publish(
				TOPIC_ORDER_PREPARING,
				&event.order_id,
				serde_json::to_vec(event).unwrap(),
			)
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn redelivered_event_notifies_once() {
		let (_, queue, notifier, worker) = setup();
		let subscription = queue.subscribe(TOPIC_ORDER_PREPARING, "order-preparing");

		// The relay may publish the same event twice after a crash
		publish(&queue, &event("e-1")).await;
		publish(&queue, &event("e-1")).await;

		worker.process_one(&subscription).await.unwrap();
		worker.process_one(&subscription).await.unwrap();

		assert_eq!(notifier.sends.load(Ordering::SeqCst), 1);
		let keys = notifier.keys.lock().unwrap();
		assert_eq!(*keys, vec!["order-preparing:e-1".to_string()]);
	}

	#[tokio::test]
	async fn failed_handle_is_retried_with_one_side_effect() {
		let (_, queue, notifier, worker) = setup();
		let subscription = queue.subscribe(TOPIC_ORDER_PREPARING, "order-preparing");
		notifier.failing.store(1, Ordering::SeqCst);

		publish(&queue, &event("e-1")).await;

		// First attempt fails and nacks; the redelivery succeeds
		worker.process_one(&subscription).await.unwrap();
		assert_eq!(notifier.sends.load(Ordering::SeqCst), 0);
		worker.process_one(&subscription).await.unwrap();
		assert_eq!(notifier.sends.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn malformed_payload_walks_to_the_dead_letter_store() {
		let (_, queue, notifier, worker) = setup();
		let subscription = queue.subscribe(TOPIC_ORDER_PREPARING, "order-preparing");

		queue
			.publish(TOPIC_ORDER_PREPARING, "o-1", b"not json".to_vec())
			.await
			.unwrap();

		// max_attempts is 3; each pass nacks once
		for _ in 0..3 {
			worker.process_one(&subscription).await.unwrap();
		}

		assert_eq!(notifier.sends.load(Ordering::SeqCst), 0);
		let dead = queue.dead_letters(TOPIC_ORDER_PREPARING).await.unwrap();
		assert_eq!(dead.len(), 1);
		assert_eq!(dead[0].payload, b"not json".to_vec());
	}

	#[tokio::test]
	async fn distinct_events_each_notify() {
		let (_, queue, notifier, worker) = setup();
		let subscription = queue.subscribe(TOPIC_ORDER_PREPARING, "order-preparing");

		let mut second = event("e-2");
		second.order_id = "o-2".into();
		publish(&queue, &event("e-1")).await;
		publish(&queue, &second).await;

		worker.process_one(&subscription).await.unwrap();
		worker.process_one(&subscription).await.unwrap();
		assert_eq!(notifier.sends.load(Ordering::SeqCst), 2);
	}
}
