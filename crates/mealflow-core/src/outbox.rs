//! Transactional outbox relay.
//!
//! The state machine writes a notification row in the same commit as
//! every status change; this relay moves those rows onto the durable
//! queue. Rows are published before they are deleted, so a crash
//! between the two steps re-publishes the event on the next pass and
//! consumers absorb the duplicate via the event id.

use crate::CoreError;
use mealflow_queue::MessageQueue;
use mealflow_storage::StorageService;
use mealflow_types::{truncate_id, NotificationEvent, StorageKey};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Relays committed outbox rows onto the notification queue.
pub struct OutboxPublisher {
	storage: Arc<StorageService>,
	queue: Arc<MessageQueue>,
	poll_interval: Duration,
}

impl OutboxPublisher {
	pub fn new(
		storage: Arc<StorageService>,
		queue: Arc<MessageQueue>,
		poll_interval: Duration,
	) -> Self {
		Self {
			storage,
			queue,
			poll_interval,
		}
	}

	/// Publishes every pending outbox row once, oldest first per order.
	/// Returns the number of rows relayed.
	pub async fn drain_once(&self) -> Result<usize, CoreError> {
		// Row ids are "{order_id}:{seq:010}", so the sorted listing
		// yields each order's events in commit order
		let ids = self.storage.list_ids(StorageKey::Outbox, "").await?;
		let mut relayed = 0;
		for id in ids {
			let event: NotificationEvent = self.storage.retrieve(StorageKey::Outbox, &id).await?;
			let payload = serde_json::to_vec(&event)
				.map_err(|e| CoreError::Storage(e.to_string()))?;
			self.queue
				.publish(event.topic(), &event.order_id, payload)
				.await?;
			self.storage.remove(StorageKey::Outbox, &id).await?;
			debug!(
				event_id = %truncate_id(&event.event_id),
				topic = event.topic(),
				"Outbox row relayed"
			);
			relayed += 1;
		}
		Ok(relayed)
	}

	/// Runs the relay loop until shutdown is signalled.
	pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
		let mut ticker = tokio::time::interval(self.poll_interval);
		loop {
			tokio::select! {
				_ = ticker.tick() => {
					match self.drain_once().await {
						Ok(0) => {},
						Ok(n) => debug!(count = n, "Relayed outbox rows"),
						Err(e) => error!(error = %e, "Outbox relay pass failed"),
					}
				}
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						info!("Outbox relay shutting down");
						break;
					}
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::state::order::OrderStateMachine;
	use mealflow_queue::QueueConfig;
	use mealflow_storage::implementations::memory::MemoryStorage;
	use mealflow_types::{
		current_timestamp, Order, OrderStatus, TransitionEvent, TOPIC_EMAIL_VERIFICATION,
		TOPIC_ORDER_PENDING,
	};

	fn order(id: &str) -> Order {
		Order {
			id: id.to_string(),
			user_id: "u-1".into(),
			restaurant_id: "r-1".into(),
			menu_id: "m-1".into(),
			item_quantity: 1,
			item_price: "10.00".parse().unwrap(),
			status: OrderStatus::Waiting,
			payment_token: None,
			created_at: current_timestamp(),
			updated_at: current_timestamp(),
		}
	}

	#[tokio::test]
	async fn drains_rows_onto_their_topics_and_deletes_them() {
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		let sm = OrderStateMachine::new(storage.clone());
		let queue = Arc::new(MessageQueue::new(storage.clone(), QueueConfig::default()));
		let publisher =
			OutboxPublisher::new(storage.clone(), queue.clone(), Duration::from_millis(50));

		sm.create_order(&order("o-1")).await.unwrap();
		sm.apply_transition(
			"o-1",
			&TransitionEvent::PaymentInitiated {
				token: "tok-1".into(),
			},
			None,
		)
		.await
		.unwrap();

		assert_eq!(publisher.drain_once().await.unwrap(), 2);
		assert!(storage
			.list_ids(StorageKey::Outbox, "")
			.await
			.unwrap()
			.is_empty());

		let verification = queue.subscribe(TOPIC_EMAIL_VERIFICATION, "test");
		let delivery = verification.recv().await.unwrap();
		let event: NotificationEvent = serde_json::from_slice(delivery.payload()).unwrap();
		assert_eq!(event.to_status, OrderStatus::Waiting);
		verification.ack(delivery).await.unwrap();

		let pending = queue.subscribe(TOPIC_ORDER_PENDING, "test");
		let delivery = pending.recv().await.unwrap();
		let event: NotificationEvent = serde_json::from_slice(delivery.payload()).unwrap();
		assert_eq!(event.to_status, OrderStatus::Pending);
		pending.ack(delivery).await.unwrap();

		// Nothing left to relay
		assert_eq!(publisher.drain_once().await.unwrap(), 0);
	}

	#[tokio::test]
	async fn interrupted_pass_republishes_on_the_next_one() {
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		let sm = OrderStateMachine::new(storage.clone());
		let queue = Arc::new(MessageQueue::new(storage.clone(), QueueConfig::default()));
		let publisher =
			OutboxPublisher::new(storage.clone(), queue.clone(), Duration::from_millis(50));

		sm.create_order(&order("o-1")).await.unwrap();
		publisher.drain_once().await.unwrap();

		// Simulate a crash after publish but before delete by putting
		// the row back; the next pass publishes it again
		let sub = queue.subscribe(TOPIC_EMAIL_VERIFICATION, "test");
		let first = sub.recv().await.unwrap();
		let event: NotificationEvent = serde_json::from_slice(first.payload()).unwrap();
		sub.ack(first).await.unwrap();
		storage
			.store(
				StorageKey::Outbox,
				&format!("{}:{:010}", event.order_id, 1),
				&event,
				None,
			)
			.await
			.unwrap();

		assert_eq!(publisher.drain_once().await.unwrap(), 1);
		let second = sub.recv().await.unwrap();
		let replay: NotificationEvent = serde_json::from_slice(second.payload()).unwrap();
		// Same event id both times; consumers dedup on it
		assert_eq!(replay.event_id, event.event_id);
		sub.ack(second).await.unwrap();
	}
}
