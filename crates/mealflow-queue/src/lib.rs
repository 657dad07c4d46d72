//! Durable message queue for the mealflow order coordination system.
//!
//! An in-process queue with storage-journaled messages. Every published
//! message is written to storage before it becomes visible, so a
//! restart replays whatever was not acked: delivery is at-least-once
//! and consumers are expected to deduplicate.
//!
//! Ordering is per key: messages sharing a key (the order id) are
//! delivered in publish order, and the next one is held back until the
//! previous one is acked. Messages with different keys are delivered
//! independently.
//!
//! A message that fails repeatedly is moved to the dead-letter store
//! after `max_attempts` delivery attempts and the stream continues with
//! the next message.

use mealflow_storage::{StorageError, StorageService};
use mealflow_types::{current_timestamp, current_timestamp_millis, StorageKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
	/// Error in the storage journal backing the queue.
	#[error("Storage error: {0}")]
	Storage(#[from] StorageError),
	/// Error serializing a message for the journal.
	#[error("Serialization error: {0}")]
	Serialization(String),
}

/// Queue tuning parameters.
#[derive(Debug, Clone)]
pub struct QueueConfig {
	/// Delivery attempts before a message is dead-lettered.
	pub max_attempts: u32,
	/// Backoff before the first redelivery, doubling per attempt.
	pub initial_backoff_ms: u64,
	/// Upper bound on the redelivery backoff.
	pub max_backoff_ms: u64,
	/// How long a delivery may stay unacked before it is considered
	/// lost and redelivered.
	pub ack_timeout_ms: u64,
}

impl Default for QueueConfig {
	fn default() -> Self {
		Self {
			max_attempts: 5,
			initial_backoff_ms: 200,
			max_backoff_ms: 30_000,
			ack_timeout_ms: 30_000,
		}
	}
}

impl QueueConfig {
	/// Redelivery backoff after the given number of failed attempts.
	fn backoff(&self, attempts: u32) -> u64 {
		let shift = attempts.saturating_sub(1).min(16);
		(self.initial_backoff_ms << shift).min(self.max_backoff_ms)
	}
}

/// A journaled message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
	/// Unique message id.
	pub id: String,
	/// Topic the message was published to.
	pub topic: String,
	/// Ordering key; messages sharing a key are delivered in order.
	pub key: String,
	/// Opaque payload.
	pub payload: Vec<u8>,
	/// Failed delivery attempts so far.
	pub attempts: u32,
	/// Unix seconds at publish time.
	pub published_at: u64,
	/// Per-topic sequence number assigned at publish.
	pub seq: u64,
}

#[derive(Debug, Clone, Copy)]
enum SlotStatus {
	/// Deliverable once `available_at` (Unix millis) has passed.
	Ready { available_at: u64 },
	/// Handed to a consumer; redelivered if not acked by `deadline`.
	InFlight { deadline: u64 },
}

#[derive(Debug)]
struct Slot {
	message: StoredMessage,
	status: SlotStatus,
}

#[derive(Debug, Default)]
struct TopicState {
	/// Live messages in sequence order.
	slots: BTreeMap<u64, Slot>,
	next_seq: u64,
}

#[derive(Debug, Default)]
struct QueueState {
	topics: HashMap<String, TopicState>,
}

struct Inner {
	storage: Arc<StorageService>,
	config: QueueConfig,
	state: Mutex<QueueState>,
	notify: Notify,
}

impl Inner {
	fn journal_id(topic: &str, seq: u64) -> String {
		format!("{}:{:020}", topic, seq)
	}

	/// Moves a message to the dead-letter store and drops it from the
	/// journal.
	async fn dead_letter(&self, message: &StoredMessage) -> Result<(), QueueError> {
		warn!(
			topic = %message.topic,
			message_id = %message.id,
			attempts = message.attempts,
			"Moving message to dead-letter store"
		);
		let id = Self::journal_id(&message.topic, message.seq);
		self.storage
			.store(StorageKey::QueueDeadLetters, &id, message, None)
			.await?;
		self.storage.remove(StorageKey::QueueMessages, &id).await?;
		Ok(())
	}
}

/// Handle to the message queue. Cheap to clone.
#[derive(Clone)]
pub struct MessageQueue {
	inner: Arc<Inner>,
}

impl MessageQueue {
	/// Creates a new queue journaling into the given storage.
	pub fn new(storage: Arc<StorageService>, config: QueueConfig) -> Self {
		Self {
			inner: Arc::new(Inner {
				storage,
				config,
				state: Mutex::new(QueueState::default()),
				notify: Notify::new(),
			}),
		}
	}

	/// Reloads journaled messages after a restart. Returns the number
	/// of messages recovered. Messages that were in flight when the
	/// process died come back as deliverable, which is where the
	/// at-least-once guarantee comes from.
	pub async fn recover(&self) -> Result<usize, QueueError> {
		let ids = self
			.inner
			.storage
			.list_ids(StorageKey::QueueMessages, "")
			.await?;

		let now = current_timestamp_millis();
		let mut state = self.inner.state.lock().await;
		let mut recovered = 0;
		for id in ids {
			let message: StoredMessage = self
				.inner
				.storage
				.retrieve(StorageKey::QueueMessages, &id)
				.await?;
			let topic = state.topics.entry(message.topic.clone()).or_default();
			topic.next_seq = topic.next_seq.max(message.seq + 1);
			topic.slots.insert(
				message.seq,
				Slot {
					message,
					status: SlotStatus::Ready { available_at: now },
				},
			);
			recovered += 1;
		}
		drop(state);

		if recovered > 0 {
			debug!(recovered, "Recovered journaled queue messages");
			self.inner.notify.notify_waiters();
		}
		Ok(recovered)
	}

	/// Publishes a message. The journal write completes before the
	/// message becomes visible to subscribers.
	pub async fn publish(
		&self,
		topic: &str,
		key: &str,
		payload: Vec<u8>,
	) -> Result<String, QueueError> {
		let seq = {
			let mut state = self.inner.state.lock().await;
			let topic_state = state.topics.entry(topic.to_string()).or_default();
			let seq = topic_state.next_seq;
			topic_state.next_seq += 1;
			seq
		};

		let message = StoredMessage {
			id: uuid::Uuid::new_v4().to_string(),
			topic: topic.to_string(),
			key: key.to_string(),
			payload,
			attempts: 0,
			published_at: current_timestamp(),
			seq,
		};

		self.inner
			.storage
			.store(
				StorageKey::QueueMessages,
				&Inner::journal_id(topic, seq),
				&message,
				None,
			)
			.await?;

		let id = message.id.clone();
		{
			let mut state = self.inner.state.lock().await;
			let topic_state = state.topics.entry(topic.to_string()).or_default();
			topic_state.slots.insert(
				seq,
				Slot {
					message,
					status: SlotStatus::Ready { available_at: 0 },
				},
			);
		}
		self.inner.notify.notify_waiters();
		Ok(id)
	}

	/// Creates a subscription on a topic. Subscriptions sharing a topic
	/// compete for its messages; the group name identifies the consumer
	/// in logs and diagnostics.
	pub fn subscribe(&self, topic: &str, group: &str) -> Subscription {
		Subscription {
			inner: self.inner.clone(),
			topic: topic.to_string(),
			group: group.to_string(),
		}
	}

	/// Lists dead-lettered messages for a topic.
	pub async fn dead_letters(&self, topic: &str) -> Result<Vec<StoredMessage>, QueueError> {
		let ids = self
			.inner
			.storage
			.list_ids(StorageKey::QueueDeadLetters, &format!("{}:", topic))
			.await?;
		let mut messages = Vec::with_capacity(ids.len());
		for id in ids {
			messages.push(
				self.inner
					.storage
					.retrieve(StorageKey::QueueDeadLetters, &id)
					.await?,
			);
		}
		Ok(messages)
	}
}

/// A message handed to a consumer. Must be settled with
/// [`ack`](Self::ack) or [`nack`](Self::nack); an unsettled delivery is
/// redelivered after the ack timeout.
#[derive(Debug)]
pub struct Delivery {
	message: StoredMessage,
	topic: String,
	seq: u64,
}

impl Delivery {
	pub fn message(&self) -> &StoredMessage {
		&self.message
	}

	pub fn payload(&self) -> &[u8] {
		&self.message.payload
	}
}

/// A subscription on one topic.
pub struct Subscription {
	inner: Arc<Inner>,
	topic: String,
	group: String,
}

impl Subscription {
	pub fn topic(&self) -> &str {
		&self.topic
	}

	pub fn group(&self) -> &str {
		&self.group
	}

	/// Waits for the next deliverable message on the topic.
	///
	/// Enforces per-key ordering: a message is held back while an
	/// earlier message with the same key is still live. Also promotes
	/// timed-out in-flight deliveries back to deliverable, dead-lettering
	/// them when their attempts are exhausted.
	pub async fn recv(&self) -> Result<Delivery, QueueError> {
		loop {
			// Register for wakeups before scanning, so a publish racing
			// with the scan is not lost
			let notified = self.inner.notify.notified();
			tokio::pin!(notified);
			notified.as_mut().enable();

			let now = current_timestamp_millis();
			let mut expired: Vec<StoredMessage> = Vec::new();
			let mut wake_at: Option<u64> = None;
			let mut delivery: Option<Delivery> = None;

			{
				let mut state = self.inner.state.lock().await;
				if let Some(topic_state) = state.topics.get_mut(&self.topic) {
					// Promote timed-out in-flight deliveries
					let mut exhausted: Vec<u64> = Vec::new();
					for (seq, slot) in topic_state.slots.iter_mut() {
						if let SlotStatus::InFlight { deadline } = slot.status {
							if deadline <= now {
								slot.message.attempts += 1;
								if slot.message.attempts >= self.inner.config.max_attempts {
									exhausted.push(*seq);
								} else {
									let backoff =
										self.inner.config.backoff(slot.message.attempts);
									slot.status = SlotStatus::Ready {
										available_at: now + backoff,
									};
								}
							}
						}
					}
					for seq in exhausted {
						if let Some(slot) = topic_state.slots.remove(&seq) {
							expired.push(slot.message);
						}
					}

					// Scan in sequence order for the next deliverable
					// message, holding back keys with a live predecessor
					let mut held_keys: HashSet<String> = HashSet::new();
					let mut chosen: Option<u64> = None;
					for (seq, slot) in topic_state.slots.iter() {
						if held_keys.contains(&slot.message.key) {
							continue;
						}
						match slot.status {
							SlotStatus::Ready { available_at } if available_at <= now => {
								chosen = Some(*seq);
								break;
							},
							SlotStatus::Ready { available_at } => {
								wake_at = Some(wake_at.map_or(available_at, |w: u64| w.min(available_at)));
							},
							SlotStatus::InFlight { deadline } => {
								wake_at = Some(wake_at.map_or(deadline, |w: u64| w.min(deadline)));
							},
						}
						held_keys.insert(slot.message.key.clone());
					}

					if let Some(seq) = chosen {
						if let Some(slot) = topic_state.slots.get_mut(&seq) {
							slot.status = SlotStatus::InFlight {
								deadline: now + self.inner.config.ack_timeout_ms,
							};
							delivery = Some(Delivery {
								message: slot.message.clone(),
								topic: self.topic.clone(),
								seq,
							});
						}
					}
				}
			}

			for message in expired {
				self.inner.dead_letter(&message).await?;
			}

			if let Some(delivery) = delivery {
				debug!(
					topic = %self.topic,
					group = %self.group,
					message_id = %delivery.message.id,
					attempts = delivery.message.attempts,
					"Delivering message"
				);
				return Ok(delivery);
			}

			let sleep_ms = wake_at
				.map(|at| at.saturating_sub(now).max(1))
				.unwrap_or(60_000);
			tokio::select! {
				_ = &mut notified => {},
				_ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {},
			}
		}
	}

	/// Acknowledges a delivery: the message is done and its journal row
	/// is removed. Unblocks the next message with the same key.
	pub async fn ack(&self, delivery: Delivery) -> Result<(), QueueError> {
		{
			let mut state = self.inner.state.lock().await;
			if let Some(topic_state) = state.topics.get_mut(&delivery.topic) {
				topic_state.slots.remove(&delivery.seq);
			}
		}
		self.inner
			.storage
			.remove(
				StorageKey::QueueMessages,
				&Inner::journal_id(&delivery.topic, delivery.seq),
			)
			.await?;
		self.inner.notify.notify_waiters();
		Ok(())
	}

	/// Rejects a delivery. The message is redelivered after a backoff,
	/// or dead-lettered once its attempts are exhausted.
	pub async fn nack(&self, delivery: Delivery) -> Result<(), QueueError> {
		let now = current_timestamp_millis();
		let mut exhausted: Option<StoredMessage> = None;
		{
			let mut state = self.inner.state.lock().await;
			if let Some(topic_state) = state.topics.get_mut(&delivery.topic) {
				if let Some(slot) = topic_state.slots.get_mut(&delivery.seq) {
					slot.message.attempts += 1;
					if slot.message.attempts >= self.inner.config.max_attempts {
						if let Some(slot) = topic_state.slots.remove(&delivery.seq) {
							exhausted = Some(slot.message);
						}
					} else {
						let backoff = self.inner.config.backoff(slot.message.attempts);
						slot.status = SlotStatus::Ready {
							available_at: now + backoff,
						};
					}
				}
			}
		}

		if let Some(message) = exhausted {
			self.inner.dead_letter(&message).await?;
		}
		self.inner.notify.notify_waiters();
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use mealflow_storage::implementations::memory::MemoryStorage;
	use tokio::time::timeout;

	fn queue_with(config: QueueConfig) -> (MessageQueue, Arc<StorageService>) {
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		(MessageQueue::new(storage.clone(), config), storage)
	}

	fn fast_config() -> QueueConfig {
		QueueConfig {
			max_attempts: 3,
			initial_backoff_ms: 5,
			max_backoff_ms: 20,
			ack_timeout_ms: 10_000,
		}
	}

	async fn recv_soon(sub: &Subscription) -> Delivery {
		timeout(Duration::from_secs(2), sub.recv())
			.await
			.expect("expected a delivery")
			.unwrap()
	}

	async fn assert_empty(sub: &Subscription) {
		assert!(timeout(Duration::from_millis(100), sub.recv()).await.is_err());
	}

	#[tokio::test]
	async fn publish_recv_ack_removes_journal_row() {
		let (queue, storage) = queue_with(fast_config());
		let sub = queue.subscribe("order.preparing", "test");

		queue
			.publish("order.preparing", "o-1", b"hello".to_vec())
			.await
			.unwrap();
		assert!(!storage
			.list_ids(StorageKey::QueueMessages, "")
			.await
			.unwrap()
			.is_empty());

		let delivery = recv_soon(&sub).await;
		assert_eq!(delivery.payload(), b"hello");
		sub.ack(delivery).await.unwrap();

		assert!(storage
			.list_ids(StorageKey::QueueMessages, "")
			.await
			.unwrap()
			.is_empty());
		assert_empty(&sub).await;
	}

	#[tokio::test]
	async fn nack_redelivers_until_dead_lettered() {
		let (queue, _storage) = queue_with(fast_config());
		let sub = queue.subscribe("order.preparing", "test");

		queue
			.publish("order.preparing", "o-1", b"poison".to_vec())
			.await
			.unwrap();
		queue
			.publish("order.preparing", "o-2", b"good".to_vec())
			.await
			.unwrap();

		// max_attempts = 3: three failed deliveries, then dead letter
		let mut nacks = 0;
		while nacks < 3 {
			let delivery = recv_soon(&sub).await;
			// o-2 may interleave; only nack the poison message
			if delivery.message().key == "o-2" {
				sub.ack(delivery).await.unwrap();
				continue;
			}
			assert_eq!(delivery.message().attempts, nacks);
			sub.nack(delivery).await.unwrap();
			nacks += 1;
		}

		// The poison message must be gone; only o-2 may remain
		loop {
			match timeout(Duration::from_millis(200), sub.recv()).await {
				Ok(Ok(delivery)) => {
					assert_eq!(delivery.message().key, "o-2");
					sub.ack(delivery).await.unwrap();
				},
				_ => break,
			}
		}

		let dead = queue.dead_letters("order.preparing").await.unwrap();
		assert_eq!(dead.len(), 1);
		assert_eq!(dead[0].key, "o-1");
		assert_eq!(dead[0].attempts, 3);
	}

	#[tokio::test]
	async fn same_key_messages_are_held_back() {
		let (queue, _storage) = queue_with(fast_config());
		let sub = queue.subscribe("order.preparing", "test");

		queue
			.publish("order.preparing", "o-1", b"first".to_vec())
			.await
			.unwrap();
		queue
			.publish("order.preparing", "o-1", b"second".to_vec())
			.await
			.unwrap();
		queue
			.publish("order.preparing", "o-2", b"other".to_vec())
			.await
			.unwrap();

		let first = recv_soon(&sub).await;
		assert_eq!(first.payload(), b"first");

		// o-1's second message is blocked, but o-2 is not
		let other = recv_soon(&sub).await;
		assert_eq!(other.payload(), b"other");
		assert_empty(&sub).await;

		sub.ack(first).await.unwrap();
		let second = recv_soon(&sub).await;
		assert_eq!(second.payload(), b"second");

		sub.ack(second).await.unwrap();
		sub.ack(other).await.unwrap();
	}

	#[tokio::test]
	async fn recovery_replays_unacked_messages_in_order() {
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		{
			let queue = MessageQueue::new(storage.clone(), fast_config());
			queue
				.publish("order.preparing", "o-1", b"first".to_vec())
				.await
				.unwrap();
			queue
				.publish("order.preparing", "o-1", b"second".to_vec())
				.await
				.unwrap();

			// Deliver but never ack the first message
			let sub = queue.subscribe("order.preparing", "test");
			let _unacked = recv_soon(&sub).await;
		}

		let queue = MessageQueue::new(storage, fast_config());
		assert_eq!(queue.recover().await.unwrap(), 2);

		let sub = queue.subscribe("order.preparing", "test");
		let first = recv_soon(&sub).await;
		assert_eq!(first.payload(), b"first");
		sub.ack(first).await.unwrap();
		let second = recv_soon(&sub).await;
		assert_eq!(second.payload(), b"second");
		sub.ack(second).await.unwrap();
	}

	#[tokio::test]
	async fn ack_timeout_triggers_redelivery() {
		let (queue, _storage) = queue_with(QueueConfig {
			max_attempts: 5,
			initial_backoff_ms: 1,
			max_backoff_ms: 5,
			ack_timeout_ms: 20,
		});
		let sub = queue.subscribe("order.preparing", "test");

		queue
			.publish("order.preparing", "o-1", b"slow".to_vec())
			.await
			.unwrap();

		// Take delivery and let it time out instead of acking
		let lost = recv_soon(&sub).await;
		drop(lost);

		let redelivered = recv_soon(&sub).await;
		assert_eq!(redelivered.payload(), b"slow");
		assert_eq!(redelivered.message().attempts, 1);
		sub.ack(redelivered).await.unwrap();
	}
}
