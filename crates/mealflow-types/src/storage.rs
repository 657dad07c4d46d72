//! Storage-related types for the mealflow system.

use std::str::FromStr;

/// Storage keys for different data collections.
///
/// This enum provides type safety for storage operations by replacing
/// string literals with strongly typed variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
	/// Key for storing order data
	Orders,
	/// Key for the per-user order index
	UserOrders,
	/// Key for per-transition audit entries
	Audit,
	/// Key for the transactional outbox rows awaiting publication
	Outbox,
	/// Key for journaled queue messages
	QueueMessages,
	/// Key for queue messages that exhausted their delivery attempts
	QueueDeadLetters,
	/// Key for unprocessable gateway signals kept for inspection
	GatewayDeadLetters,
	/// Key for consumer-side already-handled markers (bounded retention)
	ConsumerHandled,
}

impl StorageKey {
	/// Returns the string representation of the storage key.
	pub fn as_str(&self) -> &'static str {
		match self {
			StorageKey::Orders => "orders",
			StorageKey::UserOrders => "user_orders",
			StorageKey::Audit => "audit",
			StorageKey::Outbox => "outbox",
			StorageKey::QueueMessages => "queue_messages",
			StorageKey::QueueDeadLetters => "queue_dead_letters",
			StorageKey::GatewayDeadLetters => "gateway_dead_letters",
			StorageKey::ConsumerHandled => "consumer_handled",
		}
	}

	/// Returns an iterator over all StorageKey variants.
	pub fn all() -> impl Iterator<Item = Self> {
		[
			Self::Orders,
			Self::UserOrders,
			Self::Audit,
			Self::Outbox,
			Self::QueueMessages,
			Self::QueueDeadLetters,
			Self::GatewayDeadLetters,
			Self::ConsumerHandled,
		]
		.into_iter()
	}
}

impl FromStr for StorageKey {
	type Err = ();

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"orders" => Ok(Self::Orders),
			"user_orders" => Ok(Self::UserOrders),
			"audit" => Ok(Self::Audit),
			"outbox" => Ok(Self::Outbox),
			"queue_messages" => Ok(Self::QueueMessages),
			"queue_dead_letters" => Ok(Self::QueueDeadLetters),
			"gateway_dead_letters" => Ok(Self::GatewayDeadLetters),
			"consumer_handled" => Ok(Self::ConsumerHandled),
			_ => Err(()),
		}
	}
}

impl From<StorageKey> for &'static str {
	fn from(key: StorageKey) -> Self {
		key.as_str()
	}
}
