//! Notification event types.
//!
//! A `NotificationEvent` is the immutable fact describing a completed
//! order transition. Events are written to the transactional outbox in
//! the same commit as the status change, relayed onto the durable queue
//! and consumed asynchronously, possibly more than once.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::OrderStatus;

/// Queue topic for email-verification notifications (order placed).
pub const TOPIC_EMAIL_VERIFICATION: &str = "user.email-verification";
/// Queue topic for order-pending notifications.
pub const TOPIC_ORDER_PENDING: &str = "order.pending";
/// Queue topic for order-preparing notifications.
pub const TOPIC_ORDER_PREPARING: &str = "order.preparing";
/// Queue topic for order-delivering notifications.
pub const TOPIC_ORDER_DELIVERING: &str = "order.delivering";
/// Queue topic for order-completed notifications.
pub const TOPIC_ORDER_COMPLETED: &str = "order.completed";
/// Queue topic for order-cancelled notifications.
pub const TOPIC_ORDER_CANCELLED: &str = "order.cancelled";

/// Immutable fact describing a completed order transition.
///
/// Created exactly once per accepted transition by the state machine,
/// consumed possibly multiple times (at-least-once delivery) by zero or
/// more consumers, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationEvent {
	/// Unique event identifier, used as the consumer-side dedup key and
	/// as the deterministic idempotency key for downstream side effects.
	pub event_id: String,
	/// The order the transition belongs to.
	pub order_id: String,
	/// Status before the transition. `None` for order creation.
	pub from_status: Option<OrderStatus>,
	/// Status after the transition.
	pub to_status: OrderStatus,
	/// Commit timestamp (Unix seconds).
	pub occurred_at: u64,
	/// Denormalized fields consumers need, so they never have to call
	/// back into the order store synchronously.
	pub payload: NotificationPayload,
}

/// Denormalized order summary carried inside every notification event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationPayload {
	/// Recipient of any user-facing notification.
	pub user_id: String,
	/// Restaurant the order was placed with.
	pub restaurant_id: String,
	/// Total price snapshot at commit time.
	pub total_price: Decimal,
}

impl NotificationEvent {
	/// Queue topic this event is published to, derived from the status
	/// the order arrived at. One topic per notification concern.
	pub fn topic(&self) -> &'static str {
		match self.to_status {
			OrderStatus::Waiting => TOPIC_EMAIL_VERIFICATION,
			OrderStatus::Pending => TOPIC_ORDER_PENDING,
			OrderStatus::Preparing => TOPIC_ORDER_PREPARING,
			OrderStatus::Delivering => TOPIC_ORDER_DELIVERING,
			OrderStatus::Completed => TOPIC_ORDER_COMPLETED,
			OrderStatus::Cancelled => TOPIC_ORDER_CANCELLED,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn topic_follows_target_status() {
		let event = NotificationEvent {
			event_id: "e-1".into(),
			order_id: "o-1".into(),
			from_status: Some(OrderStatus::Pending),
			to_status: OrderStatus::Preparing,
			occurred_at: 0,
			payload: NotificationPayload {
				user_id: "u-1".into(),
				restaurant_id: "r-1".into(),
				total_price: Decimal::ZERO,
			},
		};
		assert_eq!(event.topic(), TOPIC_ORDER_PREPARING);
	}
}
