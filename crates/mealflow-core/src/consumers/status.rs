//! Generic status-update consumer.

use super::{NotificationConsumer, Notifier};
use crate::CoreError;
use async_trait::async_trait;
use mealflow_types::{
	NotificationEvent, OrderStatus, TOPIC_ORDER_CANCELLED, TOPIC_ORDER_COMPLETED,
	TOPIC_ORDER_DELIVERING, TOPIC_ORDER_PENDING,
};
use std::sync::Arc;

/// Sends a plain status-update notification for the lifecycle topics
/// that need no dedicated wording.
pub struct StatusUpdateConsumer {
	notifier: Arc<dyn Notifier>,
	topic: &'static str,
	name: &'static str,
}

impl StatusUpdateConsumer {
	pub fn pending(notifier: Arc<dyn Notifier>) -> Self {
		Self {
			notifier,
			topic: TOPIC_ORDER_PENDING,
			name: "status-update-pending",
		}
	}

	pub fn delivering(notifier: Arc<dyn Notifier>) -> Self {
		Self {
			notifier,
			topic: TOPIC_ORDER_DELIVERING,
			name: "status-update-delivering",
		}
	}

	pub fn completed(notifier: Arc<dyn Notifier>) -> Self {
		Self {
			notifier,
			topic: TOPIC_ORDER_COMPLETED,
			name: "status-update-completed",
		}
	}

	pub fn cancelled(notifier: Arc<dyn Notifier>) -> Self {
		Self {
			notifier,
			topic: TOPIC_ORDER_CANCELLED,
			name: "status-update-cancelled",
		}
	}

	fn message(&self, event: &NotificationEvent) -> String {
		match event.to_status {
			OrderStatus::Pending => {
				format!("Your order {} is awaiting payment.", event.order_id)
			},
			OrderStatus::Delivering => {
				format!("Your order {} is on its way.", event.order_id)
			},
			OrderStatus::Completed => {
				format!("Your order {} was delivered. Enjoy!", event.order_id)
			},
			OrderStatus::Cancelled => {
				format!("Your order {} was cancelled.", event.order_id)
			},
			other => format!("Your order {} is now {}.", event.order_id, other),
		}
	}
}

#[async_trait]
impl NotificationConsumer for StatusUpdateConsumer {
	fn name(&self) -> &'static str {
		self.name
	}

	fn topic(&self) -> &'static str {
		self.topic
	}

	async fn handle(&self, event: &NotificationEvent) -> Result<(), CoreError> {
		self.notifier
			.send(
				&format!("{}:{}", self.name, event.event_id),
				&event.payload.user_id,
				&self.message(event),
			)
			.await
	}
}
