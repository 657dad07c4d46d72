//! Order-preparing consumer.

use super::{NotificationConsumer, Notifier};
use crate::CoreError;
use async_trait::async_trait;
use mealflow_types::{NotificationEvent, TOPIC_ORDER_PREPARING};
use std::sync::Arc;

/// Tells a diner their payment went through and the kitchen started on
/// their order.
pub struct OrderPreparingConsumer {
	notifier: Arc<dyn Notifier>,
}

impl OrderPreparingConsumer {
	pub fn new(notifier: Arc<dyn Notifier>) -> Self {
		Self { notifier }
	}
}

#[async_trait]
impl NotificationConsumer for OrderPreparingConsumer {
	fn name(&self) -> &'static str {
		"order-preparing"
	}

	fn topic(&self) -> &'static str {
		TOPIC_ORDER_PREPARING
	}

	async fn handle(&self, event: &NotificationEvent) -> Result<(), CoreError> {
		let message = format!(
			"Payment received. Restaurant {} is preparing your order {} ({}).",
			event.payload.restaurant_id, event.order_id, event.payload.total_price
		);
		self.notifier
			.send(
				&format!("{}:{}", self.name(), event.event_id),
				&event.payload.user_id,
				&message,
			)
			.await
	}
}
