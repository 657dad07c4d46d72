//! Email-verification consumer.

use super::{NotificationConsumer, Notifier};
use crate::CoreError;
use async_trait::async_trait;
use mealflow_types::{NotificationEvent, TOPIC_EMAIL_VERIFICATION};
use std::sync::Arc;

/// Asks a diner to verify their email address after placing an order.
/// Subscribed to the order-placed topic.
pub struct EmailVerificationConsumer {
	notifier: Arc<dyn Notifier>,
}

impl EmailVerificationConsumer {
	pub fn new(notifier: Arc<dyn Notifier>) -> Self {
		Self { notifier }
	}
}

#[async_trait]
impl NotificationConsumer for EmailVerificationConsumer {
	fn name(&self) -> &'static str {
		"email-verification"
	}

	fn topic(&self) -> &'static str {
		TOPIC_EMAIL_VERIFICATION
	}

	async fn handle(&self, event: &NotificationEvent) -> Result<(), CoreError> {
		let message = format!(
			"Your order {} was placed. Please verify your email address to continue.",
			event.order_id
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
