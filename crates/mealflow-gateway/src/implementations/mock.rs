//! Mock payment gateway implementation.
//!
//! In-process gateway for tests and development. Tokens are
//! deterministic per order id, transaction statuses can be scripted,
//! and a bounded number of transient failures can be injected to
//! exercise the retry policy.

use crate::{GatewayError, PaymentGatewayInterface};
use async_trait::async_trait;
use mealflow_types::{
	ConfigSchema, GatewayTransactionStatus, ImplementationRegistry, PaymentToken, Schema,
	ValidationError,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Mock gateway implementation.
pub struct MockGateway {
	/// Scripted status per order id. Orders without an entry report
	/// `Pending`.
	statuses: Mutex<HashMap<String, GatewayTransactionStatus>>,
	/// Number of upcoming create_transaction calls that fail
	/// transiently.
	failing_creates: AtomicU32,
	/// Count of create_transaction calls that reached the gateway.
	creates: AtomicU32,
}

impl MockGateway {
	/// Creates a new MockGateway.
	pub fn new() -> Self {
		Self {
			statuses: Mutex::new(HashMap::new()),
			failing_creates: AtomicU32::new(0),
			creates: AtomicU32::new(0),
		}
	}

	/// Scripts the status the gateway reports for an order.
	pub fn set_status(&self, order_id: &str, status: GatewayTransactionStatus) {
		if let Ok(mut statuses) = self.statuses.lock() {
			statuses.insert(order_id.to_string(), status);
		}
	}

	/// Makes the next `n` create_transaction calls fail transiently.
	pub fn fail_next_creates(&self, n: u32) {
		self.failing_creates.store(n, Ordering::SeqCst);
	}

	/// Number of create_transaction calls that succeeded.
	pub fn create_count(&self) -> u32 {
		self.creates.load(Ordering::SeqCst)
	}
}

impl Default for MockGateway {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl PaymentGatewayInterface for MockGateway {
	async fn create_transaction(
		&self,
		order_id: &str,
		_amount: Decimal,
	) -> Result<PaymentToken, GatewayError> {
		if self
			.failing_creates
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
			.is_ok()
		{
			return Err(GatewayError::Unavailable("injected failure".into()));
		}

		self.creates.fetch_add(1, Ordering::SeqCst);
		Ok(PaymentToken {
			token: format!("tok-{}", order_id),
			reference: format!("ref-{}", order_id),
		})
	}

	async fn fetch_status(&self, order_id: &str) -> Result<GatewayTransactionStatus, GatewayError> {
		let statuses = self
			.statuses
			.lock()
			.map_err(|_| GatewayError::Unavailable("mock lock poisoned".into()))?;
		Ok(statuses
			.get(order_id)
			.copied()
			.unwrap_or(GatewayTransactionStatus::Pending))
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(MockGatewaySchema)
	}
}

/// Configuration schema for MockGateway.
pub struct MockGatewaySchema;

impl ConfigSchema for MockGatewaySchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		// Mock gateway has no required configuration
		let schema = Schema::new(vec![], vec![]);
		schema.validate(config)
	}
}

/// Registry entry for the mock gateway implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "mock";
	type Factory = crate::GatewayFactory;

	fn factory() -> Self::Factory {
		create_gateway
	}
}

impl crate::GatewayRegistry for Registry {}

/// Factory function to create a mock gateway from configuration.
pub fn create_gateway(
	_config: &toml::Value,
) -> Result<Box<dyn PaymentGatewayInterface>, GatewayError> {
	Ok(Box::new(MockGateway::new()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn tokens_are_deterministic_per_order() {
		let gateway = MockGateway::new();
		let amount = Decimal::ONE;

		let first = gateway.create_transaction("o-1", amount).await.unwrap();
		let second = gateway.create_transaction("o-1", amount).await.unwrap();
		assert_eq!(first.token, second.token);
		assert_eq!(gateway.create_count(), 2);
	}

	#[tokio::test]
	async fn injected_failures_are_transient() {
		let gateway = MockGateway::new();
		gateway.fail_next_creates(1);

		let err = gateway
			.create_transaction("o-1", Decimal::ONE)
			.await
			.unwrap_err();
		assert!(err.is_transient());

		assert!(gateway.create_transaction("o-1", Decimal::ONE).await.is_ok());
	}

	#[tokio::test]
	async fn unscripted_status_reports_pending() {
		let gateway = MockGateway::new();
		assert_eq!(
			gateway.fetch_status("o-1").await.unwrap(),
			GatewayTransactionStatus::Pending
		);

		gateway.set_status("o-1", GatewayTransactionStatus::Success);
		assert_eq!(
			gateway.fetch_status("o-1").await.unwrap(),
			GatewayTransactionStatus::Success
		);
	}
}
