//! Payment gateway module for the mealflow order coordination system.
//!
//! This module wraps the external payment gateway behind a small trait
//! and layers the idempotency and retry policy the rest of the system
//! relies on: a payment token is issued at most once per order, and
//! transient gateway failures are retried under bounded exponential
//! backoff while hard rejections are surfaced immediately.

use async_trait::async_trait;
use mealflow_storage::{StorageError, StorageService};
use mealflow_types::{
	current_timestamp, truncate_id, ConfigSchema, GatewayTransactionStatus, ImplementationRegistry,
	Order, PaymentToken, StorageKey,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{instrument, warn};

/// Re-export implementations
pub mod implementations {
	pub mod http;
	pub mod mock;
}

/// Errors that can occur during payment gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
	/// The gateway could not be reached or answered with a server
	/// error. The outcome of the attempted operation is unknown and the
	/// operation may be retried.
	#[error("Gateway unavailable: {0}")]
	Unavailable(String),
	/// The gateway understood the request and refused it. Retrying the
	/// same request will not help.
	#[error("Gateway rejected request: {0}")]
	Rejected(String),
	/// The gateway answered with a payload this adapter cannot parse.
	#[error("Invalid gateway response: {0}")]
	InvalidResponse(String),
	/// Error reading or writing gateway-related state.
	#[error("Storage error: {0}")]
	Storage(String),
	/// The referenced order does not exist.
	#[error("Order not found")]
	OrderNotFound,
	/// Error that occurs during configuration validation.
	#[error("Configuration error: {0}")]
	Configuration(String),
}

impl GatewayError {
	/// Whether the operation that produced this error may be retried.
	pub fn is_transient(&self) -> bool {
		matches!(self, GatewayError::Unavailable(_))
	}
}

/// Trait defining the low-level interface to a payment gateway.
///
/// Implementations talk the gateway's own protocol; everything above
/// this trait deals only in [`PaymentToken`] and
/// [`GatewayTransactionStatus`].
#[async_trait]
pub trait PaymentGatewayInterface: Send + Sync {
	/// Creates a payment transaction for the given order and amount,
	/// returning the token the client completes payment with.
	async fn create_transaction(
		&self,
		order_id: &str,
		amount: Decimal,
	) -> Result<PaymentToken, GatewayError>;

	/// Actively fetches the gateway's current view of the transaction
	/// for an order. Used by the reconciliation sweep when no webhook
	/// arrived.
	async fn fetch_status(&self, order_id: &str) -> Result<GatewayTransactionStatus, GatewayError>;

	/// Returns the configuration schema for validation.
	fn config_schema(&self) -> Box<dyn ConfigSchema>;
}

/// Type alias for gateway factory functions.
pub type GatewayFactory = fn(&toml::Value) -> Result<Box<dyn PaymentGatewayInterface>, GatewayError>;

/// Registry trait for gateway implementations.
pub trait GatewayRegistry: ImplementationRegistry<Factory = GatewayFactory> {}

/// Get all registered gateway implementations.
pub fn get_all_implementations() -> Vec<(&'static str, GatewayFactory)> {
	use implementations::{http, mock};

	vec![
		(http::Registry::NAME, http::Registry::factory()),
		(mock::Registry::NAME, mock::Registry::factory()),
	]
}

/// Retry policy for transient gateway failures.
///
/// Delays grow exponentially from `initial_delay_ms` by `multiplier`
/// per attempt, capped at `max_delay_ms`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
	pub max_attempts: u32,
	pub initial_delay_ms: u64,
	pub max_delay_ms: u64,
	pub multiplier: f64,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			initial_delay_ms: 100,
			max_delay_ms: 5_000,
			multiplier: 2.0,
		}
	}
}

impl RetryConfig {
	/// Delay before the given zero-based retry attempt.
	pub fn delay_for(&self, attempt: u32) -> Duration {
		let factor = self.multiplier.powi(attempt as i32);
		let millis = (self.initial_delay_ms as f64 * factor) as u64;
		Duration::from_millis(millis.min(self.max_delay_ms))
	}
}

/// A gateway signal that could not be applied, kept for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
	/// Gateway reference or a generated id when none was present.
	pub reference: String,
	/// The raw payload as received.
	pub payload: String,
	/// Why the signal could not be applied.
	pub reason: String,
	/// Unix seconds at which the record was written.
	pub recorded_at: u64,
}

/// High-level payment gateway service.
///
/// Owns the `payment_token` field of orders: token issuance goes
/// through [`issue_token`](Self::issue_token) and nowhere else, which
/// is what makes it idempotent under concurrent calls.
pub struct PaymentGatewayService {
	implementation: Box<dyn PaymentGatewayInterface>,
	storage: Arc<StorageService>,
	retry: RetryConfig,
}

impl PaymentGatewayService {
	/// Creates a new PaymentGatewayService.
	pub fn new(
		implementation: Box<dyn PaymentGatewayInterface>,
		storage: Arc<StorageService>,
		retry: RetryConfig,
	) -> Self {
		Self {
			implementation,
			storage,
			retry,
		}
	}

	/// Returns the payment token for an order, issuing one from the
	/// gateway if the order does not have one yet.
	///
	/// Never double-issues: a stored token is returned as-is, and when
	/// two callers race on a token-less order the first committed write
	/// wins and the loser returns the winner's token.
	#[instrument(skip_all, fields(order_id = %truncate_id(order_id)))]
	pub async fn issue_token(&self, order_id: &str) -> Result<String, GatewayError> {
		// First writer wins; a handful of rounds is plenty since a
		// conflict means someone else just wrote the token.
		for _ in 0..3 {
			let mut order = self
				.storage
				.retrieve_versioned::<Order>(StorageKey::Orders, order_id)
				.await
				.map_err(storage_error)?;

			if let Some(token) = order.value.payment_token {
				return Ok(token);
			}

			let amount = order.value.total_price();
			let token = self.create_transaction_with_retry(order_id, amount).await?;

			order.value.payment_token = Some(token.token.clone());
			order.value.updated_at = current_timestamp();
			match self
				.storage
				.update(StorageKey::Orders, order_id, &order.value, order.version)
				.await
			{
				Ok(_) => return Ok(token.token),
				Err(StorageError::Conflict { .. }) => {
					// Re-read; the winner may have written the token
					continue;
				},
				Err(e) => return Err(storage_error(e)),
			}
		}

		Err(GatewayError::Unavailable(
			"Could not persist payment token under contention".into(),
		))
	}

	/// Polls the gateway for the transaction status of an order,
	/// retrying transient failures.
	pub async fn poll_status(&self, order_id: &str) -> Result<GatewayTransactionStatus, GatewayError> {
		self.with_retry(|| self.implementation.fetch_status(order_id))
			.await
	}

	/// Persists an unprocessable gateway signal for manual inspection.
	pub async fn record_dead_letter(
		&self,
		reference: &str,
		raw_payload: &str,
		reason: &str,
	) -> Result<(), GatewayError> {
		let record = DeadLetterRecord {
			reference: reference.to_string(),
			payload: raw_payload.to_string(),
			reason: reason.to_string(),
			recorded_at: current_timestamp(),
		};
		warn!(reference = %reference, reason = %reason, "Dead-lettering gateway signal");
		self.storage
			.store(StorageKey::GatewayDeadLetters, reference, &record, None)
			.await
			.map_err(storage_error)?;
		Ok(())
	}

	/// Lists all dead-lettered gateway signals.
	pub async fn list_dead_letters(&self) -> Result<Vec<DeadLetterRecord>, GatewayError> {
		let ids = self
			.storage
			.list_ids(StorageKey::GatewayDeadLetters, "")
			.await
			.map_err(storage_error)?;
		let mut records = Vec::with_capacity(ids.len());
		for id in ids {
			records.push(
				self.storage
					.retrieve(StorageKey::GatewayDeadLetters, &id)
					.await
					.map_err(storage_error)?,
			);
		}
		Ok(records)
	}

	async fn create_transaction_with_retry(
		&self,
		order_id: &str,
		amount: Decimal,
	) -> Result<PaymentToken, GatewayError> {
		self.with_retry(|| self.implementation.create_transaction(order_id, amount))
			.await
	}

	/// Runs a gateway call under the configured retry policy. Only
	/// transient errors are retried.
	async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, GatewayError>
	where
		F: Fn() -> Fut,
		Fut: std::future::Future<Output = Result<T, GatewayError>>,
	{
		let mut attempt = 0;
		loop {
			match op().await {
				Ok(value) => return Ok(value),
				Err(e) if e.is_transient() && attempt + 1 < self.retry.max_attempts => {
					let delay = self.retry.delay_for(attempt);
					warn!(
						attempt = attempt + 1,
						delay_ms = delay.as_millis() as u64,
						error = %e,
						"Transient gateway error, retrying"
					);
					tokio::time::sleep(delay).await;
					attempt += 1;
				},
				Err(e) => return Err(e),
			}
		}
	}
}

fn storage_error(e: StorageError) -> GatewayError {
	match e {
		StorageError::NotFound => GatewayError::OrderNotFound,
		other => GatewayError::Storage(other.to_string()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use implementations::mock::MockGateway;
	use mealflow_storage::implementations::memory::MemoryStorage;
	use mealflow_types::OrderStatus;

	fn test_order(id: &str) -> Order {
		Order {
			id: id.to_string(),
			user_id: "u-1".into(),
			restaurant_id: "r-1".into(),
			menu_id: "m-1".into(),
			item_quantity: 2,
			item_price: "12.50".parse().unwrap(),
			status: OrderStatus::Waiting,
			payment_token: None,
			created_at: 0,
			updated_at: 0,
		}
	}

	fn service(gateway: MockGateway) -> (PaymentGatewayService, Arc<StorageService>) {
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		let service = PaymentGatewayService::new(
			Box::new(gateway),
			storage.clone(),
			RetryConfig {
				initial_delay_ms: 1,
				..RetryConfig::default()
			},
		);
		(service, storage)
	}

	#[tokio::test]
	async fn issue_token_is_idempotent() {
		let (service, storage) = service(MockGateway::new());
		storage
			.create(StorageKey::Orders, "o-1", &test_order("o-1"), None)
			.await
			.unwrap();

		let first = service.issue_token("o-1").await.unwrap();
		let second = service.issue_token("o-1").await.unwrap();
		assert_eq!(first, second);

		let order: Order = storage.retrieve(StorageKey::Orders, "o-1").await.unwrap();
		assert_eq!(order.payment_token, Some(first));
	}

	#[tokio::test]
	async fn issue_token_retries_transient_failures() {
		let gateway = MockGateway::new();
		gateway.fail_next_creates(2);
		let (service, storage) = service(gateway);
		storage
			.create(StorageKey::Orders, "o-1", &test_order("o-1"), None)
			.await
			.unwrap();

		let token = service.issue_token("o-1").await.unwrap();
		assert!(!token.is_empty());
	}

	#[tokio::test]
	async fn issue_token_for_unknown_order_fails() {
		let (service, _storage) = service(MockGateway::new());
		let result = service.issue_token("nope").await;
		assert!(matches!(result, Err(GatewayError::OrderNotFound)));
	}

	#[tokio::test]
	async fn dead_letters_round_trip() {
		let (service, _storage) = service(MockGateway::new());
		service
			.record_dead_letter("ref-1", "{\"bogus\":true}", "unknown order")
			.await
			.unwrap();

		let records = service.list_dead_letters().await.unwrap();
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].reference, "ref-1");
		assert_eq!(records[0].reason, "unknown order");
	}

	#[test]
	fn retry_delays_are_capped() {
		let retry = RetryConfig {
			max_attempts: 10,
			initial_delay_ms: 100,
			max_delay_ms: 1_000,
			multiplier: 2.0,
		};
		assert_eq!(retry.delay_for(0), Duration::from_millis(100));
		assert_eq!(retry.delay_for(1), Duration::from_millis(200));
		assert_eq!(retry.delay_for(6), Duration::from_millis(1_000));
	}
}
