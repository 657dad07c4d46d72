//! Pending-order reconciliation sweep.
//!
//! Gateways lose webhooks. Orders that sit in `Pending` past a staleness
//! threshold are polled directly, and any settled answer is fed through
//! the same idempotent entry point the webhook path uses, so the two
//! delivery paths can never disagree.

use crate::handlers::payment::PaymentHandler;
use crate::CoreError;
use mealflow_gateway::PaymentGatewayService;
use mealflow_storage::StorageService;
use mealflow_types::{
	current_timestamp, truncate_id, GatewayAck, GatewaySignal, Order, OrderStatus, StorageKey,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Periodically reconciles stale `Pending` orders against the gateway.
pub struct PendingSweep {
	storage: Arc<StorageService>,
	gateway: Arc<PaymentGatewayService>,
	handler: Arc<PaymentHandler>,
	interval: Duration,
	stale_after: Duration,
}

impl PendingSweep {
	pub fn new(
		storage: Arc<StorageService>,
		gateway: Arc<PaymentGatewayService>,
		handler: Arc<PaymentHandler>,
		interval: Duration,
		stale_after: Duration,
	) -> Self {
		Self {
			storage,
			gateway,
			handler,
			interval,
			stale_after,
		}
	}

	/// Runs one reconciliation pass. Returns the number of orders whose
	/// settled status was applied.
	pub async fn sweep_once(&self) -> Result<usize, CoreError> {
		let cutoff = current_timestamp().saturating_sub(self.stale_after.as_secs());
		let ids = self.storage.list_ids(StorageKey::Orders, "").await?;

		let mut applied = 0;
		for id in ids {
			let order: Order = match self.storage.retrieve(StorageKey::Orders, &id).await {
				Ok(order) => order,
				// Deleted or corrupted rows never block the sweep
				Err(e) => {
					warn!(order_id = %truncate_id(&id), error = %e, "Skipping unreadable order");
					continue;
				},
			};
			if order.status != OrderStatus::Pending || order.updated_at > cutoff {
				continue;
			}

			let status = match self.gateway.poll_status(&order.id).await {
				Ok(status) => status,
				Err(e) => {
					warn!(order_id = %truncate_id(&order.id), error = %e, "Poll failed");
					continue;
				},
			};
			if !status.is_settled() {
				debug!(order_id = %truncate_id(&order.id), "Still unsettled at the gateway");
				continue;
			}

			let reference = order
				.payment_token
				.clone()
				.unwrap_or_else(|| format!("poll:{}", order.id));
			let ack = self
				.handler
				.record_gateway_status(&GatewaySignal {
					order_id: order.id.clone(),
					status,
					reference,
				})
				.await?;
			if ack == GatewayAck::Applied {
				info!(
					order_id = %truncate_id(&order.id),
					status = %status,
					"Reconciled stale pending order"
				);
				applied += 1;
			}
		}
		Ok(applied)
	}

	/// Runs the sweep loop until shutdown is signalled.
	pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
		let mut ticker = tokio::time::interval(self.interval);
		loop {
			tokio::select! {
				_ = ticker.tick() => {
					match self.sweep_once().await {
						Ok(0) => {},
						Ok(n) => info!(count = n, "Sweep reconciled stale orders"),
						Err(e) => error!(error = %e, "Sweep pass failed"),
					}
				}
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						info!("Sweep shutting down");
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
	use async_trait::async_trait;
	use mealflow_gateway::implementations::mock::MockGateway;
	use mealflow_gateway::{GatewayError, PaymentGatewayInterface, RetryConfig};
	use mealflow_storage::implementations::memory::MemoryStorage;
	use mealflow_types::{
		ConfigSchema, CreateOrderRequest, GatewayTransactionStatus, PaymentToken, Principal,
	};
	use rust_decimal::Decimal;

	/// Shares one mock between the test and the boxed service.
	struct SharedMock(Arc<MockGateway>);

	#[async_trait]
	impl PaymentGatewayInterface for SharedMock {
		async fn create_transaction(
			&self,
			order_id: &str,
			amount: Decimal,
		) -> Result<PaymentToken, GatewayError> {
			self.0.create_transaction(order_id, amount).await
		}

		async fn fetch_status(
			&self,
			order_id: &str,
		) -> Result<GatewayTransactionStatus, GatewayError> {
			self.0.fetch_status(order_id).await
		}

		fn config_schema(&self) -> Box<dyn ConfigSchema> {
			self.0.config_schema()
		}
	}

	fn setup(stale_after: Duration) -> (PendingSweep, Arc<PaymentHandler>, Arc<MockGateway>) {
		let storage = Arc::new(StorageService::new(Box::new(MemoryStorage::new())));
		let mock = Arc::new(MockGateway::new());
		let gateway = Arc::new(PaymentGatewayService::new(
			Box::new(SharedMock(mock.clone())),
			storage.clone(),
			RetryConfig::default(),
		));
		let state = Arc::new(OrderStateMachine::new(storage.clone()));
		let handler = Arc::new(PaymentHandler::new(state, gateway.clone()));
		let sweep = PendingSweep::new(
			storage,
			gateway,
			handler.clone(),
			Duration::from_secs(60),
			stale_after,
		);
		(sweep, handler, mock)
	}

	async fn pending_order(handler: &PaymentHandler) -> String {
		let principal = Principal::new("u-1");
		let order = handler
			.create_order(
				&principal,
				CreateOrderRequest {
					restaurant_id: "r-1".into(),
					menu_id: "m-1".into(),
					item_quantity: 1,
					item_price: "10.00".parse().unwrap(),
				},
			)
			.await
			.unwrap();
		handler.initiate_payment(&principal, &order.id).await.unwrap();
		order.id
	}

	#[tokio::test]
	async fn settled_status_is_applied_to_stale_orders() {
		let (sweep, handler, mock) = setup(Duration::ZERO);
		let order_id = pending_order(&handler).await;
		mock.set_status(&order_id, GatewayTransactionStatus::Success);

		assert_eq!(sweep.sweep_once().await.unwrap(), 1);
		let order = handler
			.get_order(&Principal::new("u-1"), &order_id)
			.await
			.unwrap();
		assert_eq!(order.status, OrderStatus::Preparing);

		// Already reconciled; the next pass finds nothing pending
		assert_eq!(sweep.sweep_once().await.unwrap(), 0);
	}

	#[tokio::test]
	async fn unsettled_orders_are_left_alone() {
		let (sweep, handler, _mock) = setup(Duration::ZERO);
		let order_id = pending_order(&handler).await;

		// Mock reports Pending for unscripted orders
		assert_eq!(sweep.sweep_once().await.unwrap(), 0);
		let order = handler
			.get_order(&Principal::new("u-1"), &order_id)
			.await
			.unwrap();
		assert_eq!(order.status, OrderStatus::Pending);
	}

	#[tokio::test]
	async fn fresh_pending_orders_are_not_polled() {
		let (sweep, handler, mock) = setup(Duration::from_secs(900));
		let order_id = pending_order(&handler).await;
		mock.set_status(&order_id, GatewayTransactionStatus::Success);

		// Updated moments ago, well inside the staleness window
		assert_eq!(sweep.sweep_once().await.unwrap(), 0);
	}

	#[tokio::test]
	async fn expired_payment_cancels_via_the_sweep() {
		let (sweep, handler, mock) = setup(Duration::ZERO);
		let order_id = pending_order(&handler).await;
		mock.set_status(&order_id, GatewayTransactionStatus::Expired);

		assert_eq!(sweep.sweep_once().await.unwrap(), 1);
		let order = handler
			.get_order(&Principal::new("u-1"), &order_id)
			.await
			.unwrap();
		assert_eq!(order.status, OrderStatus::Cancelled);
	}
}
