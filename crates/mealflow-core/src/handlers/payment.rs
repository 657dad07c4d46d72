//! Payment handler.
//!
//! Entry point for the order-facing operations: placing orders,
//! initiating payment, cancelling, and applying gateway status reports.
//! All state mutation funnels through the order state machine; this
//! layer adds ownership checks, input validation, the gateway adapter
//! call, and the bounded retry against optimistic-concurrency races.

use crate::state::order::OrderStateMachine;
use crate::CoreError;
use mealflow_gateway::PaymentGatewayService;
use mealflow_types::{
	current_timestamp, truncate_id, CreateOrderRequest, GatewayAck, GatewaySignal, Order,
	OrderStatus, Principal, TransitionEvent,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Rounds to spend on a CAS race before giving up. Races resolve in one
/// re-read in practice; repeated conflicts mean the caller should back
/// off and retry the whole request.
const CAS_ATTEMPTS: u32 = 3;

/// Coordinates order operations between callers, the state machine and
/// the payment gateway.
pub struct PaymentHandler {
	state: Arc<OrderStateMachine>,
	gateway: Arc<PaymentGatewayService>,
}

impl PaymentHandler {
	pub fn new(state: Arc<OrderStateMachine>, gateway: Arc<PaymentGatewayService>) -> Self {
		Self { state, gateway }
	}

	/// Places a new order for the calling diner.
	#[instrument(skip_all, fields(user_id = %truncate_id(&principal.user_id)))]
	pub async fn create_order(
		&self,
		principal: &Principal,
		request: CreateOrderRequest,
	) -> Result<Order, CoreError> {
		if request.item_quantity == 0 {
			return Err(CoreError::Validation(
				"item quantity must be at least 1".into(),
			));
		}
		if request.item_price <= Decimal::ZERO {
			return Err(CoreError::Validation(
				"item price must be positive".into(),
			));
		}
		if request.restaurant_id.is_empty() || request.menu_id.is_empty() {
			return Err(CoreError::Validation(
				"restaurant and menu ids must be non-empty".into(),
			));
		}

		let now = current_timestamp();
		let order = Order {
			id: uuid::Uuid::new_v4().to_string(),
			user_id: principal.user_id.clone(),
			restaurant_id: request.restaurant_id,
			menu_id: request.menu_id,
			item_quantity: request.item_quantity,
			item_price: request.item_price,
			status: OrderStatus::Waiting,
			payment_token: None,
			created_at: now,
			updated_at: now,
		};
		self.state.create_order(&order).await?;
		info!(order_id = %truncate_id(&order.id), "Order created");
		Ok(order)
	}

	/// Fetches a single order, enforcing ownership.
	pub async fn get_order(
		&self,
		principal: &Principal,
		order_id: &str,
	) -> Result<Order, CoreError> {
		let order = self.state.get_order(order_id).await?;
		if !principal.owns(&order.user_id) {
			return Err(CoreError::Forbidden);
		}
		Ok(order)
	}

	/// Lists the calling diner's orders, oldest first.
	pub async fn list_orders(&self, principal: &Principal) -> Result<Vec<Order>, CoreError> {
		self.state.list_orders_by_user(&principal.user_id).await
	}

	/// Issues a payment token for an order and moves it to `Pending`.
	///
	/// Idempotent: re-invocation on a `Pending` order returns the token
	/// already on file without touching the gateway again.
	#[instrument(skip_all, fields(order_id = %truncate_id(order_id)))]
	pub async fn initiate_payment(
		&self,
		principal: &Principal,
		order_id: &str,
	) -> Result<(String, Order), CoreError> {
		let order = self.get_order(principal, order_id).await?;
		if let (OrderStatus::Pending, Some(token)) = (order.status, &order.payment_token) {
			return Ok((token.clone(), order));
		}
		if order.status != OrderStatus::Waiting {
			return Err(CoreError::InvalidTransition {
				from: order.status,
				event: "payment-initiated",
			});
		}

		// Token first, transition second: a crash in between leaves a
		// Waiting order with a stored token, which the retry path and
		// the sweep both recover from.
		let token = self.gateway.issue_token(order_id).await?;
		let order = self
			.apply_with_retry(
				order_id,
				&TransitionEvent::PaymentInitiated {
					token: token.clone(),
				},
				Some(principal),
			)
			.await?;
		Ok((token, order))
	}

	/// Cancels an order on behalf of its owner.
	#[instrument(skip_all, fields(order_id = %truncate_id(order_id)))]
	pub async fn cancel_order(
		&self,
		principal: &Principal,
		order_id: &str,
	) -> Result<Order, CoreError> {
		self.get_order(principal, order_id).await?;
		self.apply_with_retry(order_id, &TransitionEvent::Cancel, Some(principal))
			.await
	}

	/// Applies a settled gateway status report to its order.
	///
	/// The single entry point for both webhook deliveries and active
	/// polls. Gateways redeliver freely, so anything already reflected
	/// in the order answers `Duplicate`; signals that cannot be matched
	/// or applied are persisted to the dead-letter store and answered
	/// `DeadLettered`, never retried against the gateway.
	#[instrument(skip_all, fields(order_id = %truncate_id(&signal.order_id), status = %signal.status))]
	pub async fn record_gateway_status(
		&self,
		signal: &GatewaySignal,
	) -> Result<GatewayAck, CoreError> {
		if !signal.status.is_settled() {
			return Ok(GatewayAck::Duplicate);
		}

		let event = TransitionEvent::GatewayConfirmed {
			status: signal.status,
			reference: signal.reference.clone(),
		};
		let target = event.target();

		for _ in 0..CAS_ATTEMPTS {
			let order = match self.state.get_order(&signal.order_id).await {
				Ok(order) => order,
				Err(CoreError::NotFound) => {
					self.dead_letter(signal, "unknown order").await?;
					return Ok(GatewayAck::DeadLettered);
				},
				Err(e) => return Err(e),
			};

			// Terminal orders and orders already at or past the implied
			// status have nothing left to learn from this signal
			if order.status.is_terminal()
				|| order.status.progress_rank() >= target.progress_rank()
			{
				return Ok(GatewayAck::Duplicate);
			}

			match self.state.apply_transition(&signal.order_id, &event, None).await {
				Ok(_) => return Ok(GatewayAck::Applied),
				Err(CoreError::ConcurrentModification) => continue,
				Err(CoreError::InvalidTransition { from, .. }) => {
					self.dead_letter(
						signal,
						&format!("no transition from {} for settled status", from),
					)
					.await?;
					return Ok(GatewayAck::DeadLettered);
				},
				Err(e) => return Err(e),
			}
		}
		Err(CoreError::ConcurrentModification)
	}

	async fn dead_letter(&self, signal: &GatewaySignal, reason: &str) -> Result<(), CoreError> {
		warn!(
			order_id = %truncate_id(&signal.order_id),
			reason = %reason,
			"Gateway signal dead-lettered"
		);
		let payload = serde_json::to_string(signal)
			.map_err(|e| CoreError::Storage(e.to_string()))?;
		self.gateway
			.record_dead_letter(&signal.reference, &payload, reason)
			.await?;
		Ok(())
	}

	async fn apply_with_retry(
		&self,
		order_id: &str,
		event: &TransitionEvent,
		principal: Option<&Principal>,
	) -> Result<Order, CoreError> {
		for _ in 0..CAS_ATTEMPTS {
			match self.state.apply_transition(order_id, event, principal).await {
				Err(CoreError::ConcurrentModification) => continue,
				other => return other,
			}
		}
		Err(CoreError::ConcurrentModification)
	}
}
