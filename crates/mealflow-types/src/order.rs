//! Order types for the mealflow system.
//!
//! This module defines the order aggregate, its status enum and the
//! closed set of transition events the state machine accepts.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::GatewayTransactionStatus;

/// The order aggregate root.
///
/// An order is created in `Waiting` status and moves through its
/// lifecycle exclusively via the order state machine. Price and
/// quantity are snapshots taken at order time; menu changes never
/// retroactively alter an existing order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
	/// Unique identifier for this order.
	pub id: String,
	/// Identifier of the diner who placed the order.
	pub user_id: String,
	/// Identifier of the restaurant the order was placed with.
	pub restaurant_id: String,
	/// Identifier of the ordered menu item.
	pub menu_id: String,
	/// Number of items ordered. Always positive.
	pub item_quantity: u32,
	/// Unit price snapshot taken at order time.
	pub item_price: Decimal,
	/// Current status of the order.
	pub status: OrderStatus,
	/// Opaque payment token from the gateway, persisted once issued so
	/// re-issuance is never required for the same order.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub payment_token: Option<String>,
	/// Timestamp when this order was created (Unix seconds).
	pub created_at: u64,
	/// Timestamp when this order was last updated (Unix seconds).
	pub updated_at: u64,
}

impl Order {
	/// Total price, always recomputed from the stored snapshot fields.
	/// Never trusted from client input and never independently settable.
	pub fn total_price(&self) -> Decimal {
		self.item_price * Decimal::from(self.item_quantity)
	}
}

/// Status of an order in the mealflow system.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum OrderStatus {
	/// Order has been placed but payment has not started.
	Waiting,
	/// Payment token issued, awaiting gateway confirmation.
	Pending,
	/// Payment confirmed, the restaurant is preparing the order.
	Preparing,
	/// Order handed to a courier.
	Delivering,
	/// Order delivered. Terminal.
	Completed,
	/// Order cancelled by the diner or by a failed payment. Terminal.
	Cancelled,
}

impl OrderStatus {
	/// Returns true for statuses with no outgoing transitions.
	pub fn is_terminal(&self) -> bool {
		matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
	}

	/// Position on the happy path, used to detect duplicate gateway
	/// deliveries: a signal implying a status at or behind the current
	/// one is a redelivery, not an error. `Cancelled` sits outside the
	/// path and is handled via `is_terminal`.
	pub fn progress_rank(&self) -> u8 {
		match self {
			OrderStatus::Waiting => 0,
			OrderStatus::Pending => 1,
			OrderStatus::Preparing => 2,
			OrderStatus::Delivering => 3,
			OrderStatus::Completed => 4,
			OrderStatus::Cancelled => 5,
		}
	}
}

impl fmt::Display for OrderStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			OrderStatus::Waiting => write!(f, "Waiting"),
			OrderStatus::Pending => write!(f, "Pending"),
			OrderStatus::Preparing => write!(f, "Preparing"),
			OrderStatus::Delivering => write!(f, "Delivering"),
			OrderStatus::Completed => write!(f, "Completed"),
			OrderStatus::Cancelled => write!(f, "Cancelled"),
		}
	}
}

/// The closed set of inputs the order state machine accepts.
///
/// "Order again" is intentionally absent: it creates a new order and is
/// never a transition of an existing one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TransitionEvent {
	/// Diner-initiated cancellation.
	Cancel,
	/// A payment token was successfully issued for the order.
	PaymentInitiated {
		/// The token the gateway handed out, carried as evidence.
		token: String,
	},
	/// The gateway reported a terminal transaction status, delivered
	/// either via webhook or via an active poll.
	GatewayConfirmed {
		status: GatewayTransactionStatus,
		/// Gateway-assigned reference usable for deduplication.
		reference: String,
	},
	/// Restaurant-side signal that the order left the kitchen.
	KitchenReady,
	/// Courier-side signal that the order was delivered.
	DeliveryComplete,
}

impl TransitionEvent {
	/// The status this event drives an order towards, independent of
	/// the order's current status. Used for the already-in-target
	/// idempotence check.
	pub fn target(&self) -> OrderStatus {
		match self {
			TransitionEvent::Cancel => OrderStatus::Cancelled,
			TransitionEvent::PaymentInitiated { .. } => OrderStatus::Pending,
			TransitionEvent::GatewayConfirmed { status, .. } => match status {
				GatewayTransactionStatus::Success => OrderStatus::Preparing,
				_ => OrderStatus::Cancelled,
			},
			TransitionEvent::KitchenReady => OrderStatus::Delivering,
			TransitionEvent::DeliveryComplete => OrderStatus::Completed,
		}
	}

	/// Short name used in audit entries and logs.
	pub fn name(&self) -> &'static str {
		match self {
			TransitionEvent::Cancel => "cancel",
			TransitionEvent::PaymentInitiated { .. } => "payment-initiated",
			TransitionEvent::GatewayConfirmed { .. } => "gateway-confirmed",
			TransitionEvent::KitchenReady => "kitchen-ready",
			TransitionEvent::DeliveryComplete => "delivery-complete",
		}
	}
}

/// Audit entry recorded alongside every accepted transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
	/// The order this entry belongs to.
	pub order_id: String,
	/// Status before the transition. `None` for order creation.
	pub from_status: Option<OrderStatus>,
	/// Status after the transition.
	pub to_status: OrderStatus,
	/// Name of the transition event that was applied.
	pub event: String,
	/// User id of the acting principal, if the transition was
	/// user-initiated rather than gateway- or courier-driven.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub principal: Option<String>,
	/// Timestamp of the commit (Unix seconds).
	pub occurred_at: u64,
}

#[cfg(test)]
mod tests {
	use super::*;

	fn order(quantity: u32, price: &str) -> Order {
		Order {
			id: "o-1".into(),
			user_id: "u-1".into(),
			restaurant_id: "r-1".into(),
			menu_id: "m-1".into(),
			item_quantity: quantity,
			item_price: price.parse().unwrap(),
			status: OrderStatus::Waiting,
			payment_token: None,
			created_at: 0,
			updated_at: 0,
		}
	}

	#[test]
	fn total_price_is_derived() {
		let o = order(3, "12.50");
		assert_eq!(o.total_price(), "37.50".parse::<Decimal>().unwrap());
	}

	#[test]
	fn terminal_statuses() {
		assert!(OrderStatus::Completed.is_terminal());
		assert!(OrderStatus::Cancelled.is_terminal());
		assert!(!OrderStatus::Pending.is_terminal());
	}

	#[test]
	fn gateway_confirmed_targets_depend_on_status() {
		let success = TransitionEvent::GatewayConfirmed {
			status: GatewayTransactionStatus::Success,
			reference: "ref".into(),
		};
		let expired = TransitionEvent::GatewayConfirmed {
			status: GatewayTransactionStatus::Expired,
			reference: "ref".into(),
		};
		assert_eq!(success.target(), OrderStatus::Preparing);
		assert_eq!(expired.target(), OrderStatus::Cancelled);
	}
}
