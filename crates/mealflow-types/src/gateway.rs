//! Payment gateway types.
//!
//! Types describing the external payment gateway's view of a
//! transaction, shared between the adapter, the state machine and the
//! webhook entry point.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transaction status as reported by the payment gateway, either via an
/// inbound webhook or via an active poll. Both delivery paths carry the
/// same fact and are handled by the same idempotent entry point.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GatewayTransactionStatus {
	/// Transaction created, outcome not yet known.
	Pending,
	/// Payment captured.
	Success,
	/// Payment failed.
	Failure,
	/// Payment token expired before the diner completed payment.
	Expired,
}

impl GatewayTransactionStatus {
	/// Whether this status is a final answer from the gateway.
	pub fn is_settled(&self) -> bool {
		!matches!(self, GatewayTransactionStatus::Pending)
	}
}

impl fmt::Display for GatewayTransactionStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			GatewayTransactionStatus::Pending => write!(f, "pending"),
			GatewayTransactionStatus::Success => write!(f, "success"),
			GatewayTransactionStatus::Failure => write!(f, "failure"),
			GatewayTransactionStatus::Expired => write!(f, "expired"),
		}
	}
}

/// Token handed out by the gateway when a transaction is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentToken {
	/// Opaque token the client uses to complete payment.
	pub token: String,
	/// Gateway-assigned transaction reference.
	pub reference: String,
}

/// A status report from the gateway, after parsing but before it has
/// been applied to an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySignal {
	/// The order the signal refers to.
	pub order_id: String,
	/// Reported transaction status.
	pub status: GatewayTransactionStatus,
	/// Gateway-assigned reference usable for deduplication.
	pub reference: String,
}

/// Outcome of feeding a gateway signal into the coordination core.
///
/// Gateways are permitted to redeliver the same notification, so both
/// `Applied` and `Duplicate` are success answers from their point of
/// view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayAck {
	/// The signal caused a status transition.
	Applied,
	/// The order was already at or past the implied status; no-op.
	Duplicate,
	/// The signal could not be matched to an order and was persisted
	/// to the dead-letter store for manual inspection.
	DeadLettered,
}
