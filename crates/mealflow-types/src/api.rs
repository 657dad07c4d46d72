//! API types for the mealflow HTTP API.
//!
//! This module defines the request and response types for the client
//! facing endpoints, plus the structured error type with its HTTP
//! status mapping. Internal causes (gateway outage vs. malformed
//! response) are logged by the handlers but never conflated with
//! business-rule rejections in the response.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{GatewayTransactionStatus, Order, OrderStatus};

/// Request body for placing a new order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
	#[serde(rename = "restaurantId")]
	pub restaurant_id: String,
	#[serde(rename = "menuId")]
	pub menu_id: String,
	/// Number of items. Must be positive.
	#[serde(rename = "itemQuantity")]
	pub item_quantity: u32,
	/// Unit price as quoted to the client. The server snapshots this
	/// after validating it against the referenced menu item; the total
	/// is always recomputed server-side.
	#[serde(rename = "itemPrice")]
	pub item_price: Decimal,
}

/// Order status snapshot returned by every order endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSnapshot {
	pub id: String,
	pub status: OrderStatus,
	#[serde(rename = "restaurantId")]
	pub restaurant_id: String,
	#[serde(rename = "menuId")]
	pub menu_id: String,
	#[serde(rename = "itemQuantity")]
	pub item_quantity: u32,
	#[serde(rename = "itemPrice")]
	pub item_price: Decimal,
	#[serde(rename = "totalPrice")]
	pub total_price: Decimal,
	#[serde(rename = "paymentToken", skip_serializing_if = "Option::is_none")]
	pub payment_token: Option<String>,
	#[serde(rename = "createdAt")]
	pub created_at: u64,
	#[serde(rename = "updatedAt")]
	pub updated_at: u64,
}

impl From<&Order> for OrderSnapshot {
	fn from(order: &Order) -> Self {
		Self {
			id: order.id.clone(),
			status: order.status,
			restaurant_id: order.restaurant_id.clone(),
			menu_id: order.menu_id.clone(),
			item_quantity: order.item_quantity,
			item_price: order.item_price,
			total_price: order.total_price(),
			payment_token: order.payment_token.clone(),
			created_at: order.created_at,
			updated_at: order.updated_at,
		}
	}
}

/// Response for `POST /api/orders/{id}/payment`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiatePaymentResponse {
	/// The payment token the client completes payment with. Identical
	/// on every retry for the same order.
	pub token: String,
	pub order: OrderSnapshot,
}

/// Raw payload of an inbound gateway webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayCallbackRequest {
	#[serde(rename = "orderId")]
	pub order_id: String,
	#[serde(rename = "transactionStatus")]
	pub transaction_status: GatewayTransactionStatus,
	/// Gateway-assigned reference for deduplication.
	pub reference: String,
}

/// API error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
	/// Error type/code
	pub error: String,
	/// Human-readable description
	pub message: String,
	/// Whether the caller may retry the same request as-is.
	pub retryable: bool,
	/// Suggested retry delay in seconds
	#[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
	pub retry_after: Option<u64>,
}

/// Structured API error type with appropriate HTTP status mapping.
#[derive(Debug)]
pub enum ApiError {
	/// Bad request shape, rejected before touching state (400).
	BadRequest { message: String },
	/// Acting on another principal's order (403).
	Forbidden,
	/// Unknown order id (404).
	NotFound { message: String },
	/// The order's current status has no edge for the event (409).
	InvalidTransition { message: String },
	/// Lost an optimistic-concurrency race; retry against fresh state (409).
	ConcurrentModification,
	/// The gateway rejected the request; retrying will not help (422).
	GatewayRejected { message: String },
	/// The gateway or queue is unreachable; retry with backoff (503).
	ServiceUnavailable {
		message: String,
		retry_after: Option<u64>,
	},
	/// Internal server error (500).
	Internal { message: String },
}

impl ApiError {
	/// Get the HTTP status code for this error.
	pub fn status_code(&self) -> u16 {
		match self {
			ApiError::BadRequest { .. } => 400,
			ApiError::Forbidden => 403,
			ApiError::NotFound { .. } => 404,
			ApiError::InvalidTransition { .. } => 409,
			ApiError::ConcurrentModification => 409,
			ApiError::GatewayRejected { .. } => 422,
			ApiError::ServiceUnavailable { .. } => 503,
			ApiError::Internal { .. } => 500,
		}
	}

	/// Convert to ErrorResponse for JSON serialization.
	pub fn to_error_response(&self) -> ErrorResponse {
		match self {
			ApiError::BadRequest { message } => ErrorResponse {
				error: "BAD_REQUEST".into(),
				message: message.clone(),
				retryable: false,
				retry_after: None,
			},
			ApiError::Forbidden => ErrorResponse {
				error: "FORBIDDEN".into(),
				message: "Order belongs to another user".into(),
				retryable: false,
				retry_after: None,
			},
			ApiError::NotFound { message } => ErrorResponse {
				error: "NOT_FOUND".into(),
				message: message.clone(),
				retryable: false,
				retry_after: None,
			},
			ApiError::InvalidTransition { message } => ErrorResponse {
				error: "INVALID_TRANSITION".into(),
				message: message.clone(),
				retryable: false,
				retry_after: None,
			},
			ApiError::ConcurrentModification => ErrorResponse {
				error: "CONCURRENT_MODIFICATION".into(),
				message: "Order was modified concurrently, retry against fresh state".into(),
				retryable: true,
				retry_after: None,
			},
			ApiError::GatewayRejected { message } => ErrorResponse {
				error: "GATEWAY_REJECTED".into(),
				message: message.clone(),
				retryable: false,
				retry_after: None,
			},
			ApiError::ServiceUnavailable {
				message,
				retry_after,
			} => ErrorResponse {
				error: "SERVICE_UNAVAILABLE".into(),
				message: message.clone(),
				retryable: true,
				retry_after: *retry_after,
			},
			ApiError::Internal { message } => ErrorResponse {
				error: "INTERNAL_ERROR".into(),
				message: message.clone(),
				retryable: false,
				retry_after: None,
			},
		}
	}
}

impl fmt::Display for ApiError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let body = self.to_error_response();
		write!(f, "{}: {}", body.error, body.message)
	}
}

impl std::error::Error for ApiError {}

impl axum::response::IntoResponse for ApiError {
	fn into_response(self) -> axum::response::Response {
		use axum::{http::StatusCode, response::Json};

		let status = StatusCode::from_u16(self.status_code())
			.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
		(status, Json(self.to_error_response())).into_response()
	}
}
