//! Core coordination engine for the mealflow system.
//!
//! This module provides the main orchestration logic for the order
//! lifecycle: the state machine that owns all status writes, the
//! payment handler exposing the operations the API calls into, the
//! outbox relay that turns committed transitions into queue messages,
//! the notification consumers, and the reconciliation sweep for orders
//! the gateway never called back about.

use mealflow_gateway::GatewayError;
use mealflow_queue::QueueError;
use mealflow_storage::StorageError;
use mealflow_types::OrderStatus;
use thiserror::Error;

pub mod builder;
pub mod consumers;
pub mod engine;
pub mod handlers;
pub mod outbox;
pub mod state;
pub mod sweep;

pub use builder::{EngineBuilder, EngineFactories};
pub use engine::Engine;
pub use handlers::payment::PaymentHandler;
pub use state::order::OrderStateMachine;

/// Errors produced by the core order operations.
///
/// These are the errors the service layer maps onto HTTP statuses, so
/// the variants distinguish caller mistakes from retryable races and
/// from infrastructure failures.
#[derive(Debug, Error)]
pub enum CoreError {
	/// The referenced order does not exist.
	#[error("Order not found")]
	NotFound,
	/// The caller does not own the referenced order.
	#[error("Order belongs to another user")]
	Forbidden,
	/// The order's current status has no edge for the attempted event.
	#[error("Invalid transition: {event} not allowed from {from}")]
	InvalidTransition {
		from: OrderStatus,
		event: &'static str,
	},
	/// An optimistic-concurrency race was lost; the caller should retry
	/// against fresh state.
	#[error("Order was modified concurrently")]
	ConcurrentModification,
	/// The request was malformed before touching any state.
	#[error("Validation error: {0}")]
	Validation(String),
	/// Error from the payment gateway.
	#[error("Gateway error: {0}")]
	Gateway(#[from] GatewayError),
	/// Error from the storage layer.
	#[error("Storage error: {0}")]
	Storage(String),
	/// Error from the notification queue.
	#[error("Queue error: {0}")]
	Queue(String),
	/// Error from the surrounding runtime or one of the background
	/// services.
	#[error("Service error: {0}")]
	Service(String),
}

impl From<StorageError> for CoreError {
	fn from(e: StorageError) -> Self {
		match e {
			StorageError::NotFound => CoreError::NotFound,
			StorageError::Conflict { .. } => CoreError::ConcurrentModification,
			other => CoreError::Storage(other.to_string()),
		}
	}
}

impl From<QueueError> for CoreError {
	fn from(e: QueueError) -> Self {
		CoreError::Queue(e.to_string())
	}
}
