//! Order state machine implementation.
//!
//! The single authority for order status writes. Transitions are
//! validated against a static table, and every accepted transition is
//! committed atomically together with its audit entry and its outbox
//! row, so a status change and its notification event can never be
//! observed apart.

use crate::CoreError;
use mealflow_storage::{StorageService, WriteBatch};
use mealflow_types::{
	current_timestamp, AuditEntry, NotificationEvent, NotificationPayload, Order, OrderStatus,
	Principal, StorageKey, TransitionEvent,
};
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Static transition table: each status maps to the transition events
/// allowed out of it. Statuses without an entry are terminal.
static TRANSITIONS: Lazy<HashMap<OrderStatus, HashSet<&'static str>>> = Lazy::new(|| {
	let mut m = HashMap::new();
	m.insert(
		OrderStatus::Waiting,
		HashSet::from(["cancel", "payment-initiated"]),
	);
	m.insert(
		OrderStatus::Pending,
		HashSet::from(["gateway-confirmed", "cancel"]),
	);
	m.insert(OrderStatus::Preparing, HashSet::from(["kitchen-ready"]));
	m.insert(OrderStatus::Delivering, HashSet::from(["delivery-complete"]));
	m.insert(OrderStatus::Completed, HashSet::new()); // terminal
	m.insert(OrderStatus::Cancelled, HashSet::new()); // terminal
	m
});

/// Manages order state transitions and persistence.
pub struct OrderStateMachine {
	storage: Arc<StorageService>,
}

impl OrderStateMachine {
	pub fn new(storage: Arc<StorageService>) -> Self {
		Self { storage }
	}

	/// Checks if a transition event is allowed from a status.
	fn is_valid_transition(from: OrderStatus, event: &TransitionEvent) -> bool {
		TRANSITIONS
			.get(&from)
			.is_some_and(|events| events.contains(event.name()))
	}

	/// Persists a brand-new order in `Waiting`, its owner-index entry,
	/// and the creation notification, all in one atomic batch.
	///
	/// Fails with [`CoreError::ConcurrentModification`] if an order
	/// with the same id already exists.
	pub async fn create_order(&self, order: &Order) -> Result<(), CoreError> {
		let now = current_timestamp();
		let event_id = uuid::Uuid::new_v4().to_string();

		let audit = AuditEntry {
			order_id: order.id.clone(),
			from_status: None,
			to_status: order.status,
			event: "create".to_string(),
			principal: Some(order.user_id.clone()),
			occurred_at: now,
		};
		let notification = NotificationEvent {
			event_id,
			order_id: order.id.clone(),
			from_status: None,
			to_status: order.status,
			occurred_at: now,
			payload: NotificationPayload {
				user_id: order.user_id.clone(),
				restaurant_id: order.restaurant_id.clone(),
				total_price: order.total_price(),
			},
		};

		let owner_key = format!("{}:{}", order.user_id, order.id);
		let mut batch = WriteBatch::new();
		batch.put(StorageKey::Orders, &order.id, order, Some(0), None)?;
		batch.put(StorageKey::UserOrders, &owner_key, &order.created_at, Some(0), None)?;
		batch.put(
			StorageKey::Audit,
			&Self::sequenced_id(&order.id, 1),
			&audit,
			Some(0),
			None,
		)?;
		batch.put(
			StorageKey::Outbox,
			&Self::sequenced_id(&order.id, 1),
			&notification,
			Some(0),
			None,
		)?;
		self.storage.commit(batch).await?;
		Ok(())
	}

	/// Applies a transition event to an order.
	///
	/// Validation order matters: a missing order is `NotFound`, an
	/// order already at the event's target is an idempotent no-op, an
	/// order with no table edge for the event is `InvalidTransition`,
	/// and losing the commit race is `ConcurrentModification` (the
	/// caller re-reads and retries).
	pub async fn apply_transition(
		&self,
		order_id: &str,
		event: &TransitionEvent,
		principal: Option<&Principal>,
	) -> Result<Order, CoreError> {
		let versioned = self
			.storage
			.retrieve_versioned::<Order>(StorageKey::Orders, order_id)
			.await?;
		let mut order = versioned.value;
		let target = event.target();

		// Re-applying an already-applied transition is a success, not a
		// duplicate notification
		if order.status == target {
			return Ok(order);
		}

		if !Self::is_valid_transition(order.status, event) {
			return Err(CoreError::InvalidTransition {
				from: order.status,
				event: event.name(),
			});
		}

		let from = order.status;
		let now = current_timestamp();
		order.status = target;
		order.updated_at = now;
		if let TransitionEvent::PaymentInitiated { token } = event {
			// Normally written by the gateway service before the
			// transition; kept in sync for callers that pass it along
			order.payment_token.get_or_insert_with(|| token.clone());
		}

		// The post-commit version doubles as the audit/outbox sequence,
		// which makes these ids unique per committed transition
		let commit_seq = versioned.version + 1;
		let audit = AuditEntry {
			order_id: order.id.clone(),
			from_status: Some(from),
			to_status: target,
			event: event.name().to_string(),
			principal: principal.map(|p| p.user_id.clone()),
			occurred_at: now,
		};
		let notification = NotificationEvent {
			event_id: uuid::Uuid::new_v4().to_string(),
			order_id: order.id.clone(),
			from_status: Some(from),
			to_status: target,
			occurred_at: now,
			payload: NotificationPayload {
				user_id: order.user_id.clone(),
				restaurant_id: order.restaurant_id.clone(),
				total_price: order.total_price(),
			},
		};

		let mut batch = WriteBatch::new();
		batch.put(
			StorageKey::Orders,
			order_id,
			&order,
			Some(versioned.version),
			None,
		)?;
		batch.put(
			StorageKey::Audit,
			&Self::sequenced_id(order_id, commit_seq),
			&audit,
			Some(0),
			None,
		)?;
		batch.put(
			StorageKey::Outbox,
			&Self::sequenced_id(order_id, commit_seq),
			&notification,
			Some(0),
			None,
		)?;
		self.storage.commit(batch).await?;

		tracing::info!(
			order_id = %mealflow_types::truncate_id(order_id),
			from = %from,
			to = %target,
			event = event.name(),
			"Order transitioned"
		);
		Ok(order)
	}

	/// Gets an order by ID.
	pub async fn get_order(&self, order_id: &str) -> Result<Order, CoreError> {
		Ok(self
			.storage
			.retrieve(StorageKey::Orders, order_id)
			.await?)
	}

	/// Lists all orders belonging to a user, oldest first.
	pub async fn list_orders_by_user(&self, user_id: &str) -> Result<Vec<Order>, CoreError> {
		let ids = self
			.storage
			.list_ids(StorageKey::UserOrders, &format!("{}:", user_id))
			.await?;
		let mut orders = Vec::with_capacity(ids.len());
		for id in ids {
			// Owner-index ids are "{user_id}:{order_id}"
			if let Some(order_id) = id.split(':').nth(1) {
				orders.push(self.get_order(order_id).await?);
			}
		}
		orders.sort_by_key(|o| o.created_at);
		Ok(orders)
	}

	/// Returns the audit trail for an order in commit order.
	pub async fn audit_log(&self, order_id: &str) -> Result<Vec<AuditEntry>, CoreError> {
		let ids = self
			.storage
			.list_ids(StorageKey::Audit, &format!("{}:", order_id))
			.await?;
		let mut entries = Vec::with_capacity(ids.len());
		for id in ids {
			entries.push(self.storage.retrieve(StorageKey::Audit, &id).await?);
		}
		Ok(entries)
	}

	fn sequenced_id(order_id: &str, seq: u64) -> String {
		format!("{}:{:010}", order_id, seq)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use mealflow_storage::implementations::memory::MemoryStorage;
	use mealflow_types::GatewayTransactionStatus;

	fn machine() -> OrderStateMachine {
		OrderStateMachine::new(Arc::new(StorageService::new(Box::new(MemoryStorage::new()))))
	}

	fn order(id: &str) -> Order {
		Order {
			id: id.to_string(),
			user_id: "u-1".into(),
			restaurant_id: "r-1".into(),
			menu_id: "m-1".into(),
			item_quantity: 1,
			item_price: "10.00".parse().unwrap(),
			status: OrderStatus::Waiting,
			payment_token: None,
			created_at: current_timestamp(),
			updated_at: current_timestamp(),
		}
	}

	fn success_event() -> TransitionEvent {
		TransitionEvent::GatewayConfirmed {
			status: GatewayTransactionStatus::Success,
			reference: "ref-1".into(),
		}
	}

	async fn outbox_len(sm: &OrderStateMachine, order_id: &str) -> usize {
		sm.storage
			.list_ids(StorageKey::Outbox, &format!("{}:", order_id))
			.await
			.unwrap()
			.len()
	}

	#[tokio::test]
	async fn happy_path_walks_the_table() {
		let sm = machine();
		sm.create_order(&order("o-1")).await.unwrap();

		let o = sm
			.apply_transition(
				"o-1",
				&TransitionEvent::PaymentInitiated {
					token: "tok-1".into(),
				},
				None,
			)
			.await
			.unwrap();
		assert_eq!(o.status, OrderStatus::Pending);
		assert_eq!(o.payment_token.as_deref(), Some("tok-1"));

		let o = sm.apply_transition("o-1", &success_event(), None).await.unwrap();
		assert_eq!(o.status, OrderStatus::Preparing);

		let o = sm
			.apply_transition("o-1", &TransitionEvent::KitchenReady, None)
			.await
			.unwrap();
		assert_eq!(o.status, OrderStatus::Delivering);

		let o = sm
			.apply_transition("o-1", &TransitionEvent::DeliveryComplete, None)
			.await
			.unwrap();
		assert_eq!(o.status, OrderStatus::Completed);

		// Creation + four transitions
		assert_eq!(outbox_len(&sm, "o-1").await, 5);
		let audit = sm.audit_log("o-1").await.unwrap();
		assert_eq!(audit.len(), 5);
		assert_eq!(audit[0].event, "create");
		assert_eq!(audit[4].to_status, OrderStatus::Completed);
	}

	#[tokio::test]
	async fn off_table_events_are_rejected() {
		let sm = machine();
		sm.create_order(&order("o-1")).await.unwrap();

		// Gateway confirmation before payment was ever initiated
		let err = sm
			.apply_transition("o-1", &success_event(), None)
			.await
			.unwrap_err();
		assert!(matches!(
			err,
			CoreError::InvalidTransition {
				from: OrderStatus::Waiting,
				event: "gateway-confirmed"
			}
		));

		// Rejection leaves no trace
		assert_eq!(outbox_len(&sm, "o-1").await, 1);
	}

	#[tokio::test]
	async fn reapplied_transition_is_a_quiet_no_op() {
		let sm = machine();
		sm.create_order(&order("o-1")).await.unwrap();
		sm.apply_transition(
			"o-1",
			&TransitionEvent::Cancel,
			Some(&Principal::new("u-1")),
		)
		.await
		.unwrap();
		assert_eq!(outbox_len(&sm, "o-1").await, 2);

		let o = sm
			.apply_transition("o-1", &TransitionEvent::Cancel, None)
			.await
			.unwrap();
		assert_eq!(o.status, OrderStatus::Cancelled);
		// No duplicate notification for the no-op
		assert_eq!(outbox_len(&sm, "o-1").await, 2);
	}

	#[tokio::test]
	async fn cancelled_order_ignores_late_gateway_failure_shape() {
		let sm = machine();
		sm.create_order(&order("o-1")).await.unwrap();
		sm.apply_transition(
			"o-1",
			&TransitionEvent::PaymentInitiated {
				token: "tok-1".into(),
			},
			None,
		)
		.await
		.unwrap();
		sm.apply_transition("o-1", &TransitionEvent::Cancel, None)
			.await
			.unwrap();

		// A late failure signal targets Cancelled too, so it no-ops
		let o = sm
			.apply_transition(
				"o-1",
				&TransitionEvent::GatewayConfirmed {
					status: GatewayTransactionStatus::Failure,
					reference: "ref-2".into(),
				},
				None,
			)
			.await
			.unwrap();
		assert_eq!(o.status, OrderStatus::Cancelled);

		// A late success has no edge out of Cancelled
		let err = sm
			.apply_transition("o-1", &success_event(), None)
			.await
			.unwrap_err();
		assert!(matches!(err, CoreError::InvalidTransition { .. }));
	}

	#[tokio::test]
	async fn duplicate_create_is_rejected() {
		let sm = machine();
		sm.create_order(&order("o-1")).await.unwrap();
		let err = sm.create_order(&order("o-1")).await.unwrap_err();
		assert!(matches!(err, CoreError::ConcurrentModification));
	}

	#[tokio::test]
	async fn random_event_sequences_stay_on_the_table() {
		let sm = machine();
		sm.create_order(&order("o-1")).await.unwrap();

		let events = [
			TransitionEvent::Cancel,
			TransitionEvent::PaymentInitiated {
				token: "tok-1".into(),
			},
			success_event(),
			TransitionEvent::GatewayConfirmed {
				status: GatewayTransactionStatus::Expired,
				reference: "ref-x".into(),
			},
			TransitionEvent::KitchenReady,
			TransitionEvent::DeliveryComplete,
		];

		// Cycle through events in a fixed pseudo-random order; every
		// accepted transition must land on a table edge
		let order_of_application = [4, 1, 0, 2, 5, 3, 1, 2, 4, 5, 0, 3, 2, 4, 1, 5];
		let mut prev_status = OrderStatus::Waiting;
		for idx in order_of_application {
			let event = &events[idx];
			match sm.apply_transition("o-1", event, None).await {
				Ok(o) => {
					let no_op = o.status == prev_status;
					assert!(
						no_op || OrderStateMachine::is_valid_transition(prev_status, event),
						"illegal move {:?} -> {:?} via {}",
						prev_status,
						o.status,
						event.name()
					);
					prev_status = o.status;
				},
				Err(CoreError::InvalidTransition { .. }) => {},
				Err(e) => panic!("unexpected error: {}", e),
			}
		}
	}

	#[tokio::test]
	async fn owner_index_lists_orders() {
		let sm = machine();
		sm.create_order(&order("o-1")).await.unwrap();
		sm.create_order(&order("o-2")).await.unwrap();
		let mut other = order("o-3");
		other.user_id = "u-2".into();
		sm.create_order(&other).await.unwrap();

		let orders = sm.list_orders_by_user("u-1").await.unwrap();
		let ids: Vec<&str> = orders.iter().map(|o| o.id.as_str()).collect();
		assert_eq!(ids, vec!["o-1", "o-2"]);
		assert_eq!(sm.list_orders_by_user("u-2").await.unwrap().len(), 1);
		assert!(sm.list_orders_by_user("u-9").await.unwrap().is_empty());
	}
}
