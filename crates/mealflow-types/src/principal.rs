//! Authenticated principal.
//!
//! Token issuance and verification happen outside the core; every core
//! operation receives the already-authenticated principal as an
//! explicit value instead of reaching into ambient request state.

use serde::{Deserialize, Serialize};

/// The authenticated caller of a core operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
	/// Stable user identifier.
	pub user_id: String,
}

impl Principal {
	pub fn new(user_id: impl Into<String>) -> Self {
		Self {
			user_id: user_id.into(),
		}
	}

	/// Whether this principal owns the order with the given owner id.
	pub fn owns(&self, owner_user_id: &str) -> bool {
		self.user_id == owner_user_id
	}
}
