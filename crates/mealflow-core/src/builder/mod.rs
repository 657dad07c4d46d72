//! Builder pattern for constructing coordination engines.
//!
//! Composes an Engine from pluggable storage and gateway
//! implementations using factory functions keyed by implementation
//! name, so the binary decides which backends are linked in and the
//! configuration decides which one runs.

use crate::consumers::{
	EmailVerificationConsumer, LogNotifier, NotificationConsumer, Notifier, OrderPreparingConsumer,
	StatusUpdateConsumer,
};
use crate::engine::Engine;
use crate::handlers::payment::PaymentHandler;
use crate::state::order::OrderStateMachine;
use mealflow_config::Config;
use mealflow_gateway::{GatewayError, PaymentGatewayInterface, PaymentGatewayService, RetryConfig};
use mealflow_queue::{MessageQueue, QueueConfig};
use mealflow_storage::{StorageError, StorageInterface, StorageService};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during engine construction.
#[derive(Debug, Error)]
pub enum BuilderError {
	#[error("Configuration error: {0}")]
	Config(String),
	#[error("Missing required component: {0}")]
	MissingComponent(String),
}

/// Container for the factory functions needed to build an Engine.
///
/// Each factory takes the implementation's TOML configuration table and
/// returns the corresponding backend.
pub struct EngineFactories<SF, GF> {
	pub storage_factories: HashMap<String, SF>,
	pub gateway_factories: HashMap<String, GF>,
}

/// Builder for constructing an Engine with pluggable implementations.
pub struct EngineBuilder {
	config: Config,
	notifier: Option<Arc<dyn Notifier>>,
}

impl EngineBuilder {
	/// Creates a new EngineBuilder with the given configuration.
	pub fn new(config: Config) -> Self {
		Self {
			config,
			notifier: None,
		}
	}

	/// Overrides the outbound notification channel. Defaults to the
	/// log-based notifier.
	pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
		self.notifier = Some(notifier);
		self
	}

	/// Builds the Engine using factories for each component type.
	pub fn build<SF, GF>(self, factories: EngineFactories<SF, GF>) -> Result<Engine, BuilderError>
	where
		SF: Fn(&toml::Value) -> Result<Box<dyn StorageInterface>, StorageError>,
		GF: Fn(&toml::Value) -> Result<Box<dyn PaymentGatewayInterface>, GatewayError>,
	{
		// Create storage implementations
		let mut storage_impls = HashMap::new();
		for (name, config) in &self.config.storage.implementations {
			if let Some(factory) = factories.storage_factories.get(name) {
				match factory(config) {
					Ok(implementation) => {
						// Validation already happened in the factory
						storage_impls.insert(name.clone(), implementation);
						let is_primary = &self.config.storage.primary == name;
						tracing::info!(component = "storage", implementation = %name, enabled = %is_primary, "Loaded");
					},
					Err(e) => {
						tracing::error!(
							component = "storage",
							implementation = %name,
							error = %e,
							"Failed to create storage implementation"
						);
						return Err(BuilderError::Config(format!(
							"Failed to create storage implementation '{}': {}",
							name, e
						)));
					},
				}
			}
		}

		if storage_impls.is_empty() {
			return Err(BuilderError::Config(
				"No valid storage implementations available".into(),
			));
		}

		let primary_storage = &self.config.storage.primary;
		let storage_backend = storage_impls.remove(primary_storage).ok_or_else(|| {
			BuilderError::Config(format!(
				"Primary storage '{}' failed to load or has invalid configuration",
				primary_storage
			))
		})?;
		let storage = Arc::new(StorageService::new(storage_backend));

		// Create gateway implementations
		let mut gateway_impls = HashMap::new();
		for (name, config) in &self.config.gateway.implementations {
			if let Some(factory) = factories.gateway_factories.get(name) {
				match factory(config) {
					Ok(implementation) => {
						gateway_impls.insert(name.clone(), implementation);
						let is_primary = &self.config.gateway.primary == name;
						tracing::info!(component = "gateway", implementation = %name, enabled = %is_primary, "Loaded");
					},
					Err(e) => {
						tracing::error!(
							component = "gateway",
							implementation = %name,
							error = %e,
							"Failed to create gateway implementation"
						);
						return Err(BuilderError::Config(format!(
							"Failed to create gateway implementation '{}': {}",
							name, e
						)));
					},
				}
			}
		}

		let primary_gateway = &self.config.gateway.primary;
		let gateway_impl = gateway_impls.remove(primary_gateway).ok_or_else(|| {
			BuilderError::Config(format!(
				"Primary gateway '{}' failed to load or has invalid configuration",
				primary_gateway
			))
		})?;

		let retry = &self.config.gateway.retry;
		let gateway = Arc::new(PaymentGatewayService::new(
			gateway_impl,
			storage.clone(),
			RetryConfig {
				max_attempts: retry.max_attempts,
				initial_delay_ms: retry.initial_delay_ms,
				max_delay_ms: retry.max_delay_ms,
				multiplier: retry.multiplier,
			},
		));

		let queue = Arc::new(MessageQueue::new(
			storage.clone(),
			QueueConfig {
				max_attempts: self.config.queue.max_attempts,
				initial_backoff_ms: self.config.queue.initial_backoff_ms,
				max_backoff_ms: self.config.queue.max_backoff_ms,
				ack_timeout_ms: self.config.queue.ack_timeout_ms,
			},
		));

		let state = Arc::new(OrderStateMachine::new(storage.clone()));
		let handler = Arc::new(PaymentHandler::new(state, gateway.clone()));

		let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));
		let consumers: Vec<Arc<dyn NotificationConsumer>> = vec![
			Arc::new(EmailVerificationConsumer::new(notifier.clone())),
			Arc::new(OrderPreparingConsumer::new(notifier.clone())),
			Arc::new(StatusUpdateConsumer::pending(notifier.clone())),
			Arc::new(StatusUpdateConsumer::delivering(notifier.clone())),
			Arc::new(StatusUpdateConsumer::completed(notifier.clone())),
			Arc::new(StatusUpdateConsumer::cancelled(notifier)),
		];

		Ok(Engine::new(
			self.config,
			storage,
			gateway,
			queue,
			handler,
			consumers,
		))
	}
}
