//! Coordination engine.
//!
//! Owns the long-running pieces of the system: the outbox relay, one
//! worker per notification consumer, the pending-order sweep and the
//! storage TTL cleanup. The engine wires them to a shared shutdown
//! signal and tears them down in order on ctrl-c.

use crate::consumers::{ConsumerWorker, NotificationConsumer};
use crate::handlers::payment::PaymentHandler;
use crate::outbox::OutboxPublisher;
use crate::sweep::PendingSweep;
use crate::CoreError;
use mealflow_config::Config;
use mealflow_gateway::PaymentGatewayService;
use mealflow_queue::MessageQueue;
use mealflow_storage::StorageService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// How often the outbox relay looks for freshly committed rows.
const OUTBOX_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Main engine that runs the order-lifecycle background machinery.
pub struct Engine {
	config: Config,
	storage: Arc<StorageService>,
	gateway: Arc<PaymentGatewayService>,
	queue: Arc<MessageQueue>,
	handler: Arc<PaymentHandler>,
	consumers: Vec<Arc<dyn NotificationConsumer>>,
}

impl std::fmt::Debug for Engine {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Engine")
			.field("config", &self.config)
			.field("consumers", &self.consumers.len())
			.finish_non_exhaustive()
	}
}

impl Engine {
	pub fn new(
		config: Config,
		storage: Arc<StorageService>,
		gateway: Arc<PaymentGatewayService>,
		queue: Arc<MessageQueue>,
		handler: Arc<PaymentHandler>,
		consumers: Vec<Arc<dyn NotificationConsumer>>,
	) -> Self {
		Self {
			config,
			storage,
			gateway,
			queue,
			handler,
			consumers,
		}
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	/// The handler the API layer calls into.
	pub fn handler(&self) -> Arc<PaymentHandler> {
		self.handler.clone()
	}

	pub fn storage(&self) -> Arc<StorageService> {
		self.storage.clone()
	}

	/// The gateway adapter, exposed for the webhook entry point.
	pub fn gateway(&self) -> Arc<PaymentGatewayService> {
		self.gateway.clone()
	}

	/// Spawns every background task against the given shutdown signal.
	pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
		let mut handles = Vec::new();

		let publisher = OutboxPublisher::new(
			self.storage.clone(),
			self.queue.clone(),
			OUTBOX_POLL_INTERVAL,
		);
		handles.push(tokio::spawn(publisher.run(shutdown.clone())));

		let dedup_retention = Duration::from_secs(self.config.consumers.dedup_retention_seconds);
		for consumer in &self.consumers {
			let worker = ConsumerWorker::new(
				self.storage.clone(),
				self.queue.clone(),
				consumer.clone(),
				dedup_retention,
			);
			handles.push(tokio::spawn(worker.run(shutdown.clone())));
		}

		if self.config.sweep.enabled {
			let sweep = PendingSweep::new(
				self.storage.clone(),
				self.gateway.clone(),
				self.handler.clone(),
				Duration::from_secs(self.config.sweep.interval_seconds),
				Duration::from_secs(self.config.sweep.stale_after_seconds),
			);
			handles.push(tokio::spawn(sweep.run(shutdown.clone())));
		}

		let storage = self.storage.clone();
		let cleanup_interval = Duration::from_secs(self.config.storage.cleanup_interval_seconds);
		let mut cleanup_shutdown = shutdown;
		handles.push(tokio::spawn(async move {
			let mut ticker = tokio::time::interval(cleanup_interval);
			// The first tick fires immediately; skip it so startup does
			// not race recovery
			ticker.tick().await;
			loop {
				tokio::select! {
					_ = ticker.tick() => {
						match storage.cleanup_expired().await {
							Ok(0) => {},
							Ok(n) => info!(count = n, "Cleaned up expired storage entries"),
							Err(e) => error!(error = %e, "Storage cleanup failed"),
						}
					}
					_ = cleanup_shutdown.changed() => {
						if *cleanup_shutdown.borrow() {
							break;
						}
					}
				}
			}
		}));

		handles
	}

	/// Main execution loop.
	///
	/// Recovers the queue journal, starts the background tasks and
	/// blocks until ctrl-c, then signals shutdown and waits for every
	/// task to drain.
	pub async fn run(&self) -> Result<(), CoreError> {
		let recovered = self.queue.recover().await?;
		if recovered > 0 {
			info!(count = recovered, "Recovered journaled queue messages");
		}

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let handles = self.start(shutdown_rx);
		info!(
			service_id = %self.config.service.id,
			tasks = handles.len(),
			"Engine started"
		);

		tokio::signal::ctrl_c()
			.await
			.map_err(|e| CoreError::Service(e.to_string()))?;
		info!("Shutdown signal received");

		let _ = shutdown_tx.send(true);
		for handle in handles {
			let _ = handle.await;
		}
		info!("Engine stopped");
		Ok(())
	}
}
