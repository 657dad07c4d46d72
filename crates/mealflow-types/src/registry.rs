//! Registry trait for self-registering implementations.
//!
//! Pluggable backends (storage, payment gateway) register themselves
//! under the name the configuration file refers to them by, together
//! with a factory function that builds them from their config table.

/// Base trait for implementation registries.
///
/// Each backend module provides a `Registry` struct implementing this
/// trait, tying the configuration name to the factory that builds the
/// implementation.
pub trait ImplementationRegistry {
	/// The name used in configuration files to reference this
	/// implementation, for example "memory" for
	/// `storage.implementations.memory` or "http" for
	/// `gateway.implementations.http`.
	const NAME: &'static str;

	/// The factory function type this implementation provides. Each
	/// module defines its own, e.g. `StorageFactory` or
	/// `GatewayFactory`.
	type Factory;

	/// Get the factory function for this implementation.
	fn factory() -> Self::Factory;
}
