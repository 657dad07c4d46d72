//! Configuration module for the mealflow order coordination system.
//!
//! This module provides structures and utilities for managing service
//! configuration. It supports loading configuration from TOML files,
//! resolves `${VAR}` / `${VAR:-default}` environment references, and
//! validates that all required configuration values are properly set.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
	/// Error that occurs during file I/O operations.
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),
	/// Error that occurs when parsing TOML configuration.
	#[error("Configuration error: {0}")]
	Parse(String),
	/// Error that occurs when configuration validation fails.
	#[error("Validation error: {0}")]
	Validation(String),
}

impl From<toml::de::Error> for ConfigError {
	fn from(err: toml::de::Error) -> Self {
		// Extract just the message without the huge input dump
		let message = err.message().to_string();
		ConfigError::Parse(message)
	}
}

/// Main configuration structure for the mealflow service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
	/// Configuration specific to this service instance.
	pub service: ServiceConfig,
	/// Configuration for the storage backend.
	pub storage: StorageConfig,
	/// Configuration for the payment gateway.
	pub gateway: GatewayConfig,
	/// Configuration for the notification queue.
	#[serde(default)]
	pub queue: QueueSettings,
	/// Configuration for the pending-order reconciliation sweep.
	#[serde(default)]
	pub sweep: SweepConfig,
	/// Configuration for notification consumers.
	#[serde(default)]
	pub consumers: ConsumerConfig,
	/// Configuration for the HTTP API server.
	pub api: Option<ApiConfig>,
}

/// Configuration specific to this service instance.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
	/// Unique identifier for this service instance.
	pub id: String,
}

/// Configuration for the storage backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
	/// Which implementation to use as primary.
	pub primary: String,
	/// Map of storage implementation names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
	/// Interval in seconds for cleaning up expired storage entries.
	#[serde(default = "default_cleanup_interval")]
	pub cleanup_interval_seconds: u64,
}

fn default_cleanup_interval() -> u64 {
	3600 // hourly
}

/// Configuration for the payment gateway.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
	/// Which implementation to use as primary.
	pub primary: String,
	/// Map of gateway implementation names to their configurations.
	pub implementations: HashMap<String, toml::Value>,
	/// Retry policy for transient gateway failures.
	#[serde(default)]
	pub retry: RetrySettings,
}

/// Retry policy settings for gateway calls.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrySettings {
	#[serde(default = "default_retry_attempts")]
	pub max_attempts: u32,
	#[serde(default = "default_retry_initial_delay")]
	pub initial_delay_ms: u64,
	#[serde(default = "default_retry_max_delay")]
	pub max_delay_ms: u64,
	#[serde(default = "default_retry_multiplier")]
	pub multiplier: f64,
}

impl Default for RetrySettings {
	fn default() -> Self {
		Self {
			max_attempts: default_retry_attempts(),
			initial_delay_ms: default_retry_initial_delay(),
			max_delay_ms: default_retry_max_delay(),
			multiplier: default_retry_multiplier(),
		}
	}
}

fn default_retry_attempts() -> u32 {
	3
}

fn default_retry_initial_delay() -> u64 {
	100
}

fn default_retry_max_delay() -> u64 {
	5_000
}

fn default_retry_multiplier() -> f64 {
	2.0
}

/// Configuration for the notification queue.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueSettings {
	/// Delivery attempts before a message is dead-lettered.
	#[serde(default = "default_queue_attempts")]
	pub max_attempts: u32,
	/// Backoff before the first redelivery, doubling per attempt.
	#[serde(default = "default_queue_initial_backoff")]
	pub initial_backoff_ms: u64,
	/// Upper bound on the redelivery backoff.
	#[serde(default = "default_queue_max_backoff")]
	pub max_backoff_ms: u64,
	/// How long a delivery may stay unacked before redelivery.
	#[serde(default = "default_queue_ack_timeout")]
	pub ack_timeout_ms: u64,
}

impl Default for QueueSettings {
	fn default() -> Self {
		Self {
			max_attempts: default_queue_attempts(),
			initial_backoff_ms: default_queue_initial_backoff(),
			max_backoff_ms: default_queue_max_backoff(),
			ack_timeout_ms: default_queue_ack_timeout(),
		}
	}
}

fn default_queue_attempts() -> u32 {
	5
}

fn default_queue_initial_backoff() -> u64 {
	200
}

fn default_queue_max_backoff() -> u64 {
	30_000
}

fn default_queue_ack_timeout() -> u64 {
	30_000
}

/// Configuration for the pending-order reconciliation sweep.
///
/// The sweep polls the gateway for orders that sat in `Pending` longer
/// than `stale_after_seconds`, covering the case where the gateway's
/// webhook never arrived.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SweepConfig {
	#[serde(default = "default_true")]
	pub enabled: bool,
	/// How often the sweep runs.
	#[serde(default = "default_sweep_interval")]
	pub interval_seconds: u64,
	/// How long an order may sit in `Pending` before it is polled.
	#[serde(default = "default_stale_after")]
	pub stale_after_seconds: u64,
}

impl Default for SweepConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			interval_seconds: default_sweep_interval(),
			stale_after_seconds: default_stale_after(),
		}
	}
}

fn default_true() -> bool {
	true
}

fn default_sweep_interval() -> u64 {
	60
}

fn default_stale_after() -> u64 {
	900 // 15 minutes
}

/// Configuration for notification consumers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumerConfig {
	/// How long handled-event markers are retained for deduplication.
	#[serde(default = "default_dedup_retention")]
	pub dedup_retention_seconds: u64,
}

impl Default for ConsumerConfig {
	fn default() -> Self {
		Self {
			dedup_retention_seconds: default_dedup_retention(),
		}
	}
}

fn default_dedup_retention() -> u64 {
	86_400 // one day
}

/// Configuration for the HTTP API server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
	/// Whether the API server is enabled.
	#[serde(default)]
	pub enabled: bool,
	/// Host address to bind the server to.
	#[serde(default = "default_api_host")]
	pub host: String,
	/// Port to bind the server to.
	#[serde(default = "default_api_port")]
	pub port: u16,
	/// Request timeout in seconds.
	#[serde(default = "default_api_timeout")]
	pub timeout_seconds: u64,
	/// Maximum request size in bytes.
	#[serde(default = "default_max_request_size")]
	pub max_request_size: usize,
}

fn default_api_host() -> String {
	"127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
	3000
}

fn default_api_timeout() -> u64 {
	30
}

fn default_max_request_size() -> usize {
	1024 * 1024 // 1MB
}

/// Resolves `${VAR}` and `${VAR:-default}` placeholders against the
/// process environment. Gateway endpoints and API keys reach the
/// config this way instead of living in the TOML file.
///
/// Input is capped at 1MB, which bounds the regex scan; a service
/// config anywhere near that size is malformed anyway.
pub(crate) fn resolve_env_vars(input: &str) -> Result<String, ConfigError> {
	const MAX_INPUT_SIZE: usize = 1024 * 1024;
	if input.len() > MAX_INPUT_SIZE {
		return Err(ConfigError::Validation(format!(
			"Configuration file too large: {} bytes (max: {} bytes)",
			input.len(),
			MAX_INPUT_SIZE
		)));
	}

	let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]{0,127})(?::-([^}]{0,256}))?\}")
		.map_err(|e| ConfigError::Parse(format!("Regex error: {}", e)))?;

	let mut result = input.to_string();
	let mut replacements = Vec::new();

	for cap in re.captures_iter(input) {
		let full_match = match cap.get(0) {
			Some(m) => m,
			None => continue,
		};
		let var_name = match cap.get(1) {
			Some(m) => m.as_str(),
			None => continue,
		};
		let default_value = cap.get(2).map(|m| m.as_str());

		let value = match std::env::var(var_name) {
			Ok(v) => v,
			Err(_) => {
				if let Some(default) = default_value {
					default.to_string()
				} else {
					return Err(ConfigError::Validation(format!(
						"Environment variable '{}' not found",
						var_name
					)));
				}
			},
		};

		replacements.push((full_match.start(), full_match.end(), value));
	}

	// Apply replacements in reverse order to maintain positions
	for (start, end, value) in replacements.iter().rev() {
		result.replace_range(start..end, value);
	}

	Ok(result)
}

impl Config {
	/// Loads configuration from a TOML file, resolving environment
	/// variable references and validating the result.
	pub async fn from_file(path: &str) -> Result<Self, ConfigError> {
		let contents = tokio::fs::read_to_string(path).await?;
		contents.parse()
	}

	/// Validates the configuration to ensure all required fields are properly set.
	fn validate(&self) -> Result<(), ConfigError> {
		if self.service.id.is_empty() {
			return Err(ConfigError::Validation("Service ID cannot be empty".into()));
		}

		// Validate storage config
		if self.storage.implementations.is_empty() {
			return Err(ConfigError::Validation(
				"At least one storage implementation must be configured".into(),
			));
		}
		if self.storage.primary.is_empty() {
			return Err(ConfigError::Validation(
				"Storage primary implementation cannot be empty".into(),
			));
		}
		if !self
			.storage
			.implementations
			.contains_key(&self.storage.primary)
		{
			return Err(ConfigError::Validation(format!(
				"Primary storage '{}' not found in implementations",
				self.storage.primary
			)));
		}
		if self.storage.cleanup_interval_seconds == 0 {
			return Err(ConfigError::Validation(
				"Storage cleanup_interval_seconds must be greater than 0".into(),
			));
		}
		if self.storage.cleanup_interval_seconds > 86400 {
			return Err(ConfigError::Validation(
				"Storage cleanup_interval_seconds cannot exceed 86400 (24 hours)".into(),
			));
		}

		// Validate gateway config
		if self.gateway.implementations.is_empty() {
			return Err(ConfigError::Validation(
				"At least one gateway implementation must be configured".into(),
			));
		}
		if self.gateway.primary.is_empty() {
			return Err(ConfigError::Validation(
				"Gateway primary implementation cannot be empty".into(),
			));
		}
		if !self
			.gateway
			.implementations
			.contains_key(&self.gateway.primary)
		{
			return Err(ConfigError::Validation(format!(
				"Primary gateway '{}' not found in implementations",
				self.gateway.primary
			)));
		}
		if self.gateway.retry.max_attempts == 0 {
			return Err(ConfigError::Validation(
				"Gateway retry max_attempts must be at least 1".into(),
			));
		}
		if self.gateway.retry.multiplier < 1.0 {
			return Err(ConfigError::Validation(
				"Gateway retry multiplier must be at least 1.0".into(),
			));
		}

		// Validate queue config
		if self.queue.max_attempts == 0 {
			return Err(ConfigError::Validation(
				"Queue max_attempts must be at least 1".into(),
			));
		}
		if self.queue.ack_timeout_ms == 0 {
			return Err(ConfigError::Validation(
				"Queue ack_timeout_ms must be greater than 0".into(),
			));
		}

		// Validate sweep config
		if self.sweep.enabled {
			if self.sweep.interval_seconds == 0 {
				return Err(ConfigError::Validation(
					"Sweep interval_seconds must be greater than 0".into(),
				));
			}
			if self.sweep.stale_after_seconds == 0 {
				return Err(ConfigError::Validation(
					"Sweep stale_after_seconds must be greater than 0".into(),
				));
			}
		}

		if self.consumers.dedup_retention_seconds == 0 {
			return Err(ConfigError::Validation(
				"Consumer dedup_retention_seconds must be greater than 0".into(),
			));
		}

		Ok(())
	}
}

/// Implementation of FromStr trait for Config to enable parsing from string.
///
/// Environment variables are resolved and the configuration is
/// automatically validated after parsing.
impl FromStr for Config {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let resolved = resolve_env_vars(s)?;
		let config: Config = toml::from_str(&resolved)?;
		config.validate()?;
		Ok(config)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const VALID_CONFIG: &str = r#"
[service]
id = "mealflow-test"

[storage]
primary = "memory"
cleanup_interval_seconds = 3600
[storage.implementations.memory]

[gateway]
primary = "mock"
[gateway.implementations.mock]

[api]
enabled = true
port = 3000
"#;

	#[test]
	fn test_env_var_resolution() {
		std::env::set_var("TEST_GW_HOST", "localhost");
		std::env::set_var("TEST_GW_PORT", "8080");

		let input = "base_url = \"http://${TEST_GW_HOST}:${TEST_GW_PORT}\"";
		let result = resolve_env_vars(input).unwrap();
		assert_eq!(result, "base_url = \"http://localhost:8080\"");

		std::env::remove_var("TEST_GW_HOST");
		std::env::remove_var("TEST_GW_PORT");
	}

	#[test]
	fn test_env_var_with_default() {
		let input = "value = \"${MISSING_VAR:-default_value}\"";
		let result = resolve_env_vars(input).unwrap();
		assert_eq!(result, "value = \"default_value\"");
	}

	#[test]
	fn test_missing_env_var_error() {
		let input = "value = \"${MISSING_VAR}\"";
		let result = resolve_env_vars(input);
		assert!(result.is_err());
		assert!(result.unwrap_err().to_string().contains("MISSING_VAR"));
	}

	#[test]
	fn test_valid_config_parses_with_defaults() {
		let config: Config = VALID_CONFIG.parse().unwrap();
		assert_eq!(config.service.id, "mealflow-test");
		assert_eq!(config.storage.primary, "memory");
		assert_eq!(config.gateway.primary, "mock");
		// Sections omitted entirely fall back to defaults
		assert_eq!(config.queue.max_attempts, 5);
		assert!(config.sweep.enabled);
		assert_eq!(config.consumers.dedup_retention_seconds, 86_400);
		let api = config.api.unwrap();
		assert!(api.enabled);
		assert_eq!(api.host, "127.0.0.1");
	}

	#[test]
	fn test_unknown_primary_rejected() {
		let config_str = VALID_CONFIG.replace("primary = \"mock\"", "primary = \"stripe\"");
		let result: Result<Config, _> = config_str.parse();
		assert!(matches!(result, Err(ConfigError::Validation(msg)) if msg.contains("stripe")));
	}

	#[test]
	fn test_empty_service_id_rejected() {
		let config_str = VALID_CONFIG.replace("id = \"mealflow-test\"", "id = \"\"");
		let result: Result<Config, _> = config_str.parse();
		assert!(matches!(result, Err(ConfigError::Validation(_))));
	}

	#[test]
	fn test_zero_cleanup_interval_rejected() {
		let config_str =
			VALID_CONFIG.replace("cleanup_interval_seconds = 3600", "cleanup_interval_seconds = 0");
		let result: Result<Config, _> = config_str.parse();
		assert!(matches!(result, Err(ConfigError::Validation(_))));
	}
}
