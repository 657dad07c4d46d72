//! HTTP payment gateway implementation.
//!
//! Talks to a payment gateway over its REST API using reqwest. The
//! error mapping is the important part: transport failures, timeouts
//! and 5xx answers become [`GatewayError::Unavailable`] (retryable,
//! outcome unknown), while 4xx answers become
//! [`GatewayError::Rejected`] (the gateway saw the request and said
//! no).

use crate::{GatewayError, PaymentGatewayInterface};
use async_trait::async_trait;
use mealflow_types::{
	ConfigSchema, Field, FieldType, GatewayTransactionStatus, ImplementationRegistry, PaymentToken,
	Schema, ValidationError,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Serialize)]
struct CreateTransactionBody<'a> {
	#[serde(rename = "orderId")]
	order_id: &'a str,
	amount: Decimal,
}

#[derive(Debug, Deserialize)]
struct TransactionResponse {
	token: String,
	reference: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
	status: GatewayTransactionStatus,
}

/// HTTP payment gateway client.
pub struct HttpGateway {
	client: reqwest::Client,
	base_url: String,
	api_key: Option<String>,
}

impl HttpGateway {
	/// Creates a new HttpGateway with the given base URL, request
	/// timeout and optional API key.
	pub fn new(
		base_url: String,
		timeout: Duration,
		api_key: Option<String>,
	) -> Result<Self, GatewayError> {
		let client = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.map_err(|e| GatewayError::Configuration(e.to_string()))?;

		Ok(Self {
			client,
			base_url: base_url.trim_end_matches('/').to_string(),
			api_key,
		})
	}

	fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		match &self.api_key {
			Some(key) => builder.bearer_auth(key),
			None => builder,
		}
	}

	/// Maps a reqwest transport error to a gateway error. Timeouts and
	/// connection failures leave the outcome unknown.
	fn transport_error(e: reqwest::Error) -> GatewayError {
		GatewayError::Unavailable(e.to_string())
	}

	/// Classifies a non-success HTTP status.
	async fn status_error(response: reqwest::Response) -> GatewayError {
		let status = response.status();
		let body = response.text().await.unwrap_or_default();
		if status.is_client_error() {
			GatewayError::Rejected(format!("HTTP {}: {}", status.as_u16(), body))
		} else {
			GatewayError::Unavailable(format!("HTTP {}: {}", status.as_u16(), body))
		}
	}
}

#[async_trait]
impl PaymentGatewayInterface for HttpGateway {
	async fn create_transaction(
		&self,
		order_id: &str,
		amount: Decimal,
	) -> Result<PaymentToken, GatewayError> {
		let url = format!("{}/transactions", self.base_url);
		let response = self
			.request(self.client.post(&url))
			.json(&CreateTransactionBody { order_id, amount })
			.send()
			.await
			.map_err(Self::transport_error)?;

		if !response.status().is_success() {
			return Err(Self::status_error(response).await);
		}

		let body: TransactionResponse = response
			.json()
			.await
			.map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;

		Ok(PaymentToken {
			token: body.token,
			reference: body.reference,
		})
	}

	async fn fetch_status(&self, order_id: &str) -> Result<GatewayTransactionStatus, GatewayError> {
		let url = format!("{}/transactions/{}", self.base_url, order_id);
		let response = self
			.request(self.client.get(&url))
			.send()
			.await
			.map_err(Self::transport_error)?;

		if !response.status().is_success() {
			return Err(Self::status_error(response).await);
		}

		let body: StatusResponse = response
			.json()
			.await
			.map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;

		Ok(body.status)
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		Box::new(HttpGatewaySchema)
	}
}

/// Configuration schema for HttpGateway.
pub struct HttpGatewaySchema;

impl ConfigSchema for HttpGatewaySchema {
	fn validate(&self, config: &toml::Value) -> Result<(), ValidationError> {
		let schema = Schema::new(
			vec![Field::new("base_url", FieldType::String).with_validator(|v| {
				let url = v.as_str().unwrap_or("");
				if url.starts_with("http://") || url.starts_with("https://") {
					Ok(())
				} else {
					Err("base_url must start with http:// or https://".into())
				}
			})],
			vec![
				Field::new(
					"timeout_ms",
					FieldType::Integer {
						min: Some(1),
						max: None,
					},
				),
				Field::new("api_key", FieldType::String),
			],
		);
		schema.validate(config)
	}
}

/// Registry entry for the HTTP gateway implementation.
pub struct Registry;

impl ImplementationRegistry for Registry {
	const NAME: &'static str = "http";
	type Factory = crate::GatewayFactory;

	fn factory() -> Self::Factory {
		create_gateway
	}
}

impl crate::GatewayRegistry for Registry {}

/// Factory function to create an HTTP gateway from configuration.
///
/// Configuration parameters:
/// - `base_url`: Gateway API base URL (required)
/// - `timeout_ms`: Request timeout in milliseconds (default: 10000)
/// - `api_key`: Bearer token for authentication (optional)
pub fn create_gateway(
	config: &toml::Value,
) -> Result<Box<dyn PaymentGatewayInterface>, GatewayError> {
	HttpGatewaySchema
		.validate(config)
		.map_err(|e| GatewayError::Configuration(e.to_string()))?;

	let base_url = config
		.get("base_url")
		.and_then(|v| v.as_str())
		.ok_or_else(|| GatewayError::Configuration("base_url is required".into()))?
		.to_string();

	let timeout_ms = config
		.get("timeout_ms")
		.and_then(|v| v.as_integer())
		.map(|v| v as u64)
		.unwrap_or(DEFAULT_TIMEOUT_MS);

	let api_key = config
		.get("api_key")
		.and_then(|v| v.as_str())
		.map(|s| s.to_string());

	Ok(Box::new(HttpGateway::new(
		base_url,
		Duration::from_millis(timeout_ms),
		api_key,
	)?))
}
