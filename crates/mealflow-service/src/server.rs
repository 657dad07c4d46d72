//! HTTP server for the mealflow API.
//!
//! Exposes the core entry points over axum. The caller's identity
//! arrives as the opaque `x-user-id` header set by the authenticating
//! proxy; token issuance and verification live outside this service.

use axum::{
	extract::{DefaultBodyLimit, Path, State},
	http::{HeaderMap, StatusCode},
	response::Json,
	routing::{get, post},
	Router,
};
use mealflow_config::ApiConfig;
use mealflow_core::{CoreError, Engine, PaymentHandler};
use mealflow_gateway::{GatewayError, PaymentGatewayService};
use mealflow_types::{
	ApiError, CreateOrderRequest, GatewayCallbackRequest, GatewaySignal, InitiatePaymentResponse,
	OrderSnapshot, Principal,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Retry hint handed to clients when the gateway is unreachable.
const GATEWAY_RETRY_AFTER_SECS: u64 = 5;

/// Shared application state for the API server.
#[derive(Clone)]
pub struct AppState {
	/// Core entry points for order operations.
	pub handler: Arc<PaymentHandler>,
	/// Gateway adapter, used to dead-letter unparsable webhooks.
	pub gateway: Arc<PaymentGatewayService>,
}

/// Starts the HTTP server for the API.
pub async fn start_server(
	api_config: ApiConfig,
	engine: Arc<Engine>,
) -> Result<(), Box<dyn std::error::Error>> {
	let app_state = AppState {
		handler: engine.handler(),
		gateway: engine.gateway(),
	};

	let app = Router::new()
		.nest(
			"/api",
			Router::new()
				.route("/orders", post(handle_create_order).get(handle_list_orders))
				.route("/orders/{id}", get(handle_get_order))
				.route("/orders/{id}/payment", post(handle_initiate_payment))
				.route("/orders/{id}/cancel", post(handle_cancel_order))
				.route("/gateway/callback", post(handle_gateway_callback)),
		)
		.layer(
			ServiceBuilder::new()
				.layer(TraceLayer::new_for_http())
				.layer(CorsLayer::permissive())
				.layer(DefaultBodyLimit::max(api_config.max_request_size)),
		)
		.with_state(app_state);

	let bind_address = format!("{}:{}", api_config.host, api_config.port);
	let listener = TcpListener::bind(&bind_address).await?;
	tracing::info!("Mealflow API server starting on {}", bind_address);

	axum::serve(listener, app).await?;
	Ok(())
}

/// Extracts the authenticated principal from the `x-user-id` header.
fn principal(headers: &HeaderMap) -> Result<Principal, ApiError> {
	headers
		.get("x-user-id")
		.and_then(|v| v.to_str().ok())
		.filter(|v| !v.is_empty())
		.map(Principal::new)
		.ok_or_else(|| ApiError::BadRequest {
			message: "Missing x-user-id header".into(),
		})
}

fn map_core_error(error: CoreError) -> ApiError {
	match error {
		CoreError::NotFound => ApiError::NotFound {
			message: "Order not found".into(),
		},
		CoreError::Forbidden => ApiError::Forbidden,
		CoreError::InvalidTransition { from, event } => ApiError::InvalidTransition {
			message: format!("{} not allowed from {}", event, from),
		},
		CoreError::ConcurrentModification => ApiError::ConcurrentModification,
		CoreError::Validation(message) => ApiError::BadRequest { message },
		CoreError::Gateway(gateway_error) => match gateway_error {
			GatewayError::Rejected(message) => ApiError::GatewayRejected { message },
			GatewayError::Unavailable(message) => ApiError::ServiceUnavailable {
				message,
				retry_after: Some(GATEWAY_RETRY_AFTER_SECS),
			},
			GatewayError::OrderNotFound => ApiError::NotFound {
				message: "Order not found".into(),
			},
			other => ApiError::Internal {
				message: other.to_string(),
			},
		},
		other => ApiError::Internal {
			message: other.to_string(),
		},
	}
}

/// Handles POST /api/orders requests.
async fn handle_create_order(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderSnapshot>), ApiError> {
	let principal = principal(&headers)?;
	let order = state
		.handler
		.create_order(&principal, request)
		.await
		.map_err(map_core_error)?;
	Ok((StatusCode::CREATED, Json(OrderSnapshot::from(&order))))
}

/// Handles GET /api/orders requests.
async fn handle_list_orders(
	State(state): State<AppState>,
	headers: HeaderMap,
) -> Result<Json<Vec<OrderSnapshot>>, ApiError> {
	let principal = principal(&headers)?;
	let orders = state
		.handler
		.list_orders(&principal)
		.await
		.map_err(map_core_error)?;
	Ok(Json(orders.iter().map(OrderSnapshot::from).collect()))
}

/// Handles GET /api/orders/{id} requests.
async fn handle_get_order(
	State(state): State<AppState>,
	headers: HeaderMap,
	Path(id): Path<String>,
) -> Result<Json<OrderSnapshot>, ApiError> {
	let principal = principal(&headers)?;
	let order = state
		.handler
		.get_order(&principal, &id)
		.await
		.map_err(map_core_error)?;
	Ok(Json(OrderSnapshot::from(&order)))
}

/// Handles POST /api/orders/{id}/payment requests.
async fn handle_initiate_payment(
	State(state): State<AppState>,
	headers: HeaderMap,
	Path(id): Path<String>,
) -> Result<Json<InitiatePaymentResponse>, ApiError> {
	let principal = principal(&headers)?;
	let (token, order) = state
		.handler
		.initiate_payment(&principal, &id)
		.await
		.map_err(map_core_error)?;
	Ok(Json(InitiatePaymentResponse {
		token,
		order: OrderSnapshot::from(&order),
	}))
}

/// Handles POST /api/orders/{id}/cancel requests.
async fn handle_cancel_order(
	State(state): State<AppState>,
	headers: HeaderMap,
	Path(id): Path<String>,
) -> Result<Json<OrderSnapshot>, ApiError> {
	let principal = principal(&headers)?;
	let order = state
		.handler
		.cancel_order(&principal, &id)
		.await
		.map_err(map_core_error)?;
	Ok(Json(OrderSnapshot::from(&order)))
}

/// Body of a gateway callback acknowledgement.
#[derive(Debug, Serialize)]
struct CallbackResponse {
	result: &'static str,
}

/// Handles POST /api/gateway/callback requests.
///
/// The body is taken raw: gateways send what they send, and a payload
/// this service cannot parse is preserved verbatim in the dead-letter
/// store before the 400 goes back.
async fn handle_gateway_callback(
	State(state): State<AppState>,
	body: String,
) -> Result<Json<CallbackResponse>, ApiError> {
	let request: GatewayCallbackRequest = match serde_json::from_str(&body) {
		Ok(request) => request,
		Err(e) => {
			let reference = format!("malformed-{}", uuid::Uuid::new_v4());
			state
				.gateway
				.record_dead_letter(&reference, &body, "unparsable callback payload")
				.await
				.map_err(|e| ApiError::Internal {
					message: e.to_string(),
				})?;
			return Err(ApiError::BadRequest {
				message: format!("Unparsable callback payload: {}", e),
			});
		},
	};

	let ack = state
		.handler
		.record_gateway_status(&GatewaySignal {
			order_id: request.order_id,
			status: request.transaction_status,
			reference: request.reference,
		})
		.await
		.map_err(map_core_error)?;

	Ok(Json(CallbackResponse {
		result: match ack {
			mealflow_types::GatewayAck::Applied => "applied",
			mealflow_types::GatewayAck::Duplicate => "duplicate",
			mealflow_types::GatewayAck::DeadLettered => "dead-lettered",
		},
	}))
}
