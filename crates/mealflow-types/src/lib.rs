//! Common types module for the mealflow order coordination system.
//!
//! This module defines the core data types and structures used throughout
//! the system. It provides a centralized location for shared types to
//! ensure consistency across all components.

/// API types for HTTP endpoints and request/response structures.
pub mod api;
/// Notification event types emitted by the order state machine.
pub mod events;
/// Payment gateway types for transaction status and tokens.
pub mod gateway;
/// Order aggregate, status enum and transition events.
pub mod order;
/// Authenticated principal passed explicitly into every core operation.
pub mod principal;
/// Registry trait for self-registering backend implementations.
pub mod registry;
/// Storage types for managing persistent data.
pub mod storage;
/// Utility functions for formatting and timestamps.
pub mod utils;
/// Configuration validation utilities.
pub mod validation;

// Re-export all types for convenient access
pub use api::*;
pub use events::*;
pub use gateway::*;
pub use order::*;
pub use principal::*;
pub use registry::*;
pub use storage::*;
pub use utils::*;
pub use validation::*;
