//! Order state management.

pub mod order;
