//! Operation handlers exposed to the service layer.

pub mod payment;
