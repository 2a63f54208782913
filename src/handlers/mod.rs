//! HTTP handlers. Each handler resolves the caller, delegates to the
//! lifecycle coordinator and maps the outcome onto a response.

pub mod attachment_handlers;
pub mod health_handlers;
pub mod maintenance_handlers;
pub mod owner;
