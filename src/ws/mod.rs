//! The realtime connection: lifecycle, wire format, routing and transport.

pub mod connection;
pub mod event;
pub mod router;
pub mod service;
pub mod transport;
pub mod types;
