//! Session Broker Library
//!
//! Core components for brokering ephemeral, per-user browser-IDE sessions:
//! the session store, the port allocator, the idle monitor, the container
//! runtime driver and the token-routed data-plane proxy.

pub mod api;
pub mod auth;
pub mod db;
pub mod monitor;
pub mod ports;
pub mod proxy;
pub mod runtime;
pub mod store;
