//! Connection gateway: listener, routing, and per-session bridging

pub mod bridge;
pub mod bus;
pub mod forwarder;
pub mod router;
pub mod server;

pub use server::Gateway;
