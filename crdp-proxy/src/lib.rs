//! crdp-proxy: serve the channels of one DevTools connection to several WebSocket
//! clients.

pub mod routes;
pub mod server;
pub mod session;

pub use server::{ServerConfig, serve};
