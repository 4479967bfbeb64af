//! Proxy module - per-alias reverse proxy servers

pub mod forward;
pub mod ports;
pub mod router;
pub mod server;
pub mod upstream;

pub use ports::PortAllocator;
pub use router::{ProxyEndpoint, ProxyRouter};
pub use server::{ListenerState, ReverseProxyServer};
