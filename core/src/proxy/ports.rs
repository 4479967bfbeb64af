//! Port allocation for per-alias listeners.
//!
//! A probe is advisory only: the port is released again before the caller
//! binds it, so the real bind in [`crate::proxy::server`] is what decides.

use std::net::TcpListener;
use tracing::debug;

use crate::config::ServerConfig;
use crate::error::RouterError;

/// Check if a port is available by binding to it and dropping the listener.
pub fn is_port_available(host: &str, port: u16) -> bool {
    match TcpListener::bind((host, port)) {
        Ok(listener) => listener.local_addr().is_ok(),
        Err(_) => false,
    }
}

#[derive(Debug, Clone)]
pub struct PortAllocator {
    host: String,
    last_port: u16,
}

impl PortAllocator {
    pub fn new(host: impl Into<String>, last_port: u16) -> Self {
        Self {
            host: host.into(),
            last_port,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.host.clone(), config.last_port())
    }

    pub fn last_port(&self) -> u16 {
        self.last_port
    }

    /// First port at or above `start_port` that accepts a transient bind.
    pub fn find_free(&self, start_port: u16) -> Result<u16, RouterError> {
        for port in start_port..=self.last_port {
            if is_port_available(&self.host, port) {
                debug!(port = %port, "Probed free port");
                return Ok(port);
            }
            debug!(port = %port, "Port unavailable on system, skipping");
        }

        Err(RouterError::NoFreePort {
            start: start_port,
            end: self.last_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_bound_port() {
        let held = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let busy = held.local_addr().unwrap().port();
        if busy == u16::MAX {
            return;
        }

        let allocator = PortAllocator::new("127.0.0.1", busy.saturating_add(50));
        let port = allocator.find_free(busy).unwrap();
        assert!(port > busy);
        assert!(!is_port_available("127.0.0.1", busy));
    }

    #[test]
    fn probe_does_not_reserve() {
        let probe = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let start = probe.local_addr().unwrap().port();
        drop(probe);

        let allocator = PortAllocator::new("127.0.0.1", start.saturating_add(50));
        let port = allocator.find_free(start).unwrap();
        // Still bindable right after the probe.
        assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[test]
    fn exhausted_range_is_an_error() {
        let held = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let busy = held.local_addr().unwrap().port();

        let allocator = PortAllocator::new("127.0.0.1", busy);
        assert!(matches!(
            allocator.find_free(busy),
            Err(RouterError::NoFreePort { start, end }) if start == busy && end == busy
        ));
    }
}
