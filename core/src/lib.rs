//! llm-alias-proxy core library
//! Model registry and per-alias reverse proxies that rewrite the `model` field

pub mod config;
pub mod error;
pub mod manager;
pub mod proxy;
pub mod registry;
pub mod store;

pub use manager::ProxyManager;
