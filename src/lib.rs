//! tlstunnel Library
//!
//! Transparent TCP tunnel: accepts plaintext TCP clients and relays their
//! bytes, unmodified, to one remote endpoint, optionally over TLS.

pub mod config;
pub mod connection;
pub mod dialer;
pub mod relay;
pub mod resource;
pub mod shutdown;

pub use config::Config;
pub use connection::ConnectionManager;
pub use dialer::Dialer;
pub use relay::RelayEngine;
pub use resource::ResourceManager;
pub use shutdown::ShutdownCoordinator;

/// Common error type for the tunnel
pub type Result<T> = anyhow::Result<T>;
