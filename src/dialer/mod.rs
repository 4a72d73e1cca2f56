//! Remote Dialer Module
//!
//! Opens the outbound leg of a tunnel, optionally wrapped in TLS.

pub mod connector;
pub mod tls;

pub use connector::{Dialer, RemoteStream};
