//! Connection Management Module
//!
//! Handles TCP connection acceptance and the lifecycle of each tunnel session.

pub mod manager;

pub use manager::{ConnectionManager, ConnectionStats};
