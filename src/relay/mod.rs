//! Data Relay Module
//!
//! Moves bytes in both directions between an accepted client and its remote.

pub mod engine;
pub mod pump;
pub mod session;

pub use engine::RelayEngine;
pub use pump::{Direction, Relay};
pub use session::{ConnectionStats, RelaySession};
