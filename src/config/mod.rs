//! Configuration loading
//!
//! Parses the WireGuard-style document and turns it into a single
//! [`ConnectionPlan`].

pub mod keys;
pub mod parser;
pub mod plan;

pub use plan::{parse_port, ConnectionPlan, PeerEndpoint, DEFAULT_CONNECT_PORT};
