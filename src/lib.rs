//! wgnc - netcat over a userspace WireGuard tunnel
//!
//! The pipeline is sequential until the relay:
//!
//! 1. [`config`] parses a WireGuard configuration file into a
//!    [`ConnectionPlan`] (interface address and key, the first peer with an
//!    endpoint, the address to dial inside the tunnel);
//! 2. [`resolver`] resolves the peer endpoint through a fixed DNS server;
//! 3. [`bootstrap`] creates a virtual interface ([`netstack`]) and brings a
//!    [`wireguard`] device up on it;
//! 4. [`relay`] dials the target through the tunnel and copies bytes
//!    between it and a pair of local streams.
//!
//! # Usage
//!
//! ```no_run
//! use wgnc::bootstrap::{self, BootstrapOptions};
//! use wgnc::resolver::FixedDnsResolver;
//! use wgnc::{relay, ConnectionPlan};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), wgnc::WgncError> {
//!     let plan = ConnectionPlan::from_file("wg0.conf")?;
//!     let target = plan.dial_target()?;
//!     let resolver = FixedDnsResolver::default();
//!     let (_device, stack) =
//!         bootstrap::bring_up(&plan, &BootstrapOptions::default(), &resolver).await?;
//!     relay::run(&stack, target, tokio::io::stdin(), tokio::io::stdout()).await?;
//!     Ok(())
//! }
//! ```

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod netstack;
pub mod relay;
pub mod resolver;
pub mod wireguard;

pub use config::ConnectionPlan;
pub use error::WgncError;
