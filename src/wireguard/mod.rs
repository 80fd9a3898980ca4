//! Userspace WireGuard: Noise handshake, transport sessions, and a device
//! that carries a virtual interface's packets to a single peer

pub mod device;
pub mod handshake;
pub mod noise;
pub mod session;
pub mod uapi;

pub use device::{Device, UdpBind};
pub use uapi::{DeviceConfig, PeerConfig};
