//! Turretlink - control protocol client for a remotely operated turret
//!
//! A client finds a turret server with a UDP broadcast, opens one TCP
//! command session, and sends move, shoot, status and reset requests,
//! each answered by a single MessagePack reply.

pub mod config;
pub mod discovery;
pub mod network;
pub mod protocol;

pub use discovery::{Discovery, DiscoveryConfig, DiscoveryError};
pub use network::{AckStatus, ClientError, ClientResult, SessionConfig, TurretClient};
