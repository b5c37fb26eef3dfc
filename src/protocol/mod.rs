//! Protocol module - Defines the wire protocol for turret control
//!
//! Every message is a MessagePack map carrying a `"type"` tag plus the
//! fields of its variant. On stream transports a frame is either exactly
//! one MessagePack value (the default) or a length-prefixed payload:
//! - 4 bytes payload length (big-endian)
//! - Variable length payload

mod codec;
mod message;

pub use codec::*;
pub use message::*;

/// Well-known UDP port the turret server listens on for discovery
pub const DISCOVERY_PORT: u16 = 12346;

/// Default TCP command port, used when an address is given without one
pub const DEFAULT_COMMAND_PORT: u16 = 12345;

/// Largest payload a single UDP datagram can carry
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Default upper bound for a single framed message on the command stream
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;
