//! Reverse TCP tunnel.
//!
//! A client running behind NAT dials out to a publicly reachable server,
//! authenticates with a shared secret and keeps a control channel open.
//! The server binds a public port and announces it to the client; every
//! connection arriving on that port is paired with a data channel the
//! client dials back on demand, and bytes are relayed both ways between
//! the public connection and the client's local service.

use std::time::Duration;

pub mod client;
pub mod config;
pub mod error;
pub mod messages;
pub mod monitor;
pub mod relay;
pub mod server;

pub use error::Error;

/// Deadline for dialing either endpoint and for the bootstrap secret read.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long an accepted data channel waits for a public connection to pair with
/// before it is dropped.
pub const PAIRING_TIMEOUT: Duration = Duration::from_secs(30);

/// Client-side control-channel read deadline. Elapsing is only logged; the
/// read continues.
pub const CONTROL_READ_TIMEOUT: Duration = Duration::from_secs(60);
