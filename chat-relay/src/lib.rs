//! Multi-user line chat relay over TCP.
//!
//! Clients connect, send a display name as their first line, and every line
//! after that is rebroadcast to all other connected clients as
//! `[name]: text`. Join and leave notices are sent to everyone else.
//!
//! - [`relay`] binds the listener and spawns one task per connection.
//! - [`session`] runs the per-connection handshake, message loop and teardown.
//! - [`registry`] tracks live sessions and fans messages out to them.
//! - [`notice`] renders the lines the relay writes to clients.
//! - [`line`] reads and writes newline-delimited text.
//! - [`cli`] parses the command line.

pub mod cli;
pub mod line;
pub mod notice;
pub mod registry;
pub mod relay;
pub mod session;

pub use registry::{DeliveryError, Registry, SessionHandle, SessionId};
pub use relay::{Relay, RelayConfig};
