//! Connection Registry
//!
//! Accepted connections, their lifecycle, and the set that owns them.

pub mod handle;
pub mod set;

pub use handle::{CloseReason, ConnectionHandle, ConnectionId, ConnectionState};
pub use set::{ConnectionSet, Control};
