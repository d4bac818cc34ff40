//! termrelay-core: Shared protocol library for the terminal relay.
//!
//! Provides the JSON wire message types exchanged between clients and the
//! relay server, plus the error taxonomy shared by both sides.

pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use error::{RelayError, RelayResult};
pub use messages::{now_millis, ClientMessage, ServerEvent};
