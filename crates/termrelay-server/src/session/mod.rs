//! Session management: PTY lifecycle, registry, metadata persistence.

pub mod persistence;
pub mod pty;
pub mod registry;

pub use persistence::{PersistedSessionRecord, SessionStore};
pub use pty::PtyHandle;
pub use registry::{
    DestroyReason, PtySession, SessionEvent, SessionLifecycle, SessionOptions, SessionRegistry,
};
