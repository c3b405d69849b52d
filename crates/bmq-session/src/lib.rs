//! Session, queue lifecycle and event dispatch for the broker client.
//!
//! Provides:
//! - `Session` - Connect, open/configure/close queues, post and confirm
//! - `SessionHandle` / `MessageHandle` - Weak handles for use in callbacks
//! - Host-health driven queue suspension
//! - Engine implementations (in-memory)

mod dispatch;
pub mod engine;
mod handle;
mod health;
pub mod ledger;
pub mod registry;
mod session;

pub use bmq_core;
pub use handle::{MessageHandle, SessionHandle};
pub use session::{
    MessageCallback, PostMessage, Session, SessionBuilder, SessionEventCallback, SessionState,
};
