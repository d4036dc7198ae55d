//! Session Module
//!
//! Sessions carry per-client state across requests. The dispatcher binds a
//! session to each request through a cookie; stores decide where sessions
//! live.
//!
//! ## Modules
//!
//! - `store`: `Session`, the `SessionStore` trait and `MemorySessionStore`
//! - `sweeper`: background removal of idle sessions

pub mod store;
pub mod sweeper;

pub use store::{
    generate_session_id, MemorySessionStore, Session, SessionError, SessionStore,
    MAX_SESSION_ID_LEN,
};
pub use sweeper::{SessionSweeper, SweeperConfig};
