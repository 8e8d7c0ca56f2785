//! Server-side session management
//!
//! Each accepted stream becomes a [`StreamSession`] registered in the
//! [`SessionRegistry`] under the identifier its client announced in the first
//! message. A client that reconnects with the same identifier replaces its
//! own stale session.

pub mod registry;
pub mod stream_session;

pub use registry::{SessionConfig, SessionInfo, SessionRegistry};
pub use stream_session::StreamSession;
