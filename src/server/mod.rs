//! QuickIM server
//!
//! ## Layout
//!
//! - **listener**: accept loop, connection limit, shutdown
//! - **connection**: one task per socket plus a writer task draining its send queue
//! - **auth**: registration, login, logout
//! - **registry**: live sessions indexed by user, username and connection
//! - **presence**: contact lists, presence fan-out, user search
//! - **router**: contact-restricted message delivery

pub mod auth;
pub mod connection;
pub mod listener;
pub mod presence;
pub mod registry;
pub mod router;

pub use auth::{AuthError, AuthService, RegisterError};
pub use connection::ConnectionHandler;
pub use listener::{ConnectionGuard, ConnectionLimiter, ImServer, ServerContext, ServerStats};
pub use presence::PresenceManager;
pub use registry::{
    ConnectionId, Outbound, OutboundHandle, OutboundQueue, Session, SessionRegistry,
};
pub use router::{MessageRouter, RouteOutcome};
