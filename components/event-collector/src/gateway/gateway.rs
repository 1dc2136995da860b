//! Session gateway contract.
//!
//! The collection pipeline never talks to vCenter directly. It asks a
//! `SessionGateway` for an `EventCursor` bound to one `EventFilterSpec` and then
//! drains that cursor page by page. Everything vendor specific (authentication,
//! managed object references, fault decoding) lives behind these two traits.

// Local crates
use crate::{collector::filter::EventFilterSpec, models::event::Event};

// External crates
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Gateway error classes.
///
/// Only `Connection` is considered transient; it is what the retry wrapper
/// re-attempts during cursor acquisition.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// DNS, TCP/TLS, timeout, authentication or server-side (5xx) failure.
    #[error("connection failed: {0}")]
    Connection(String),
    /// The server answered with a fault that retrying will not fix.
    #[error("server fault {fault}: {message}")]
    Fault { fault: String, message: String },
    /// The server answered with something that could not be decoded.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    /// The cursor was used after it was closed.
    #[error("cursor already closed")]
    CursorClosed,
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Connection(_))
    }
}

/// Login material. `Debug` never prints the password.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything needed to reach and authenticate against a management endpoint.
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
    pub tls_verify: bool,
    pub pool_timeout: Duration,
}

/// Produces cursors bound to a filter.
#[async_trait]
pub trait SessionGateway: Send + Sync {
    type Cursor: EventCursor;

    /// Connect, authenticate and create a server-side cursor for `filter`.
    async fn acquire_cursor(&self, filter: &EventFilterSpec) -> Result<Self::Cursor, GatewayError>;
}

/// Stateful server-side iterator over the events matching one filter.
#[async_trait]
pub trait EventCursor: Send {
    /// Read up to `max_count` events. An empty page means the cursor is drained.
    async fn read_next(&mut self, max_count: usize) -> Result<Vec<Event>, GatewayError>;

    /// Release the server-side cursor and its session. Closing twice is a no-op.
    async fn close(&mut self) -> Result<(), GatewayError>;
}
