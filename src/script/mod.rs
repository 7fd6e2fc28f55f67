//! Script side of the bridge: what a page uses to talk to the host.

use thiserror::Error;

use crate::protocol::CorrelationId;

pub mod headless;
pub mod multiplexer;

pub use headless::HeadlessScript;
pub use multiplexer::{BridgeStream, Multiplexer};

/// Why a call or stream did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    #[error("`{0}` is not available in this host")]
    Unavailable(String),
    #[error("`{0}` cannot be used this way")]
    Misrouted(String),
    #[error("{0}")]
    Rejected(String),
    #[error("request {0} timed out")]
    Timeout(CorrelationId),
    #[error("bridge went away before request {0} settled")]
    Disconnected(CorrelationId),
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}
