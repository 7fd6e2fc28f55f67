use thiserror::Error;

use crate::config::ConfigError;
use crate::engine::{EngineError, LoadError};
use crate::protocol::{Family, TransportError, ValidationError};
use crate::script::CallError;

/// Host-side failures. Every one of these that has a correlation id ends up
/// as a single reject or stream error on the page; the `Display` text is the
/// message the script sees.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("{0}")]
    Transport(#[from] TransportError),
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    NotReady(String),
    #[error("{0}")]
    Engine(#[from] EngineError),
    #[error("failed to load resource: {0}")]
    Load(#[from] LoadError),
    #[error("failed to start worker: {0}")]
    Spawn(String),
    #[error("{0} engine is busy")]
    Busy(Family),
    #[error("cancelled")]
    Cancelled,
    #[error("engine panicked")]
    Panicked,
    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),
    #[error("Call error: {0}")]
    Call(#[from] CallError),
}

pub type InternalResult<T> = Result<T, Error>;
