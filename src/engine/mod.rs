//! # Engine Capability boundary
//!
//! Engines are opaque, heavyweight native resources: a language model, a
//! speech synthesizer, anything that turns an input and a token budget into
//! tokens through a blocking call. This module only defines the seam; the
//! bridge never assumes an engine is reentrant, which is why every method
//! takes `&mut self`.
//!
//! - [`catalog`]: resource discovery by directory convention
//! - [`manager`]: lazy load/unload and exclusive access per family
//! - [`echo`]: a deterministic engine for demos and tests

use std::{
    ops::ControlFlow,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod catalog;
pub mod echo;
pub mod manager;

pub use catalog::{DirectoryCatalog, ResourceCatalog};
pub use echo::{EchoEngine, EchoLoader};
pub use manager::EngineManager;

/// Engine-specific failure kinds, rendered as short messages for the page.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("tokenization failed")]
    TokenizeFailed,
    #[error("decoding failed")]
    DecodeFailed,
    #[error("engine ran out of resources")]
    ResourceExhausted,
    #[error("{0}")]
    Other(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Called once per produced token; `Break` asks the engine to stop early.
pub type TokenCallback<'a> = dyn FnMut(&str) -> ControlFlow<()> + 'a;

pub trait Engine: Send {
    fn complete_once(&mut self, input: &str, budget: u32) -> EngineResult<String>;

    /// Blocks until generation ends. `on_token` runs on the calling thread.
    fn stream_generate(
        &mut self,
        input: &str,
        budget: u32,
        on_token: &mut TokenCallback<'_>,
    ) -> EngineResult<()>;
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("resource not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("invalid resource name `{0}`")]
    InvalidName(String),
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("engine rejected {}: {reason}", path.display())]
    Rejected { path: PathBuf, reason: String },
}

/// Constructs engines from resolved resource paths. Dropping the returned
/// engine unloads it.
#[mockall::automock]
pub trait EngineLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Box<dyn Engine>, LoadError>;
}

/// Snapshot of one family's lifecycle state, as reported to the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub loaded: bool,
    pub resource: Option<String>,
    pub auto_load_attempted: bool,
}
