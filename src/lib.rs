//! # hostbridge: native engines behind a page's script runtime
//!
//! A page's script engine and a native host share exactly one narrow
//! channel: the script may invoke a named entry point with a single string
//! payload, and the host may hand the page a snippet of script source to
//! evaluate. hostbridge layers awaitable calls, token streams and lazily
//! loaded native engines on top of that channel.
//!
//! ## Layout
//!
//! ### 1. Wire vocabulary
//! - Entry points, request envelopes and validation ([`protocol`])
//! - Script string-literal encoding ([`codec`])
//! - The channel itself ([`channel`])
//!
//! ### 2. Host side
//! - Page-thread loop, routing and workers ([`host`])
//! - Engine lifecycle and discovery ([`engine`])
//!
//! ### 3. Script side
//! - Correlation of calls and streams ([`script`])
//!
//! ## Flow of a streaming call
//!
//! ```text
//! Multiplexer::generate → call-in "llm.stream" → Dispatcher → StreamingWorker
//!      ↑                                                          │
//!      └── streamPush* then streamEnd | streamError ←── snippets ─┘
//! ```
//!
//! Engines never run on the page thread, never run twice at once for the
//! same family, and every request settles exactly once.

pub mod bridge;
pub mod channel;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod host;
pub mod protocol;
pub mod script;
pub mod testing;

// Re-exports
pub use bridge::{BridgeBuilder, HeadlessBridge};
pub use config::BridgeConfig;
pub use error::*;
pub use protocol::{EntryPoint, Family};
pub use script::{BridgeStream, CallError, Multiplexer};
