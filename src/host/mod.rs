//! Host side of the bridge: the page-thread loop, call-in routing, and the
//! workers that keep engines off the page thread.

pub mod dispatcher;
pub mod emitter;
pub mod event_loop;
pub mod worker;

pub use dispatcher::Dispatcher;
pub use emitter::CallOutEmitter;
pub use event_loop::{Host, HostHandle, HostMessage};
pub use worker::{CancelRegistry, Spawn, ThreadSpawner, WorkerState};
