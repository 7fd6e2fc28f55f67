use tracing::warn;

use super::multiplexer::Multiplexer;
use crate::channel::ScriptEngine;
use crate::protocol::CallOut;

/// A page without a page: understands exactly the call-out snippets the
/// host emits and feeds them to a [`Multiplexer`].
pub struct HeadlessScript {
    namespace: String,
    multiplexer: Multiplexer,
}

impl HeadlessScript {
    pub fn new(namespace: impl Into<String>, multiplexer: Multiplexer) -> Self {
        Self {
            namespace: namespace.into(),
            multiplexer,
        }
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.multiplexer
    }

    fn deliver(&self, call_out: CallOut) {
        let mux = &self.multiplexer;
        match call_out {
            CallOut::Resolve { id, value } => mux.resolve(&id, value),
            CallOut::Reject { id, message } => mux.reject(&id, message),
            CallOut::StreamPush { id, chunk } => mux.stream_push(&id, chunk),
            CallOut::StreamEnd { id } => mux.stream_end(&id),
            CallOut::StreamError { id, message } => mux.stream_error(&id, message),
        }
    }
}

impl ScriptEngine for HeadlessScript {
    fn evaluate(&mut self, snippet: &str) {
        match CallOut::parse(&self.namespace, snippet) {
            Ok(call_out) => self.deliver(call_out),
            Err(err) => warn!(error = %err, "cannot evaluate snippet"),
        }
    }
}
