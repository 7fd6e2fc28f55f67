use std::sync::Arc;

use tracing::{debug, trace};

use crate::channel::ScriptSink;
use crate::protocol::CallOut;

/// Renders notifications into snippets and hands them to the page.
#[derive(Clone)]
pub struct CallOutEmitter {
    namespace: Arc<str>,
    sink: Arc<dyn ScriptSink>,
}

impl CallOutEmitter {
    pub fn new(namespace: impl Into<Arc<str>>, sink: Arc<dyn ScriptSink>) -> Self {
        Self {
            namespace: namespace.into(),
            sink,
        }
    }

    pub fn emit(&self, call_out: CallOut) {
        if call_out.is_terminal() {
            debug!(id = %call_out.id(), notification = %call_out.notification(), "settled");
        } else {
            trace!(id = %call_out.id(), "stream push");
        }
        self.sink.submit(call_out.render(&self.namespace));
    }

    pub fn settle(&self, id: &str, value: &str) {
        self.emit(CallOut::Resolve {
            id: id.to_string(),
            value: value.to_string(),
        });
    }

    pub fn fail(&self, id: &str, message: &str) {
        self.emit(CallOut::Reject {
            id: id.to_string(),
            message: message.to_string(),
        });
    }

    pub fn stream_push(&self, id: &str, chunk: &str) {
        self.emit(CallOut::StreamPush {
            id: id.to_string(),
            chunk: chunk.to_string(),
        });
    }

    /// Ends a stream: cleanly with `None`, with an error otherwise.
    pub fn stream_terminate(&self, id: &str, error: Option<&str>) {
        let call_out = match error {
            None => CallOut::StreamEnd { id: id.to_string() },
            Some(message) => CallOut::StreamError {
                id: id.to_string(),
                message: message.to_string(),
            },
        };
        self.emit(call_out);
    }
}
