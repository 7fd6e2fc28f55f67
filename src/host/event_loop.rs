use std::{collections::HashSet, ops::ControlFlow, sync::Arc};

use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use super::dispatcher::Dispatcher;
use crate::channel::{CallIn, ScriptEngine, ScriptSink};

/// Work queued for the page thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMessage {
    CallIn { entry: String, payload: String },
    Evaluate(String),
    Shutdown,
}

/// Cloneable, thread-safe front door to a [`Host`].
///
/// Serves as both channel directions: scripts invoke entry points through
/// it and workers submit call-out snippets through it. Either way the work
/// is queued and runs on the host loop in submission order.
#[derive(Clone)]
pub struct HostHandle {
    sender: mpsc::UnboundedSender<HostMessage>,
    bound: Arc<HashSet<String>>,
}

impl HostHandle {
    pub fn channel(
        bound: impl IntoIterator<Item = String>,
    ) -> (Self, mpsc::UnboundedReceiver<HostMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = Self {
            sender,
            bound: Arc::new(bound.into_iter().collect()),
        };
        (handle, receiver)
    }

    pub fn shutdown(&self) {
        let _ = self.sender.send(HostMessage::Shutdown);
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    fn send(&self, message: HostMessage) {
        if let Err(mpsc::error::SendError(message)) = self.sender.send(message) {
            debug!(?message, "host loop has stopped; message dropped");
        }
    }
}

impl CallIn for HostHandle {
    fn is_bound(&self, entry: &str) -> bool {
        self.bound.contains(entry)
    }

    fn invoke(&self, entry: &str, payload: String) {
        self.send(HostMessage::CallIn {
            entry: entry.to_string(),
            payload,
        });
    }
}

impl ScriptSink for HostHandle {
    fn submit(&self, snippet: String) {
        self.send(HostMessage::Evaluate(snippet));
    }
}

/// The page thread: a single consumer that owns the script engine and the
/// dispatcher, so neither is ever touched concurrently.
pub struct Host<S> {
    receiver: mpsc::UnboundedReceiver<HostMessage>,
    dispatcher: Dispatcher,
    script: S,
}

impl<S: ScriptEngine> Host<S> {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<HostMessage>,
        dispatcher: Dispatcher,
        script: S,
    ) -> Self {
        Self {
            receiver,
            dispatcher,
            script,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn script(&self) -> &S {
        &self.script
    }

    pub fn handle_message(&mut self, message: HostMessage) -> ControlFlow<()> {
        match message {
            HostMessage::CallIn { entry, payload } => {
                self.dispatcher.dispatch(&entry, &payload);
            }
            HostMessage::Evaluate(snippet) => {
                trace!(%snippet, "evaluating");
                self.script.evaluate(&snippet);
            }
            HostMessage::Shutdown => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    /// Processes whatever is queued right now without waiting, for hosts
    /// driven by a foreign event loop. Returns how many messages ran, or
    /// `None` once shutdown was requested.
    pub fn pump(&mut self) -> Option<usize> {
        let mut handled = 0;
        while let Ok(message) = self.receiver.try_recv() {
            if self.handle_message(message).is_break() {
                return None;
            }
            handled += 1;
        }
        Some(handled)
    }

    pub async fn run(mut self) {
        info!(families = ?self.dispatcher.families(), "host loop started");
        while let Some(message) = self.receiver.recv().await {
            if self.handle_message(message).is_break() {
                break;
            }
        }
        info!("host loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BridgeConfig, BusyPolicy};
    use crate::engine::{DirectoryCatalog, EngineManager};
    use crate::host::emitter::CallOutEmitter;
    use crate::protocol::EntryPoint;
    use crate::testing::{InlineSpawner, ScriptedEngine, ScriptedLoader};
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct RecordingScript {
        evaluated: Vec<String>,
    }

    impl ScriptEngine for RecordingScript {
        fn evaluate(&mut self, snippet: &str) {
            self.evaluated.push(snippet.to_string());
        }
    }

    fn host() -> (Host<RecordingScript>, HostHandle) {
        let config = BridgeConfig::default();
        let manager = EngineManager::new(
            crate::protocol::Family::Llm,
            Arc::new(DirectoryCatalog::new("/unused", "gguf")),
            Arc::new(ScriptedLoader::new(ScriptedEngine::new().completion("pong"))),
            BusyPolicy::Queue,
        );
        manager.load_explicit("m").unwrap();
        let entries = EntryPoint::bound_for([crate::protocol::Family::Llm])
            .into_iter()
            .map(|entry| entry.to_string());
        let (handle, receiver) = HostHandle::channel(entries);
        let emitter = CallOutEmitter::new(config.namespace.clone(), Arc::new(handle.clone()));
        let dispatcher = Dispatcher::new(
            [Arc::new(manager)],
            emitter,
            Arc::new(InlineSpawner),
            &config,
        );
        (
            Host::new(receiver, dispatcher, RecordingScript::default()),
            handle,
        )
    }

    #[test]
    fn test_handle_reports_bound_entries() {
        let (_host, handle) = host();
        assert!(handle.is_bound("llm.complete"));
        assert!(handle.is_bound("bridge.cancel"));
        assert!(!handle.is_bound("tts.complete"));
    }

    #[test]
    fn test_pump_runs_call_in_then_its_call_out() {
        let (mut host, handle) = host();
        handle.invoke("llm.complete", r#"{"id":"1","prompt":"ping"}"#.to_string());

        // The call-in runs first; its resolution is queued behind it.
        assert_eq!(host.pump(), Some(2));
        assert_eq!(
            host.script().evaluated,
            vec![r#"window.__hostbridge.resolve("1","pong");"#]
        );

        handle.shutdown();
        handle.submit("ignored();".to_string());
        assert_eq!(host.pump(), None);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (host, handle) = host();
        let task = tokio::spawn(host.run());
        handle.shutdown();
        task.await.unwrap();
        assert!(handle.is_closed());
        // Late call-outs are dropped quietly.
        handle.submit("late();".to_string());
    }
}
