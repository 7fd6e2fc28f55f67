use std::{collections::HashMap, sync::Arc};

use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use super::emitter::CallOutEmitter;
use super::worker::{CancelRegistry, OneShotWorker, Spawn, StreamJob, StreamingWorker};
use crate::config::BridgeConfig;
use crate::engine::EngineManager;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{BudgetPolicy, EntryPoint, Envelope, Family, Request};

/// Host-side routing of call-ins.
///
/// Runs on the page thread and never blocks it: anything touching an engine
/// is handed to a worker. Each call-in with a recoverable id is answered
/// exactly once, either here (validation, routing failures, cancel) or by
/// the worker it started.
pub struct Dispatcher {
    engines: HashMap<Family, Arc<EngineManager>>,
    budgets: HashMap<Family, BudgetPolicy>,
    emitter: CallOutEmitter,
    spawner: Arc<dyn Spawn>,
    cancellations: Arc<CancelRegistry>,
    worker_prefix: String,
}

impl Dispatcher {
    pub fn new(
        engines: impl IntoIterator<Item = Arc<EngineManager>>,
        emitter: CallOutEmitter,
        spawner: Arc<dyn Spawn>,
        config: &BridgeConfig,
    ) -> Self {
        let engines: HashMap<Family, Arc<EngineManager>> = engines
            .into_iter()
            .map(|engine| (engine.family(), engine))
            .collect();
        let budgets = engines
            .keys()
            .map(|family| (*family, config.budget_policy(*family)))
            .collect();
        Self {
            engines,
            budgets,
            emitter,
            spawner,
            cancellations: Arc::new(CancelRegistry::default()),
            worker_prefix: config.worker_name_prefix.clone(),
        }
    }

    pub fn families(&self) -> Vec<Family> {
        let mut families: Vec<Family> = self.engines.keys().copied().collect();
        families.sort();
        families
    }

    pub fn bound_entry_points(&self) -> Vec<EntryPoint> {
        EntryPoint::bound_for(self.families())
    }

    pub fn in_flight_streams(&self) -> usize {
        self.cancellations.len()
    }

    #[instrument(level = "debug", skip(self, payload))]
    pub fn dispatch(&self, entry: &str, payload: &str) {
        let Envelope { id, body } = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(error = %err, "dropping call-in without a usable id");
                return;
            }
        };

        let entry_point = match entry.parse::<EntryPoint>() {
            Ok(entry_point) => entry_point,
            Err(err) => {
                self.emitter.fail(&id, &BridgeError::from(err).to_string());
                return;
            }
        };

        if let Err(err) = self.route(entry_point, &id, &body) {
            debug!(%id, error = %err, "call-in refused");
            let message = err.to_string();
            if entry_point.is_streaming() {
                self.emitter.stream_terminate(&id, Some(&message));
            } else {
                self.emitter.fail(&id, &message);
            }
        }
    }

    fn route(&self, entry: EntryPoint, id: &str, body: &Map<String, Value>) -> BridgeResult<()> {
        let budget = entry
            .family()
            .and_then(|family| self.budgets.get(&family).copied())
            .unwrap_or_default();

        match Request::parse(entry, body, budget)? {
            Request::Cancel { target } => {
                let cancelled = self.cancellations.cancel(&target);
                debug!(%target, cancelled, "cancel requested");
                self.emitter.settle(id, if cancelled { "true" } else { "false" });
                Ok(())
            }
            Request::Stream {
                family,
                input,
                budget,
            } => {
                let engine = self.engine(family)?;
                let job = StreamJob {
                    id: id.to_string(),
                    input,
                    budget,
                };
                let worker = StreamingWorker::new(
                    job,
                    engine,
                    self.emitter.clone(),
                    self.cancellations.clone(),
                );
                // A spawn failure has already been reported on the stream.
                let _ = worker.start(self.spawner.as_ref(), self.worker_name(family, id));
                Ok(())
            }
            Request::Complete {
                family,
                input,
                budget,
            } => self.one_shot(family, id, move |engine| engine.complete(&input, budget)),
            Request::Load { family, name } => {
                self.one_shot(family, id, move |engine| engine.load_explicit(&name))
            }
            Request::Unload { family } => self.one_shot(family, id, |engine| {
                engine.unload().map(|unloaded| unloaded.to_string())
            }),
            Request::List { family } => self.one_shot(family, id, |engine| {
                Ok(serde_json::to_string(&engine.list_available()?)?)
            }),
            Request::Status { family } => self.one_shot(family, id, |engine| {
                Ok(serde_json::to_string(&engine.status()?)?)
            }),
        }
    }

    fn one_shot<F>(&self, family: Family, id: &str, job: F) -> BridgeResult<()>
    where
        F: FnOnce(&EngineManager) -> BridgeResult<String> + Send + 'static,
    {
        let engine = self.engine(family)?;
        let worker = OneShotWorker::new(
            id.to_string(),
            self.emitter.clone(),
            Box::new(move || job(engine.as_ref())),
        );
        // A spawn failure has already been reported as a rejection.
        let _ = worker.start(self.spawner.as_ref(), self.worker_name(family, id));
        Ok(())
    }

    fn engine(&self, family: Family) -> BridgeResult<Arc<EngineManager>> {
        self.engines.get(&family).cloned().ok_or_else(|| {
            BridgeError::NotReady(format!("the {} capability is not available", family))
        })
    }

    fn worker_name(&self, family: Family, id: &str) -> String {
        let suffix: String = id
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .take(12)
            .collect();
        format!("{}-{}-{}", self.worker_prefix, family, suffix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusyPolicy;
    use crate::engine::DirectoryCatalog;
    use crate::protocol::CallOut;
    use crate::testing::{
        FailingSpawner, InlineSpawner, RecordingSink, ScriptedEngine, ScriptedLoader,
    };
    use pretty_assertions::assert_eq;

    const NS: &str = "window.__hostbridge";

    struct Fixture {
        sink: Arc<RecordingSink>,
        dispatcher: Dispatcher,
        dir: tempfile::TempDir,
    }

    fn fixture_with(spawner: Arc<dyn Spawn>, engine: ScriptedEngine) -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let emitter = CallOutEmitter::new(NS, sink.clone());
        let manager = EngineManager::new(
            Family::Llm,
            Arc::new(DirectoryCatalog::new(dir.path(), "gguf")),
            Arc::new(ScriptedLoader::new(engine)),
            BusyPolicy::Queue,
        );
        let dispatcher = Dispatcher::new(
            [Arc::new(manager)],
            emitter,
            spawner,
            &BridgeConfig::default(),
        );
        Fixture {
            sink,
            dispatcher,
            dir,
        }
    }

    fn fixture(engine: ScriptedEngine) -> Fixture {
        fixture_with(Arc::new(InlineSpawner), engine)
    }

    fn reject(id: &str, message: &str) -> CallOut {
        CallOut::Reject {
            id: id.to_string(),
            message: message.to_string(),
        }
    }

    #[test]
    fn test_payload_without_id_is_dropped() {
        let f = fixture(ScriptedEngine::new());
        f.dispatcher.dispatch("llm.complete", r#"{"prompt":"hi"}"#);
        f.dispatcher.dispatch("llm.complete", "garbage");
        assert_eq!(f.sink.snippets(), Vec::<String>::new());
    }

    #[test]
    fn test_unknown_entry_point_is_rejected() {
        let f = fixture(ScriptedEngine::new());
        f.dispatcher.dispatch("llm.explode", r#"{"id":"1"}"#);
        assert_eq!(
            f.sink.call_outs(NS),
            vec![reject("1", "unknown entry point `llm.explode`")]
        );
    }

    #[test]
    fn test_unbound_family_is_not_ready() {
        let f = fixture(ScriptedEngine::new());
        f.dispatcher.dispatch("tts.list", r#"{"id":"2"}"#);
        assert_eq!(
            f.sink.call_outs(NS),
            vec![reject("2", "the tts capability is not available")]
        );
        assert_eq!(f.dispatcher.families(), vec![Family::Llm]);
        assert_eq!(f.dispatcher.bound_entry_points().len(), 7);
    }

    #[test]
    fn test_validation_error_on_stream_terminates_stream() {
        let f = fixture(ScriptedEngine::new());
        f.dispatcher
            .dispatch("llm.stream", r#"{"id":"3","prompt":"x","maxTokens":99999}"#);
        assert_eq!(
            f.sink.call_outs(NS),
            vec![CallOut::StreamError {
                id: "3".to_string(),
                message: "invalid request: `maxTokens` of 99999 exceeds the limit of 4096"
                    .to_string(),
            }]
        );
    }

    #[test]
    fn test_complete_with_auto_load() {
        let f = fixture(ScriptedEngine::new().completion("fine"));
        std::fs::write(f.dir.path().join("m.gguf"), b"").unwrap();

        f.dispatcher
            .dispatch("llm.complete", r#"["{\"id\":\"4\",\"prompt\":\"hi\"}"]"#);
        f.dispatcher.dispatch("llm.status", r#"{"id":"5"}"#);
        assert_eq!(
            f.sink.call_outs(NS),
            vec![
                CallOut::Resolve {
                    id: "4".to_string(),
                    value: "fine".to_string(),
                },
                CallOut::Resolve {
                    id: "5".to_string(),
                    value: r#"{"loaded":true,"resource":"m.gguf","autoLoadAttempted":true}"#
                        .to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_list_load_unload() {
        let f = fixture(ScriptedEngine::new());
        for name in ["b.gguf", "a.gguf", "skip.txt"] {
            std::fs::write(f.dir.path().join(name), b"").unwrap();
        }

        f.dispatcher.dispatch("llm.list", r#"{"id":"1"}"#);
        f.dispatcher.dispatch("llm.load", r#"{"id":"2","name":"b"}"#);
        f.dispatcher.dispatch("llm.unload", r#"{"id":"3"}"#);
        f.dispatcher.dispatch("llm.unload", r#"{"id":"4"}"#);

        let values: Vec<String> = f
            .sink
            .call_outs(NS)
            .into_iter()
            .map(|call_out| match call_out {
                CallOut::Resolve { value, .. } => value,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            values,
            vec![r#"["a.gguf","b.gguf"]"#, "b.gguf", "true", "false"]
        );
    }

    #[test]
    fn test_cancel_unknown_target_resolves_false() {
        let f = fixture(ScriptedEngine::new());
        f.dispatcher
            .dispatch("bridge.cancel", r#"{"id":"8","target":"nope"}"#);
        assert_eq!(
            f.sink.call_outs(NS),
            vec![CallOut::Resolve {
                id: "8".to_string(),
                value: "false".to_string(),
            }]
        );
    }

    #[test]
    fn test_spawn_failure_is_reported_once() {
        let f = fixture_with(Arc::new(FailingSpawner), ScriptedEngine::new());
        f.dispatcher.dispatch("llm.stream", r#"{"id":"6","prompt":"x"}"#);
        f.dispatcher.dispatch("llm.complete", r#"{"id":"7","prompt":"x"}"#);
        assert_eq!(
            f.sink.call_outs(NS),
            vec![
                CallOut::StreamError {
                    id: "6".to_string(),
                    message: "failed to start worker: thread limit reached".to_string(),
                },
                reject("7", "failed to start worker: thread limit reached"),
            ]
        );
        assert_eq!(f.dispatcher.in_flight_streams(), 0);
    }

    #[test]
    fn test_worker_name_is_sanitized() {
        let f = fixture(ScriptedEngine::new());
        assert_eq!(
            f.dispatcher.worker_name(Family::Llm, "a\0b-c/d"),
            "hostbridge-llm-abcd"
        );
    }
}
