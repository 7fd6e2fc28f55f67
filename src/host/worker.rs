use std::{
    io,
    ops::ControlFlow,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
};

use dashmap::DashMap;
use tracing::{debug, error};

use super::emitter::CallOutEmitter;
use crate::engine::EngineManager;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::CorrelationId;

/// Starts named background jobs.
pub trait Spawn: Send + Sync {
    fn spawn(&self, name: String, job: Box<dyn FnOnce() + Send + 'static>) -> io::Result<()>;
}

/// One OS thread per job.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSpawner;

impl Spawn for ThreadSpawner {
    fn spawn(&self, name: String, job: Box<dyn FnOnce() + Send + 'static>) -> io::Result<()> {
        thread::Builder::new().name(name).spawn(job).map(|_| ())
    }
}

/// Cancellation flags of in-flight streams, keyed by correlation id.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    flags: DashMap<CorrelationId, Arc<AtomicBool>>,
}

impl CancelRegistry {
    pub fn register(&self, id: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(false));
        self.flags.insert(id.to_string(), flag.clone());
        flag
    }

    /// Flags `id` for cancellation. Returns whether it was still running.
    pub fn cancel(&self, id: &str) -> bool {
        match self.flags.get(id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn release(&self, id: &str) {
        self.flags.remove(id);
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum WorkerState {
    Starting,
    Generating,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct StreamJob {
    pub id: CorrelationId,
    pub input: String,
    pub budget: u32,
}

/// Runs one streaming generation off the page thread.
///
/// Every token becomes a push; the run ends with exactly one end or one
/// error, never both. Cancellation is checked before the engine is
/// acquired, again once it is, and between tokens.
pub struct StreamingWorker {
    job: StreamJob,
    engine: Arc<EngineManager>,
    emitter: CallOutEmitter,
    registry: Arc<CancelRegistry>,
    cancel: Arc<AtomicBool>,
    state: WorkerState,
}

impl StreamingWorker {
    pub fn new(
        job: StreamJob,
        engine: Arc<EngineManager>,
        emitter: CallOutEmitter,
        registry: Arc<CancelRegistry>,
    ) -> Self {
        let cancel = registry.register(&job.id);
        Self {
            job,
            engine,
            emitter,
            registry,
            cancel,
            state: WorkerState::Starting,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    fn set_state(&mut self, next: WorkerState) {
        debug!(id = %self.job.id, from = %self.state, to = %next, "stream worker");
        self.state = next;
    }

    /// Moves the worker onto its own thread. If that fails the stream is
    /// terminated with the spawn error before this returns.
    pub fn start(self, spawner: &dyn Spawn, name: String) -> BridgeResult<()> {
        let id = self.job.id.clone();
        let emitter = self.emitter.clone();
        let registry = self.registry.clone();
        spawner
            .spawn(
                name,
                Box::new(move || {
                    self.run();
                }),
            )
            .map_err(|e| {
                let err = BridgeError::Spawn(e.to_string());
                error!(%id, error = %err, "could not start stream worker");
                registry.release(&id);
                emitter.stream_terminate(&id, Some(&err.to_string()));
                err
            })
    }

    pub fn run(mut self) -> WorkerState {
        self.set_state(WorkerState::Generating);
        let outcome = catch_unwind(AssertUnwindSafe(|| self.generate()))
            .unwrap_or_else(|_| Err(BridgeError::Panicked));
        self.registry.release(&self.job.id);

        match outcome {
            Ok(()) => {
                self.emitter.stream_terminate(&self.job.id, None);
                self.set_state(WorkerState::Completed);
            }
            Err(err) => {
                debug!(id = %self.job.id, error = %err, "stream failed");
                self.emitter
                    .stream_terminate(&self.job.id, Some(&err.to_string()));
                self.set_state(WorkerState::Failed);
            }
        }
        self.state
    }

    fn generate(&self) -> BridgeResult<()> {
        let cancelled = || self.cancel.load(Ordering::SeqCst);
        if cancelled() {
            return Err(BridgeError::Cancelled);
        }
        self.engine.stream(
            &self.job.input,
            self.job.budget,
            &cancelled,
            &mut |token| {
                if cancelled() {
                    return ControlFlow::Break(());
                }
                self.emitter.stream_push(&self.job.id, token);
                ControlFlow::Continue(())
            },
        )?;
        if cancelled() {
            return Err(BridgeError::Cancelled);
        }
        Ok(())
    }
}

type OneShotJob = Box<dyn FnOnce() -> BridgeResult<String> + Send + 'static>;

/// Runs a blocking engine operation off the page thread and settles its
/// promise with the outcome.
pub struct OneShotWorker {
    id: CorrelationId,
    emitter: CallOutEmitter,
    job: OneShotJob,
}

impl OneShotWorker {
    pub fn new(id: CorrelationId, emitter: CallOutEmitter, job: OneShotJob) -> Self {
        Self { id, emitter, job }
    }

    pub fn start(self, spawner: &dyn Spawn, name: String) -> BridgeResult<()> {
        let id = self.id.clone();
        let emitter = self.emitter.clone();
        spawner
            .spawn(
                name,
                Box::new(move || {
                    self.run();
                }),
            )
            .map_err(|e| {
                let err = BridgeError::Spawn(e.to_string());
                error!(%id, error = %err, "could not start worker");
                emitter.fail(&id, &err.to_string());
                err
            })
    }

    pub fn run(self) -> WorkerState {
        let OneShotWorker { id, emitter, job } = self;
        let outcome =
            catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|_| Err(BridgeError::Panicked));
        match outcome {
            Ok(value) => {
                emitter.settle(&id, &value);
                WorkerState::Completed
            }
            Err(err) => {
                debug!(%id, error = %err, "call failed");
                emitter.fail(&id, &err.to_string());
                WorkerState::Failed
            }
        }
    }
}
