//! Deterministic doubles for exercising the bridge without native engines
//! or a real page.

use std::{
    io,
    ops::ControlFlow,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Condvar, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use crate::channel::ScriptSink;
use crate::engine::{Engine, EngineError, EngineLoader, EngineResult, LoadError, TokenCallback};
use crate::host::Spawn;
use crate::protocol::CallOut;

/// Engine that plays back a fixed token list, optionally failing at the end.
#[derive(Debug, Clone, Default)]
pub struct ScriptedEngine {
    tokens: Vec<String>,
    completion: Option<String>,
    failure: Option<EngineError>,
    token_delay: Duration,
    probe: ReentrancyProbe,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tokens(mut self, tokens: &[&str]) -> Self {
        self.tokens = tokens.iter().map(|t| t.to_string()).collect();
        self
    }

    /// Fixed one-shot answer. Defaults to the concatenated tokens.
    pub fn completion(mut self, text: &str) -> Self {
        self.completion = Some(text.to_string());
        self
    }

    /// Fails after the budgeted tokens were produced.
    pub fn fail_with(mut self, error: EngineError) -> Self {
        self.failure = Some(error);
        self
    }

    pub fn token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn probe(mut self, probe: ReentrancyProbe) -> Self {
        self.probe = probe;
        self
    }

    fn pause(&self) {
        if !self.token_delay.is_zero() {
            thread::sleep(self.token_delay);
        }
    }
}

impl Engine for ScriptedEngine {
    fn complete_once(&mut self, _input: &str, budget: u32) -> EngineResult<String> {
        let _inside = self.probe.enter();
        self.pause();
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        Ok(self.completion.clone().unwrap_or_else(|| {
            self.tokens
                .iter()
                .take(budget as usize)
                .map(String::as_str)
                .collect()
        }))
    }

    fn stream_generate(
        &mut self,
        _input: &str,
        budget: u32,
        on_token: &mut TokenCallback<'_>,
    ) -> EngineResult<()> {
        let _inside = self.probe.enter();
        for token in self.tokens.iter().take(budget as usize) {
            self.pause();
            if on_token(token).is_break() {
                return Ok(());
            }
        }
        match &self.failure {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

/// Hands out clones of one [`ScriptedEngine`] and records requested paths.
#[derive(Debug, Default)]
pub struct ScriptedLoader {
    engine: ScriptedEngine,
    loaded: Mutex<Vec<PathBuf>>,
}

impl ScriptedLoader {
    pub fn new(engine: ScriptedEngine) -> Self {
        Self {
            engine,
            loaded: Mutex::new(Vec::new()),
        }
    }

    pub fn loaded_paths(&self) -> Vec<PathBuf> {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EngineLoader for ScriptedLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn Engine>, LoadError> {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(path.to_path_buf());
        Ok(Box::new(self.engine.clone()))
    }
}

/// Counts overlapping entries into an engine.
#[derive(Debug, Clone, Default)]
pub struct ReentrancyProbe {
    active: Arc<AtomicBool>,
    entries: Arc<AtomicUsize>,
    overlaps: Arc<AtomicUsize>,
}

impl ReentrancyProbe {
    pub fn enter(&self) -> ProbeGuard {
        self.entries.fetch_add(1, Ordering::SeqCst);
        if self.active.swap(true, Ordering::SeqCst) {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        ProbeGuard {
            active: self.active.clone(),
        }
    }

    pub fn entries(&self) -> usize {
        self.entries.load(Ordering::SeqCst)
    }

    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }
}

pub struct ProbeGuard {
    active: Arc<AtomicBool>,
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Script sink that keeps every submitted snippet.
#[derive(Debug, Default)]
pub struct RecordingSink {
    snippets: Mutex<Vec<String>>,
    changed: Condvar,
}

impl RecordingSink {
    pub fn snippets(&self) -> Vec<String> {
        self.snippets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Parses every recorded snippet; unparsable ones are skipped.
    pub fn call_outs(&self, namespace: &str) -> Vec<CallOut> {
        self.snippets()
            .iter()
            .filter_map(|snippet| CallOut::parse(namespace, snippet).ok())
            .collect()
    }

    /// Blocks until `done` holds for the recorded snippets or `timeout`
    /// passes. Returns whether it held.
    pub fn wait_until(&self, timeout: Duration, done: impl Fn(&[String]) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut snippets = self.snippets.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if done(&snippets) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            snippets = self
                .changed
                .wait_timeout(snippets, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

impl ScriptSink for RecordingSink {
    fn submit(&self, snippet: String) {
        self.snippets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(snippet);
        self.changed.notify_all();
    }
}

/// Spawner whose every spawn fails, as when the OS is out of threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingSpawner;

impl Spawn for FailingSpawner {
    fn spawn(&self, _name: String, _job: Box<dyn FnOnce() + Send + 'static>) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Other, "thread limit reached"))
    }
}

/// Spawner that runs jobs on the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineSpawner;

impl Spawn for InlineSpawner {
    fn spawn(&self, _name: String, job: Box<dyn FnOnce() + Send + 'static>) -> io::Result<()> {
        job();
        Ok(())
    }
}
