use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use tracing::{debug, info, instrument, warn};

use super::{Engine, EngineLoader, EngineStatus, ResourceCatalog, TokenCallback};
use crate::config::BusyPolicy;
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::Family;

struct LoadedEngine {
    resource: String,
    engine: Box<dyn Engine>,
}

#[derive(Default)]
struct EngineSlot {
    loaded: Option<LoadedEngine>,
    auto_load_attempted: bool,
}

/// Owns at most one engine for a family and serializes every use of it.
///
/// The lock guarding the slot is held for the whole duration of a
/// generation, so two calls against the same family never overlap inside
/// the engine. Under [`BusyPolicy::Queue`] later callers wait their turn;
/// under [`BusyPolicy::Reject`] they fail with [`BridgeError::Busy`].
pub struct EngineManager {
    family: Family,
    catalog: Arc<dyn ResourceCatalog>,
    loader: Arc<dyn EngineLoader>,
    policy: BusyPolicy,
    slot: Mutex<EngineSlot>,
}

impl EngineManager {
    pub fn new(
        family: Family,
        catalog: Arc<dyn ResourceCatalog>,
        loader: Arc<dyn EngineLoader>,
        policy: BusyPolicy,
    ) -> Self {
        Self {
            family,
            catalog,
            loader,
            policy,
            slot: Mutex::new(EngineSlot::default()),
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    fn acquire(&self) -> BridgeResult<MutexGuard<'_, EngineSlot>> {
        // A panic inside an engine poisons the lock; the slot itself is
        // still consistent, so keep serving.
        match self.policy {
            BusyPolicy::Queue => Ok(self.slot.lock().unwrap_or_else(PoisonError::into_inner)),
            BusyPolicy::Reject => match self.slot.try_lock() {
                Ok(guard) => Ok(guard),
                Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => Err(BridgeError::Busy(self.family)),
            },
        }
    }

    /// Loads the first discovered resource if nothing is loaded yet.
    ///
    /// Discovery runs at most once per manager; after a failed or empty
    /// attempt only [`load_explicit`](Self::load_explicit) can bring an
    /// engine up.
    #[instrument(level = "debug", skip(self), fields(family = %self.family))]
    pub fn ensure_loaded(&self) -> BridgeResult<bool> {
        let mut slot = self.acquire()?;
        Ok(self.ensure_loaded_in(&mut slot))
    }

    fn ensure_loaded_in(&self, slot: &mut EngineSlot) -> bool {
        if slot.loaded.is_some() {
            return true;
        }
        if slot.auto_load_attempted {
            return false;
        }
        slot.auto_load_attempted = true;

        let first = match self.catalog.scan() {
            Ok(names) => names.into_iter().next(),
            Err(e) => {
                warn!(family = %self.family, error = %e, "resource scan failed");
                None
            }
        };
        let Some(name) = first else {
            info!(
                family = %self.family,
                convention = %self.catalog.convention(),
                "no resource found for auto-load"
            );
            return false;
        };

        match self
            .catalog
            .resolve(&name)
            .and_then(|path| self.loader.load(&path))
        {
            Ok(engine) => {
                info!(family = %self.family, resource = %name, "auto-loaded engine");
                slot.loaded = Some(LoadedEngine {
                    resource: name,
                    engine,
                });
                true
            }
            Err(e) => {
                warn!(family = %self.family, resource = %name, error = %e, "auto-load failed");
                false
            }
        }
    }

    /// Replaces the current engine with the named resource and returns the
    /// resolved resource name. On failure the family is left unloaded.
    #[instrument(level = "debug", skip(self), fields(family = %self.family))]
    pub fn load_explicit(&self, name_or_path: &str) -> BridgeResult<String> {
        let mut slot = self.acquire()?;
        if let Some(previous) = slot.loaded.take() {
            debug!(resource = %previous.resource, "releasing engine before reload");
        }

        let path = self.catalog.resolve(name_or_path)?;
        let engine = self.loader.load(&path)?;
        let resource = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| path.display().to_string());

        info!(family = %self.family, resource = %resource, "loaded engine");
        slot.loaded = Some(LoadedEngine {
            resource: resource.clone(),
            engine,
        });
        Ok(resource)
    }

    /// Drops the engine. Returns whether one was loaded.
    pub fn unload(&self) -> BridgeResult<bool> {
        let mut slot = self.acquire()?;
        match slot.loaded.take() {
            Some(previous) => {
                info!(family = %self.family, resource = %previous.resource, "unloaded engine");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn list_available(&self) -> BridgeResult<Vec<String>> {
        Ok(self.catalog.scan()?)
    }

    pub fn status(&self) -> BridgeResult<EngineStatus> {
        let slot = self.acquire()?;
        Ok(EngineStatus {
            loaded: slot.loaded.is_some(),
            resource: slot.loaded.as_ref().map(|loaded| loaded.resource.clone()),
            auto_load_attempted: slot.auto_load_attempted,
        })
    }

    pub fn complete(&self, input: &str, budget: u32) -> BridgeResult<String> {
        let mut slot = self.acquire()?;
        let engine = self.engine_in(&mut slot)?;
        Ok(engine.complete_once(input, budget)?)
    }

    /// Runs a streaming generation, holding the engine until it returns.
    ///
    /// `cancelled` is consulted once the engine is ours, so a stream that
    /// was cancelled while queued never reaches the engine or auto-load.
    pub fn stream(
        &self,
        input: &str,
        budget: u32,
        cancelled: &dyn Fn() -> bool,
        on_token: &mut TokenCallback<'_>,
    ) -> BridgeResult<()> {
        let mut slot = self.acquire()?;
        if cancelled() {
            debug!(family = %self.family, "stream cancelled while queued");
            return Err(BridgeError::Cancelled);
        }
        let engine = self.engine_in(&mut slot)?;
        Ok(engine.stream_generate(input, budget, on_token)?)
    }

    fn engine_in<'a>(&self, slot: &'a mut EngineSlot) -> BridgeResult<&'a mut Box<dyn Engine>> {
        if !self.ensure_loaded_in(slot) {
            return Err(self.not_ready());
        }
        slot.loaded
            .as_mut()
            .map(|loaded| &mut loaded.engine)
            .ok_or_else(|| self.not_ready())
    }

    fn not_ready(&self) -> BridgeError {
        BridgeError::NotReady(format!(
            "no {} engine is loaded; add {} or call {}.load",
            self.family,
            self.catalog.convention(),
            self.family
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::catalog::MockResourceCatalog;
    use crate::engine::{EngineError, LoadError, MockEngineLoader};
    use crate::testing::ScriptedEngine;
    use std::ops::ControlFlow;
    use std::path::{Path, PathBuf};

    fn manager(catalog: MockResourceCatalog, loader: MockEngineLoader) -> EngineManager {
        EngineManager::new(
            Family::Llm,
            Arc::new(catalog),
            Arc::new(loader),
            BusyPolicy::Queue,
        )
    }

    fn resolving_catalog(names: Vec<&'static str>) -> MockResourceCatalog {
        let mut catalog = MockResourceCatalog::new();
        catalog
            .expect_scan()
            .returning(move || Ok(names.iter().map(|n| n.to_string()).collect()));
        catalog
            .expect_resolve()
            .returning(|name| Ok(PathBuf::from("/models").join(name)));
        catalog
            .expect_convention()
            .returning(|| "a *.gguf file in /models".to_string());
        catalog
    }

    #[test]
    fn test_auto_load_picks_first_sorted_resource() {
        let mut loader = MockEngineLoader::new();
        loader
            .expect_load()
            .withf(|path| path == Path::new("/models/a.gguf"))
            .times(1)
            .returning(|_| Ok(Box::new(ScriptedEngine::new().completion("ok"))));
        let manager = manager(resolving_catalog(vec!["a.gguf", "b.gguf"]), loader);

        assert!(manager.ensure_loaded().unwrap());
        assert!(manager.ensure_loaded().unwrap());
        assert_eq!(
            manager.status().unwrap(),
            EngineStatus {
                loaded: true,
                resource: Some("a.gguf".to_string()),
                auto_load_attempted: true,
            }
        );
        assert_eq!(manager.complete("hi", 4).unwrap(), "ok");
    }

    #[test]
    fn test_auto_load_is_attempted_once() {
        let mut catalog = MockResourceCatalog::new();
        catalog.expect_scan().times(1).returning(|| Ok(vec![]));
        catalog
            .expect_convention()
            .returning(|| "a *.gguf file in models".to_string());
        let manager = manager(catalog, MockEngineLoader::new());

        let first = manager.complete("hi", 4).unwrap_err();
        let second = manager.complete("hi", 4).unwrap_err();
        assert!(matches!(first, BridgeError::NotReady(_)));
        assert!(matches!(second, BridgeError::NotReady(_)));
        assert!(first.to_string().contains("*.gguf"));
        assert!(first.to_string().contains("llm.load"));
        assert!(!manager.ensure_loaded().unwrap());
    }

    #[test]
    fn test_stream_cancelled_while_queued_skips_engine() {
        // No expectations: any scan or load would panic.
        let manager = manager(MockResourceCatalog::new(), MockEngineLoader::new());

        let mut seen = 0;
        let result = manager.stream("x", 4, &|| true, &mut |_| {
            seen += 1;
            ControlFlow::Continue(())
        });
        assert!(matches!(result, Err(BridgeError::Cancelled)));
        assert_eq!(seen, 0);
        assert!(!manager.status().unwrap().auto_load_attempted);
    }

    #[test]
    fn test_failed_auto_load_is_not_retried() {
        let mut loader = MockEngineLoader::new();
        loader.expect_load().times(1).returning(|path| {
            Err(LoadError::Rejected {
                path: path.to_path_buf(),
                reason: "corrupt".to_string(),
            })
        });
        let manager = manager(resolving_catalog(vec!["bad.gguf"]), loader);

        assert!(!manager.ensure_loaded().unwrap());
        assert!(matches!(
            manager.complete("hi", 1),
            Err(BridgeError::NotReady(_))
        ));
        assert!(manager.status().unwrap().auto_load_attempted);
    }

    #[test]
    fn test_explicit_load_failure_leaves_family_unloaded() {
        let mut loader = MockEngineLoader::new();
        let mut seq = mockall::Sequence::new();
        loader
            .expect_load()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Box::new(ScriptedEngine::new())));
        loader
            .expect_load()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|path| Err(LoadError::NotFound(path.to_path_buf())));
        let manager = manager(resolving_catalog(vec![]), loader);

        assert_eq!(manager.load_explicit("first").unwrap(), "first");
        assert!(matches!(
            manager.load_explicit("missing"),
            Err(BridgeError::Load(LoadError::NotFound(_)))
        ));
        let status = manager.status().unwrap();
        assert!(!status.loaded);
        assert_eq!(status.resource, None);
    }

    #[test]
    fn test_unload_reports_previous_state() {
        let mut loader = MockEngineLoader::new();
        loader
            .expect_load()
            .returning(|_| Ok(Box::new(ScriptedEngine::new())));
        let manager = manager(resolving_catalog(vec![]), loader);

        assert!(!manager.unload().unwrap());
        manager.load_explicit("tiny").unwrap();
        assert!(manager.unload().unwrap());
        assert!(!manager.status().unwrap().loaded);
    }

    #[test]
    fn test_stream_passes_tokens_and_errors_through() {
        let mut loader = MockEngineLoader::new();
        loader.expect_load().returning(|_| {
            Ok(Box::new(
                ScriptedEngine::new()
                    .tokens(&["a", "b", "c"])
                    .fail_with(EngineError::DecodeFailed),
            ))
        });
        let manager = manager(resolving_catalog(vec!["m.gguf"]), loader);

        let mut seen = Vec::new();
        let result = manager.stream("x", 2, &|| false, &mut |token| {
            seen.push(token.to_string());
            ControlFlow::Continue(())
        });
        assert_eq!(seen, vec!["a", "b"]);
        assert!(matches!(
            result,
            Err(BridgeError::Engine(EngineError::DecodeFailed))
        ));
    }

    #[test]
    fn test_reject_policy_reports_busy() {
        let manager = EngineManager::new(
            Family::Tts,
            Arc::new(resolving_catalog(vec![])),
            Arc::new(MockEngineLoader::new()),
            BusyPolicy::Reject,
        );
        let _held = manager.slot.lock().unwrap();
        assert!(matches!(
            manager.unload(),
            Err(BridgeError::Busy(Family::Tts))
        ));
    }
}
