//! Wiring: families, loaders and a script engine in, a running host out.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::channel::ScriptEngine;
use crate::config::BridgeConfig;
use crate::engine::{DirectoryCatalog, EngineLoader, EngineManager, ResourceCatalog};
use crate::error::InternalResult;
use crate::host::{CallOutEmitter, Dispatcher, Host, HostHandle, Spawn, ThreadSpawner};
use crate::protocol::{EntryPoint, Family};
use crate::script::{HeadlessScript, Multiplexer};

struct Capability {
    family: Family,
    catalog: Arc<dyn ResourceCatalog>,
    loader: Arc<dyn EngineLoader>,
}

/// Builds a [`Host`]. Only families registered here get entry points; a
/// page asking for any other family sees it as unavailable.
pub struct BridgeBuilder {
    config: BridgeConfig,
    capabilities: Vec<Capability>,
    spawner: Arc<dyn Spawn>,
}

impl BridgeBuilder {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            capabilities: Vec::new(),
            spawner: Arc::new(ThreadSpawner),
        }
    }

    /// Registers `family` with the configured directory convention.
    pub fn capability(self, family: Family, loader: Arc<dyn EngineLoader>) -> Self {
        let settings = self.config.family(family);
        let catalog = DirectoryCatalog::new(
            self.config.resource_dir(family),
            settings.extension.clone(),
        );
        self.capability_with_catalog(family, Arc::new(catalog), loader)
    }

    /// Registers `family` with a custom catalog, replacing any earlier
    /// registration of the same family.
    pub fn capability_with_catalog(
        mut self,
        family: Family,
        catalog: Arc<dyn ResourceCatalog>,
        loader: Arc<dyn EngineLoader>,
    ) -> Self {
        self.capabilities.retain(|capability| capability.family != family);
        self.capabilities.push(Capability {
            family,
            catalog,
            loader,
        });
        self
    }

    pub fn spawner(mut self, spawner: Arc<dyn Spawn>) -> Self {
        self.spawner = spawner;
        self
    }

    /// Builds the host loop and its handle. `make_script` receives the
    /// handle the page should invoke entry points through.
    pub fn build<S, F>(self, make_script: F) -> InternalResult<(Host<S>, HostHandle)>
    where
        S: ScriptEngine,
        F: FnOnce(&HostHandle) -> S,
    {
        self.config.validate()?;

        let families: Vec<Family> = self.capabilities.iter().map(|c| c.family).collect();
        let entries = EntryPoint::bound_for(families.iter().copied())
            .into_iter()
            .map(|entry| entry.to_string());
        let (handle, receiver) = HostHandle::channel(entries);

        let engines = self.capabilities.into_iter().map(|capability| {
            Arc::new(EngineManager::new(
                capability.family,
                capability.catalog,
                capability.loader,
                self.config.busy_policy,
            ))
        });
        let emitter = CallOutEmitter::new(self.config.namespace.clone(), Arc::new(handle.clone()));
        let dispatcher = Dispatcher::new(engines, emitter, self.spawner, &self.config);
        let script = make_script(&handle);

        info!(?families, namespace = %self.config.namespace, "bridge built");
        Ok((Host::new(receiver, dispatcher, script), handle))
    }

    /// Builds a host driven by [`HeadlessScript`] and runs it on the current
    /// tokio runtime.
    pub fn build_headless(self) -> InternalResult<HeadlessBridge> {
        let namespace = self.config.namespace.clone();
        let timeout = self.config.request_timeout;
        let (host, handle) = self.build(|handle| {
            let multiplexer = Multiplexer::new(Arc::new(handle.clone()), timeout);
            HeadlessScript::new(namespace, multiplexer)
        })?;
        let multiplexer = host.script().multiplexer().clone();
        let task = tokio::spawn(host.run());
        Ok(HeadlessBridge {
            multiplexer,
            handle,
            task,
        })
    }
}

/// A running bridge without a real page, for tools and tests.
pub struct HeadlessBridge {
    multiplexer: Multiplexer,
    handle: HostHandle,
    task: JoinHandle<()>,
}

impl HeadlessBridge {
    pub fn multiplexer(&self) -> &Multiplexer {
        &self.multiplexer
    }

    pub fn handle(&self) -> &HostHandle {
        &self.handle
    }

    /// Stops the host loop and fails whatever is still outstanding.
    pub async fn shutdown(self) {
        self.handle.shutdown();
        if let Err(e) = self.task.await {
            error!(error = %e, "host loop ended abnormally");
        }
        self.multiplexer.cancel_waiting("bridge shut down");
    }
}
