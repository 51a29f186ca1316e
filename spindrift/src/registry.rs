//! The process-wide engine registry.
//!
//! A registry with an explicit lifecycle: `initialize` installs the
//! process default, `exit` tears everything down. A provider can be
//! injected to build the default lazily; named engines live alongside
//! the default.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use spindrift_core::error::{Error, ErrorKind, Result};
use spindrift_mux::config::EngineConfig;

use crate::engine::Engine;

/// Builds the default engine on first use.
pub type EngineProvider = Box<dyn Fn() -> Result<Arc<Engine>> + Send + Sync>;

struct Registry {
    default: Mutex<Option<Arc<Engine>>>,
    provider: Mutex<Option<EngineProvider>>,
    named: DashMap<String, Arc<Engine>>,
}

static REGISTRY: Lazy<Registry> = Lazy::new(|| Registry {
    default: Mutex::new(None),
    provider: Mutex::new(None),
    named: DashMap::new(),
});

/// Install the process default engine, started from `config`. Fails
/// with `ALREADY` if a default is installed.
pub fn initialize(config: EngineConfig) -> Result<Arc<Engine>> {
    let mut default = REGISTRY.default.lock();
    if default.is_some() {
        return Err(Error::new(ErrorKind::Already));
    }
    let engine = Engine::new(config)?;
    *default = Some(Arc::clone(&engine));
    Ok(engine)
}

/// Inject the provider used when the default engine is first needed.
pub fn set_default_provider(provider: EngineProvider) {
    *REGISTRY.provider.lock() = Some(provider);
}

/// The process default engine. Builds one — through the injected
/// provider, or from the default configuration — when none is
/// installed yet.
pub fn default_engine() -> Result<Arc<Engine>> {
    let mut default = REGISTRY.default.lock();
    if let Some(engine) = default.as_ref() {
        return Ok(Arc::clone(engine));
    }
    let engine = match REGISTRY.provider.lock().as_ref() {
        Some(provider) => provider()?,
        None => Engine::new(EngineConfig::default())?,
    };
    *default = Some(Arc::clone(&engine));
    Ok(engine)
}

/// Register an engine under `name`, replacing any previous holder.
pub fn register(name: impl Into<String>, engine: Arc<Engine>) {
    REGISTRY.named.insert(name.into(), engine);
}

/// The engine registered under `name`.
pub fn lookup(name: &str) -> Option<Arc<Engine>> {
    REGISTRY.named.get(name).map(|entry| Arc::clone(&entry))
}

/// Remove the engine registered under `name`.
pub fn deregister(name: &str) -> Option<Arc<Engine>> {
    REGISTRY.named.remove(name).map(|(_, engine)| engine)
}

/// Tear down the registry: shut down the default and every named
/// engine. The provider stays injected.
pub fn exit() {
    if let Some(engine) = REGISTRY.default.lock().take() {
        engine.shutdown();
    }
    let names: Vec<String> = REGISTRY
        .named
        .iter()
        .map(|entry| entry.key().clone())
        .collect();
    for name in names {
        if let Some((_, engine)) = REGISTRY.named.remove(&name) {
            engine.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The registry is process-global; exercise it in one test to keep
    // the interleavings deterministic.
    #[test]
    fn lifecycle() {
        let engine = initialize(EngineConfig::new().with_worker_count(1)).unwrap();
        assert_eq!(
            initialize(EngineConfig::new()).unwrap_err().kind(),
            ErrorKind::Already
        );
        assert!(Arc::ptr_eq(&engine, &default_engine().unwrap()));

        register("aux", Arc::clone(&engine));
        assert!(lookup("aux").is_some());
        assert!(lookup("missing").is_none());
        assert!(deregister("aux").is_some());
        assert!(deregister("aux").is_none());

        exit();
        assert_eq!(engine.worker_count(), 0);

        // After exit, a fresh default can be installed again.
        let fresh = initialize(EngineConfig::new().with_worker_count(1)).unwrap();
        fresh.shutdown();
        exit();
    }
}
