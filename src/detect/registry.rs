use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::{anyhow, Result};

use super::backend::DetectorBackend;

pub type SharedBackend = Arc<Mutex<dyn DetectorBackend>>;

#[derive(Default)]
struct Models {
    backends: BTreeMap<String, SharedBackend>,
    active: Option<String>,
}

/// Thread-safe registry of named detector models with one active selection.
///
/// Backends are wrapped in `Mutex` because `DetectorBackend::detect` takes
/// `&mut self`. The registry itself is shared between the processing worker
/// and the remote-control surface, so model changes take `&self`.
#[derive(Default)]
pub struct DetectorRegistry {
    models: RwLock<Models>,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model under `name`. The first registered model becomes active.
    pub fn register<B: DetectorBackend + 'static>(&self, name: impl Into<String>, backend: B) {
        let name = name.into();
        let mut models = self.write();
        if models.active.is_none() {
            models.active = Some(name.clone());
        }
        log::info!("detector registry: registered model '{}'", name);
        models.backends.insert(name, Arc::new(Mutex::new(backend)));
    }

    /// Switch the active model by name.
    pub fn set_active(&self, name: &str) -> Result<()> {
        let mut models = self.write();
        if !models.backends.contains_key(name) {
            return Err(anyhow!("model '{}' not registered", name));
        }
        models.active = Some(name.to_string());
        log::info!("detector registry: active model is now '{}'", name);
        Ok(())
    }

    /// Active model name and backend.
    pub fn active(&self) -> Option<(String, SharedBackend)> {
        let models = self.read();
        let name = models.active.as_ref()?;
        let backend = models.backends.get(name)?.clone();
        Some((name.clone(), backend))
    }

    pub fn active_name(&self) -> Option<String> {
        self.read().active.clone()
    }

    pub fn get(&self, name: &str) -> Option<SharedBackend> {
        self.read().backends.get(name).cloned()
    }

    /// Registered model names, sorted.
    pub fn list(&self) -> Vec<String> {
        self.read().backends.keys().cloned().collect()
    }

    pub fn is_loaded(&self) -> bool {
        self.read().active.is_some()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Models> {
        self.models.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Models> {
        self.models.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubBackend;

    #[test]
    fn first_registered_model_is_active() {
        let registry = DetectorRegistry::new();
        assert!(!registry.is_loaded());
        registry.register("yolo-small", StubBackend::new());
        registry.register("yolo-large", StubBackend::new());
        assert_eq!(registry.active_name().as_deref(), Some("yolo-small"));
        assert_eq!(registry.list(), vec!["yolo-large", "yolo-small"]);
    }

    #[test]
    fn set_active_rejects_unknown_models() {
        let registry = DetectorRegistry::new();
        registry.register("a", StubBackend::new());
        registry.register("b", StubBackend::new());
        registry.set_active("b").unwrap();
        assert_eq!(registry.active().map(|(name, _)| name).as_deref(), Some("b"));
        assert!(registry.set_active("missing").is_err());
        assert_eq!(registry.active_name().as_deref(), Some("b"));
    }
}
