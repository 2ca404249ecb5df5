//! Maps stage kind names to constructors.
//!
//! The registry is an ordinary value built when a pipeline is assembled.
//! Nothing registers itself globally; callers decide which kinds exist.

use std::collections::HashMap;
use std::sync::Arc;

use recon_core::config::{ConfigError, StageSpec};

use crate::stage::Stage;
use crate::stages;

type Constructor = Arc<dyn Fn(&StageSpec) -> Result<Box<dyn Stage>, ConfigError> + Send + Sync>;

#[derive(Clone, Default)]
pub struct StageRegistry {
    constructors: HashMap<String, Constructor>,
}

impl StageRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every built-in stage kind.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register::<stages::RemoveOversampling>(stages::REMOVE_RO_OVERSAMPLING);
        registry.register::<stages::AccumulateImage>(stages::ACCUMULATE_IMAGE);
        registry.register::<stages::ImageFft>(stages::IMAGE_FFT);
        registry.register::<stages::CoilCombine>(stages::COIL_COMBINE);
        registry.register::<stages::Extract>(stages::EXTRACT);
        registry.register::<stages::AutoScale>(stages::AUTOSCALE);
        registry
    }

    /// Register `S` under `kind`, built through `S::configure`.
    pub fn register<S: Stage + 'static>(&mut self, kind: &str) {
        self.register_with(kind, |spec| {
            let stage = S::configure(spec)?;
            Ok(Box::new(stage) as Box<dyn Stage>)
        });
    }

    /// Register an arbitrary constructor under `kind`. Replaces any existing
    /// entry of the same name.
    pub fn register_with<F>(&mut self, kind: &str, constructor: F)
    where
        F: Fn(&StageSpec) -> Result<Box<dyn Stage>, ConfigError> + Send + Sync + 'static,
    {
        self.constructors
            .insert(kind.to_string(), Arc::new(constructor));
    }

    /// Build the stage described by `spec`.
    pub fn create(&self, spec: &StageSpec) -> Result<Box<dyn Stage>, ConfigError> {
        let constructor = self
            .constructors
            .get(&spec.kind)
            .ok_or_else(|| ConfigError::UnknownStage(spec.kind.clone()))?;
        constructor(spec)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}
