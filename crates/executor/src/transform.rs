//! User-code seams: transforms, bounded sources, and their registries.
//!
//! Task descriptors reference user code by factory name so they stay
//! serializable; executors resolve names against these registries at launch
//! time.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use cascade_common::{CascadeError, Result};

use crate::coder::Record;

/// Collects the records a transform emits during `on_data`/`close`.
#[derive(Debug, Default)]
pub struct OutputCollector {
    buffer: Vec<Record>,
}

impl OutputCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Emits one record.
    pub fn emit(&mut self, record: Record) {
        self.buffer.push(record);
    }

    /// Emits a batch of records.
    pub fn emit_all(&mut self, records: impl IntoIterator<Item = Record>) {
        self.buffer.extend(records);
    }

    /// Takes everything collected since the last call.
    pub fn collect_output(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.buffer)
    }
}

/// Context handed to a transform at prepare time.
///
/// Side inputs are fully materialized broadcast-style inputs, keyed by the
/// id of the vertex that produced them.
#[derive(Debug, Default)]
pub struct TransformContext {
    side_inputs: HashMap<String, Vec<Record>>,
}

impl TransformContext {
    /// Creates a context over materialized side inputs.
    pub fn new(side_inputs: HashMap<String, Vec<Record>>) -> Self {
        Self { side_inputs }
    }

    /// The side input produced by `src_vertex_id`, if the task has one.
    pub fn side_input(&self, src_vertex_id: &str) -> Option<&[Record]> {
        self.side_inputs.get(src_vertex_id).map(Vec::as_slice)
    }
}

/// A user transform wrapped by an operator task.
pub trait Transform: Send {
    /// Called once before any data, with side inputs available.
    fn prepare(&mut self, context: &TransformContext, collector: &mut OutputCollector);

    /// Called once per consumed input partition with the producing vertex id.
    fn on_data(&mut self, data: Vec<Record>, src_vertex_id: &str, collector: &mut OutputCollector);

    /// Called once after all input partitions were consumed.
    fn close(&mut self, collector: &mut OutputCollector);
}

/// A finite external input read by a bounded-source task.
pub trait BoundedSource: Send {
    /// Reads the whole finite iterable.
    fn read(&mut self) -> Result<Vec<Record>>;
}

type TransformFactory = Arc<dyn Fn() -> Box<dyn Transform> + Send + Sync>;
type SourceFactory = Arc<dyn Fn() -> Box<dyn BoundedSource> + Send + Sync>;

/// Name-keyed registry of transform factories.
#[derive(Default)]
pub struct TransformRegistry {
    factories: RwLock<HashMap<String, TransformFactory>>,
}

impl TransformRegistry {
    /// Creates an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a transform factory under `name`; the first wins.
    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Transform> + Send + Sync + 'static,
    {
        let mut factories = self.factories.write().expect("transform registry poisoned");
        factories
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(factory));
    }

    /// Instantiates the transform registered under `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn Transform>> {
        let factories = self.factories.read().expect("transform registry poisoned");
        let factory = factories
            .get(name)
            .ok_or_else(|| CascadeError::Unknown(format!("no transform registered as '{name}'")))?;
        Ok(factory())
    }
}

/// Name-keyed registry of bounded-source factories.
#[derive(Default)]
pub struct SourceRegistry {
    factories: RwLock<HashMap<String, SourceFactory>>,
}

impl SourceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a source factory under `name`; the first wins.
    pub fn register<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn BoundedSource> + Send + Sync + 'static,
    {
        let mut factories = self.factories.write().expect("source registry poisoned");
        factories
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(factory));
    }

    /// Instantiates the source registered under `name`.
    pub fn create(&self, name: &str) -> Result<Box<dyn BoundedSource>> {
        let factories = self.factories.read().expect("source registry poisoned");
        let factory = factories
            .get(name)
            .ok_or_else(|| CascadeError::Unknown(format!("no source registered as '{name}'")))?;
        Ok(factory())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PassThrough;

    impl Transform for PassThrough {
        fn prepare(&mut self, _context: &TransformContext, _collector: &mut OutputCollector) {}

        fn on_data(
            &mut self,
            data: Vec<Record>,
            _src_vertex_id: &str,
            collector: &mut OutputCollector,
        ) {
            collector.emit_all(data);
        }

        fn close(&mut self, _collector: &mut OutputCollector) {}
    }

    #[test]
    fn registry_resolves_and_runs_a_transform() {
        let registry = TransformRegistry::new();
        registry.register("pass-through", || Box::new(PassThrough));
        let mut transform = registry.create("pass-through").expect("create");
        let mut collector = OutputCollector::new();
        transform.prepare(&TransformContext::default(), &mut collector);
        transform.on_data(vec![Record::new(1, b"x".to_vec())], "v-src", &mut collector);
        assert_eq!(collector.collect_output().len(), 1);
        assert!(registry.create("missing").is_err());
    }
}
