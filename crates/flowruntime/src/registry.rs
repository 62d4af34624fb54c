use flowcore::{Continuation, GraphError, Mapper, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Factory for continuations named in graph files
pub trait ContinuationFactory: Send + Sync {
    /// Build a continuation capturing `params`
    fn create(&self, params: &Value) -> Result<Arc<dyn Continuation>, GraphError>;

    /// Name used in graph files
    fn name(&self) -> &str;

    fn metadata(&self) -> FactoryMetadata {
        FactoryMetadata::default()
    }
}

/// Factory for per-element map bodies named in graph files
pub trait MapperFactory: Send + Sync {
    fn create(&self, params: &Value) -> Result<Arc<dyn Mapper>, GraphError>;

    fn name(&self) -> &str;

    fn metadata(&self) -> FactoryMetadata {
        FactoryMetadata::default()
    }
}

/// Description of a registered factory, for listings
#[derive(Debug, Clone)]
pub struct FactoryMetadata {
    pub description: String,
    pub category: String,
    pub params: Vec<ParamDefinition>,
}

impl Default for FactoryMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            params: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParamDefinition {
    pub name: String,
    pub description: String,
    pub required: bool,
}

/// Whether a registered name is a continuation or a mapper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactoryKind {
    Continuation,
    Mapper,
}

/// Registry of continuations and mappers available to graph files
pub struct ContinuationRegistry {
    continuations: HashMap<String, Arc<dyn ContinuationFactory>>,
    mappers: HashMap<String, Arc<dyn MapperFactory>>,
}

impl ContinuationRegistry {
    pub fn new() -> Self {
        Self {
            continuations: HashMap::new(),
            mappers: HashMap::new(),
        }
    }

    pub fn register(&mut self, factory: Arc<dyn ContinuationFactory>) {
        let name = factory.name().to_string();
        tracing::info!("Registering continuation: {}", name);
        self.continuations.insert(name, factory);
    }

    pub fn register_mapper(&mut self, factory: Arc<dyn MapperFactory>) {
        let name = factory.name().to_string();
        tracing::info!("Registering mapper: {}", name);
        self.mappers.insert(name, factory);
    }

    /// Instantiate a continuation by name
    pub fn continuation(&self, name: &str, params: &Value) -> Result<Arc<dyn Continuation>, GraphError> {
        let factory = self
            .continuations
            .get(name)
            .ok_or_else(|| GraphError::UnknownContinuation(name.to_string()))?;
        factory.create(params)
    }

    /// Instantiate a mapper by name
    pub fn mapper(&self, name: &str, params: &Value) -> Result<Arc<dyn Mapper>, GraphError> {
        let factory = self
            .mappers
            .get(name)
            .ok_or_else(|| GraphError::UnknownContinuation(name.to_string()))?;
        factory.create(params)
    }

    /// All registered names, sorted
    pub fn list(&self) -> Vec<(String, FactoryKind)> {
        let mut all: Vec<(String, FactoryKind)> = self
            .continuations
            .keys()
            .map(|n| (n.clone(), FactoryKind::Continuation))
            .chain(self.mappers.keys().map(|n| (n.clone(), FactoryKind::Mapper)))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn get_metadata(&self, name: &str) -> Option<FactoryMetadata> {
        self.continuations
            .get(name)
            .map(|f| f.metadata())
            .or_else(|| self.mappers.get(name).map(|f| f.metadata()))
    }
}

impl Default for ContinuationRegistry {
    fn default() -> Self {
        Self::new()
    }
}
