//! Analyzer abstraction: the external computation a job stands for.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use assay_core::{AnalyzerError, JobKind};

/// Performs the analysis for one job kind.
///
/// Implementations must classify their failures; the worker decides between
/// retry and failure from the [`AnalyzerError`] variant alone.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, input: &Value) -> Result<Value, AnalyzerError>;
}

type BoxedAnalyzeFuture = Pin<Box<dyn Future<Output = Result<Value, AnalyzerError>> + Send>>;

/// Adapter turning an async closure into an [`Analyzer`].
pub struct FnAnalyzer<F> {
    f: F,
}

impl<F> FnAnalyzer<F>
where
    F: Fn(Value) -> BoxedAnalyzeFuture + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Analyzer for FnAnalyzer<F>
where
    F: Fn(Value) -> BoxedAnalyzeFuture + Send + Sync,
{
    async fn analyze(&self, input: &Value) -> Result<Value, AnalyzerError> {
        (self.f)(input.clone()).await
    }
}

/// Analyzer per job kind.
#[derive(Clone, Default)]
pub struct AnalyzerRegistry {
    analyzers: HashMap<JobKind, Arc<dyn Analyzer>>,
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the analyzer for `kind`.
    pub fn register(&mut self, kind: JobKind, analyzer: Arc<dyn Analyzer>) {
        self.analyzers.insert(kind, analyzer);
    }

    pub fn with(mut self, kind: JobKind, analyzer: Arc<dyn Analyzer>) -> Self {
        self.register(kind, analyzer);
        self
    }

    /// Register an async closure for `kind`.
    pub fn register_fn<F, Fut>(&mut self, kind: JobKind, f: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, AnalyzerError>> + Send + 'static,
    {
        let boxed = move |input: Value| -> BoxedAnalyzeFuture { Box::pin(f(input)) };
        self.register(kind, Arc::new(FnAnalyzer::new(boxed)));
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn Analyzer>> {
        self.analyzers.get(&kind).cloned()
    }

    /// Kinds with no analyzer; jobs of these kinds fail on claim.
    pub fn missing_kinds(&self) -> Vec<JobKind> {
        JobKind::ALL
            .into_iter()
            .filter(|k| !self.analyzers.contains_key(k))
            .collect()
    }
}

impl std::fmt::Debug for AnalyzerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.analyzers.keys().collect();
        kinds.sort();
        f.debug_struct("AnalyzerRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}
