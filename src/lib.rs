//! sqlweave - a templating query compiler with pluggable tags and filters
//!
//! Templates mix SQL with control flow and extension tags. Compilation turns
//! a template into a small program plus metadata gathered by extensions;
//! execution runs that program against request data and yields a
//! parameterized [`QueryBuilder`].
//!
//! # Example
//!
//! ```rust
//! use serde_json::json;
//! use sqlweave::{builtins, Engine};
//!
//! # tokio_test_block(async {
//! let engine = Engine::new(builtins::catalog()).unwrap();
//! engine
//!     .register("user", "SELECT * FROM users WHERE id = {{ id | required }}")
//!     .await
//!     .unwrap();
//!
//! let builder = engine.execute("user", json!({ "id": 5 })).await.unwrap();
//! assert_eq!(builder.statement, "SELECT * FROM users WHERE id = $1");
//! assert_eq!(builder.parameters, vec![json!(5)]);
//! # });
//! # fn tokio_test_block(f: impl std::future::Future<Output = ()>) {
//! #     tokio::runtime::Runtime::new().unwrap().block_on(f)
//! # }
//! ```

pub mod builtins;
pub mod compiler;
pub mod config;
pub mod error;
pub mod extension;
pub mod parser;
pub mod runtime;

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

pub use compiler::{CompileResult, Compiler, Metadata};
pub use config::EngineConfig;
pub use error::{CompileError, ConfigurationError, ParseError};
pub use extension::{load_extensions, Environments, Extension, ExtensionDecl};
pub use runtime::{ExecuteError, Executor, MemoryArtifactStore, QueryBuilder, StoreError};

/// Errors from registering a template
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Compiler, artifact store and executor over one loaded extension set
///
/// Extensions are loaded when the engine is built; a configuration error
/// means no engine exists, so compile and execute calls can never run
/// against a partial extension set.
#[derive(Debug)]
pub struct Engine {
    compiler: Compiler,
    store: Arc<MemoryArtifactStore>,
    executor: Executor,
}

impl Engine {
    /// Build an engine from an explicit extension list
    pub fn new(extensions: impl IntoIterator<Item = Extension>) -> Result<Self, ConfigurationError> {
        Self::build(extensions, EngineConfig::default())
    }

    /// Build an engine from configuration
    pub fn from_config(config: EngineConfig) -> Result<Self, ConfigurationError> {
        let extensions = config.resolve_extensions()?;
        Self::build(extensions, config)
    }

    fn build(
        extensions: impl IntoIterator<Item = Extension>,
        config: EngineConfig,
    ) -> Result<Self, ConfigurationError> {
        let envs = load_extensions(extensions)?;
        let store = Arc::new(MemoryArtifactStore::new());
        let executor = Executor::new(store.clone(), envs.runtime.clone())
            .with_options(config.run_options());
        tracing::debug!(
            tags = envs.compile_time.tag_names().count(),
            strict_variables = config.strict_variables,
            "engine ready"
        );
        Ok(Self {
            compiler: Compiler::new(envs),
            store,
            executor,
        })
    }

    pub fn compiler(&self) -> &Compiler {
        &self.compiler
    }

    pub fn store(&self) -> &MemoryArtifactStore {
        &self.store
    }

    /// Compile template source without storing it
    pub fn compile(&self, source: &str) -> Result<CompileResult, CompileError> {
        self.compiler.compile(source)
    }

    /// Compile `source` and store it under `name`, replacing any previous version
    pub async fn register(&self, name: &str, source: &str) -> Result<Metadata, RegisterError> {
        let result = self.compiler.compile(source)?;
        let metadata = result.metadata.clone();
        self.store.save(name, result)?;
        self.executor.invalidate(name).await;
        tracing::debug!(template = name, "registered template");
        Ok(metadata)
    }

    /// Execute the template stored under `name` with `data`
    pub async fn execute(&self, name: &str, data: Value) -> Result<QueryBuilder, ExecuteError> {
        self.executor.execute(name, data).await
    }
}
