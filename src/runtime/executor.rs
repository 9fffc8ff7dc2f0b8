//! Execution of named compiled templates

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use crate::compiler::{CompileResult, Program};
use crate::extension::RuntimeEnvironment;

use super::builder::QueryBuilder;
use super::error::{ExecuteError, RuntimeError, StoreError};
use super::machine::{Machine, RunOptions};

/// Source of compiled artifacts, looked up by template name
#[async_trait]
pub trait ArtifactLoader: Send + Sync {
    /// Compiled code of `name`, or None if no such template exists
    async fn load_code(&self, name: &str) -> Result<Option<String>, StoreError>;
}

/// In-memory artifact store
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    inner: RwLock<HashMap<String, CompileResult>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or replace) the artifact for `name`
    pub fn save(&self, name: impl Into<String>, artifact: CompileResult) -> Result<(), StoreError> {
        let mut store = self.inner.write().map_err(|_| StoreError::Poisoned)?;
        store.insert(name.into(), artifact);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Option<CompileResult>, StoreError> {
        let store = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        Ok(store.get(name).cloned())
    }

    pub fn names(&self) -> Result<Vec<String>, StoreError> {
        let store = self.inner.read().map_err(|_| StoreError::Poisoned)?;
        let mut names: Vec<_> = store.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}

#[async_trait]
impl ArtifactLoader for MemoryArtifactStore {
    async fn load_code(&self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self.get(name)?.map(|artifact| artifact.compiled_data))
    }
}

/// Lifecycle of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    Loading,
    Running,
    Resolved,
    Failed,
}

impl ExecutionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecutionState::Resolved | ExecutionState::Failed)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecutionState::Idle => "idle",
            ExecutionState::Loading => "loading",
            ExecutionState::Running => "running",
            ExecutionState::Resolved => "resolved",
            ExecutionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks the state machine of one `execute` call
#[derive(Debug)]
struct Execution<'a> {
    template: &'a str,
    history: Vec<ExecutionState>,
}

impl<'a> Execution<'a> {
    fn new(template: &'a str) -> Self {
        Self {
            template,
            history: vec![ExecutionState::Idle],
        }
    }

    fn state(&self) -> ExecutionState {
        self.history
            .last()
            .copied()
            .unwrap_or(ExecutionState::Idle)
    }

    fn transition(&mut self, next: ExecutionState) {
        let from = self.state();
        if from.is_terminal() {
            return;
        }
        tracing::debug!(template = self.template, %from, to = %next, "execution transition");
        self.history.push(next);
    }

    fn finish(
        &mut self,
        result: Result<QueryBuilder, ExecuteError>,
    ) -> Result<QueryBuilder, ExecuteError> {
        match &result {
            Ok(_) => self.transition(ExecutionState::Resolved),
            Err(err) => {
                tracing::debug!(template = self.template, error = %err, "execution failed");
                self.transition(ExecutionState::Failed);
            }
        }
        result
    }
}

/// Decoded programs plus a per-name generation bumped by every invalidation
#[derive(Default)]
struct ProgramCache {
    programs: HashMap<String, Arc<Program>>,
    generations: HashMap<String, u64>,
}

impl ProgramCache {
    fn generation(&self, name: &str) -> u64 {
        self.generations.get(name).copied().unwrap_or(0)
    }
}

/// Runs compiled templates against request data
///
/// Decoded programs are cached by template name. Each call to
/// [`Executor::execute`] gets its own machine, so concurrent calls share
/// nothing mutable.
pub struct Executor {
    loader: Arc<dyn ArtifactLoader>,
    runtime: Arc<RuntimeEnvironment>,
    options: RunOptions,
    cache: tokio::sync::RwLock<ProgramCache>,
}

impl Executor {
    pub fn new(loader: Arc<dyn ArtifactLoader>, runtime: Arc<RuntimeEnvironment>) -> Self {
        Self {
            loader,
            runtime,
            options: RunOptions::default(),
            cache: tokio::sync::RwLock::new(ProgramCache::default()),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Execute template `name` with `data` bound as its variable scope
    pub async fn execute(&self, name: &str, data: Value) -> Result<QueryBuilder, ExecuteError> {
        let mut execution = Execution::new(name);
        self.execute_tracked(&mut execution, data).await
    }

    async fn execute_tracked(
        &self,
        execution: &mut Execution<'_>,
        data: Value,
    ) -> Result<QueryBuilder, ExecuteError> {
        let name = execution.template;
        execution.transition(ExecutionState::Loading);
        let program = match self.program(name).await {
            Ok(program) => program,
            Err(err) => return execution.finish(Err(err)),
        };

        execution.transition(ExecutionState::Running);
        let failed = |source: RuntimeError| ExecuteError::Execution {
            template: name.to_string(),
            source,
        };
        let result = match Machine::new(&program, &self.runtime, data, self.options) {
            Ok(machine) => machine.run().await.map_err(failed),
            Err(err) => Err(failed(err)),
        };
        let result = result.and_then(|exported| {
            exported.ok_or_else(|| ExecuteError::MissingExport {
                template: name.to_string(),
            })
        });
        execution.finish(result)
    }

    /// Decoded program for `name`, loading and caching it on first use
    ///
    /// A load that overlaps an [`Executor::invalidate`] of the same name is
    /// used for this call only and never cached.
    async fn program(&self, name: &str) -> Result<Arc<Program>, ExecuteError> {
        let generation = {
            let cache = self.cache.read().await;
            if let Some(program) = cache.programs.get(name) {
                return Ok(program.clone());
            }
            cache.generation(name)
        };

        let code = self
            .loader
            .load_code(name)
            .await?
            .ok_or_else(|| ExecuteError::TemplateNotFound(name.to_string()))?;
        let program = Program::from_code(&code).map_err(|e| ExecuteError::Execution {
            template: name.to_string(),
            source: RuntimeError::Code(e),
        })?;
        let program = Arc::new(program);

        let mut cache = self.cache.write().await;
        if cache.generation(name) == generation {
            tracing::debug!(template = name, instructions = program.len(), "cached program");
            cache.programs.insert(name.to_string(), program.clone());
        } else {
            tracing::debug!(template = name, "invalidated during load, not caching");
        }
        Ok(program)
    }

    /// Drop the cached program of `name` so the next call reloads it
    pub async fn invalidate(&self, name: &str) {
        let mut cache = self.cache.write().await;
        cache.programs.remove(name);
        *cache.generations.entry(name.to_string()).or_insert(0) += 1;
    }

    pub async fn is_cached(&self, name: &str) -> bool {
        self.cache.read().await.programs.contains_key(name)
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("runtime", &self.runtime)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::compiler::Metadata;

    fn artifact(code: &str) -> CompileResult {
        CompileResult {
            compiled_data: code.to_string(),
            metadata: Metadata::new(),
        }
    }

    fn executor(store: &Arc<MemoryArtifactStore>) -> Executor {
        Executor::new(store.clone(), Arc::new(RuntimeEnvironment::new()))
    }

    const SELECT_ID: &str = "program v1\ntext \"id = \"\nload \"id\"\nemit\nexport\nend\n";

    #[tokio::test]
    async fn test_execute_resolves_builder() {
        let store = Arc::new(MemoryArtifactStore::new());
        store.save("by_id", artifact(SELECT_ID)).unwrap();
        let exec = executor(&store);

        let mut execution = Execution::new("by_id");
        let builder = exec
            .execute_tracked(&mut execution, json!({"id": 5}))
            .await
            .unwrap();
        assert_eq!(builder.statement, "id = $1");
        assert_eq!(builder.parameters, vec![json!(5)]);
        assert_eq!(
            execution.history,
            vec![
                ExecutionState::Idle,
                ExecutionState::Loading,
                ExecutionState::Running,
                ExecutionState::Resolved,
            ]
        );
        assert!(exec.is_cached("by_id").await);
    }

    #[tokio::test]
    async fn test_unknown_template() {
        let store = Arc::new(MemoryArtifactStore::new());
        let exec = executor(&store);
        let mut execution = Execution::new("nope");
        let err = exec
            .execute_tracked(&mut execution, json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, ExecuteError::TemplateNotFound("nope".to_string()));
        assert_eq!(execution.state(), ExecutionState::Failed);
        assert!(!execution.history.contains(&ExecutionState::Running));
    }

    #[tokio::test]
    async fn test_missing_export() {
        let store = Arc::new(MemoryArtifactStore::new());
        store
            .save("silent", artifact("program v1\ntext \"SELECT 1\"\nend\n"))
            .unwrap();
        let err = executor(&store).execute("silent", json!({})).await.unwrap_err();
        assert_eq!(
            err,
            ExecuteError::MissingExport {
                template: "silent".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_corrupt_code_is_execution_error() {
        let store = Arc::new(MemoryArtifactStore::new());
        store.save("bad", artifact("not a program")).unwrap();
        let err = executor(&store).execute("bad", json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            ExecuteError::Execution {
                source: RuntimeError::Code(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_invalidate_reloads_artifact() {
        let store = Arc::new(MemoryArtifactStore::new());
        store.save("q", artifact(SELECT_ID)).unwrap();
        let exec = executor(&store);
        exec.execute("q", json!({"id": 1})).await.unwrap();

        store
            .save("q", artifact("program v1\ntext \"SELECT 2\"\nexport\nend\n"))
            .unwrap();
        let stale = exec.execute("q", json!({"id": 1})).await.unwrap();
        assert_eq!(stale.statement, "id = $1");

        exec.invalidate("q").await;
        let fresh = exec.execute("q", json!({"id": 1})).await.unwrap();
        assert_eq!(fresh.statement, "SELECT 2");
    }

    /// Reads the artifact immediately, then takes a while to hand it over
    struct SlowLoader {
        store: Arc<MemoryArtifactStore>,
        delay: std::time::Duration,
    }

    #[async_trait]
    impl ArtifactLoader for SlowLoader {
        async fn load_code(&self, name: &str) -> Result<Option<String>, StoreError> {
            let code = self.store.load_code(name).await;
            tokio::time::sleep(self.delay).await;
            code
        }
    }

    #[tokio::test]
    async fn test_invalidate_during_load_is_not_lost() {
        let store = Arc::new(MemoryArtifactStore::new());
        store
            .save("q", artifact("program v1\ntext \"SELECT 1\"\nexport\nend\n"))
            .unwrap();
        let loader = SlowLoader {
            store: store.clone(),
            delay: std::time::Duration::from_millis(50),
        };
        let exec = Executor::new(Arc::new(loader), Arc::new(RuntimeEnvironment::new()));

        let (in_flight, ()) = tokio::join!(exec.execute("q", json!({})), async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            store
                .save("q", artifact("program v1\ntext \"SELECT 2\"\nexport\nend\n"))
                .unwrap();
            exec.invalidate("q").await;
        });
        assert_eq!(in_flight.unwrap().statement, "SELECT 1");
        assert!(!exec.is_cached("q").await);

        let next = exec.execute("q", json!({})).await.unwrap();
        assert_eq!(next.statement, "SELECT 2");
        assert!(exec.is_cached("q").await);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut execution = Execution::new("t");
        execution.transition(ExecutionState::Loading);
        execution.transition(ExecutionState::Failed);
        execution.transition(ExecutionState::Running);
        assert_eq!(execution.state(), ExecutionState::Failed);
        assert_eq!(execution.history.len(), 3);
    }

    #[test]
    fn test_store_lists_names_sorted() {
        let store = MemoryArtifactStore::new();
        store.save("b", artifact(SELECT_ID)).unwrap();
        store.save("a", artifact(SELECT_ID)).unwrap();
        assert_eq!(store.names().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }
}
