//! Runtime: executing compiled templates into query builders

mod builder;
mod error;
mod executor;
mod machine;

pub use builder::QueryBuilder;
pub use error::{ExecuteError, RuntimeError, StoreError};
pub use executor::{ArtifactLoader, ExecutionState, Executor, MemoryArtifactStore};
pub use machine::{is_truthy, Machine, RunOptions, TagContext};
