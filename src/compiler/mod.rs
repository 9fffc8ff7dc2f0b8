//! Template compiler
//!
//! Runs the compile pipeline: parse, visitor pass, metadata aggregation,
//! async-aware preprocessing and code generation. Compilation is
//! synchronous and a pure function of the source and the loaded extensions.

mod codegen;
mod metadata;
mod preprocess;
pub mod program;
mod visitor;

use serde::{Deserialize, Serialize};

use crate::error::CompileError;
use crate::extension::Environments;
use crate::parser::{self, Template};

pub use codegen::generate;
pub use metadata::Metadata;
pub use preprocess::preprocess;
pub use program::{CodeError, Instr, Program};

/// Compiled code plus the metadata gathered while compiling it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileResult {
    pub compiled_data: String,
    pub metadata: Metadata,
}

/// Compiler bound to one loaded extension set
#[derive(Debug, Clone)]
pub struct Compiler {
    envs: Environments,
}

impl Compiler {
    pub fn new(envs: Environments) -> Self {
        Self { envs }
    }

    pub fn environments(&self) -> &Environments {
        &self.envs
    }

    /// Parse, visit and preprocess `source`.
    ///
    /// Returns the preprocessed tree together with the aggregated metadata.
    pub fn generate_ast(&self, source: &str) -> Result<(Template, Metadata), CompileError> {
        let template = parser::parse(source, self.envs.compile_time.as_ref())?;
        tracing::debug!(nodes = template.body.len(), "parsed template");

        let mut sessions = visitor::begin_sessions(&self.envs);
        visitor::walk_ast(&template, &mut sessions);
        let metadata = metadata::aggregate(&sessions);

        // A runner can be asynchronous without a compile-time builder saying so
        let mut async_filters = self.envs.compile_time.async_filters();
        async_filters.extend(self.envs.runtime.async_filters());
        let template = preprocess(&template, &async_filters);
        tracing::debug!(
            metadata_keys = metadata.len(),
            async_filters = async_filters.len(),
            "preprocessed template"
        );
        Ok((template, metadata))
    }

    /// Compile `source` into code and metadata
    pub fn compile(&self, source: &str) -> Result<CompileResult, CompileError> {
        let (template, metadata) = self.generate_ast(source)?;
        let program = generate(&template, &self.envs.runtime)?;
        tracing::debug!(instructions = program.len(), "generated code");
        Ok(CompileResult {
            compiled_data: program.to_code(),
            metadata,
        })
    }
}
