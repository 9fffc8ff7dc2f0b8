//! Built-in filters: `upper`, `lower` and the `required` validator

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::Value;

use crate::extension::{
    Capabilities, CompilationHooks, CompileTimeHooks, ExtensionError, FilterBuilder, FilterRunner,
    MetadataContribution,
};
use crate::parser::{AstNode, Expr, NodeKind};

pub const REQUIRED_METADATA_KEY: &str = "parameters.required";

/// Compile-time announcement of a plain synchronous filter
pub struct SyncFilter(pub &'static str);

impl CompileTimeHooks for SyncFilter {}

impl FilterBuilder for SyncFilter {
    fn name(&self) -> &str {
        self.0
    }
}

/// Case conversion of string values; other values pass through
pub struct CaseFilter {
    name: &'static str,
    convert: fn(&str) -> String,
}

impl CaseFilter {
    pub fn upper() -> Self {
        Self {
            name: "upper",
            convert: str::to_uppercase,
        }
    }

    pub fn lower() -> Self {
        Self {
            name: "lower",
            convert: str::to_lowercase,
        }
    }
}

#[async_trait]
impl FilterRunner for CaseFilter {
    fn name(&self) -> &str {
        self.name
    }

    async fn transform(&self, value: Value, _args: Vec<Value>) -> Result<Value, ExtensionError> {
        Ok(match value {
            Value::String(s) => Value::String((self.convert)(&s)),
            other => other,
        })
    }
}

const REQUIRED: &str = "required";

/// `required` at compile time: records which variable paths are validated
pub struct RequiredFilterBuilder;

impl CompileTimeHooks for RequiredFilterBuilder {
    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    fn begin_compilation(&self) -> Box<dyn CompilationHooks> {
        Box::<RequiredCollector>::default()
    }
}

impl FilterBuilder for RequiredFilterBuilder {
    fn name(&self) -> &str {
        REQUIRED
    }
}

#[derive(Default)]
struct RequiredCollector {
    paths: BTreeSet<String>,
}

impl CompilationHooks for RequiredCollector {
    fn interested_in(&self, kind: NodeKind) -> bool {
        matches!(kind, NodeKind::Filter | NodeKind::AwaitFilter)
    }

    fn on_ast_visit(&mut self, node: AstNode<'_>) {
        let AstNode::Expr(expr) = node else { return };
        let (Expr::Filter(call) | Expr::AwaitFilter(call)) = &expr.node else {
            return;
        };
        if call.name.node.as_str() != REQUIRED {
            return;
        }
        if let Some(path) = call.target.node.as_path() {
            self.paths.insert(path);
        }
    }

    fn provide_metadata(&self) -> Option<MetadataContribution> {
        if self.paths.is_empty() {
            return None;
        }
        let paths = self.paths.iter().cloned().map(Value::String).collect();
        Some(MetadataContribution::new(
            REQUIRED_METADATA_KEY,
            Value::Array(paths),
        ))
    }
}

/// `required` at runtime: rejects null, passes everything else through
pub struct RequiredFilterRunner;

#[async_trait]
impl FilterRunner for RequiredFilterRunner {
    fn name(&self) -> &str {
        REQUIRED
    }

    async fn transform(&self, value: Value, args: Vec<Value>) -> Result<Value, ExtensionError> {
        if !value.is_null() {
            return Ok(value);
        }
        let message = match args.first().and_then(Value::as_str) {
            Some(custom) => custom.to_string(),
            None => "value is required".to_string(),
        };
        Err(ExtensionError::failed(REQUIRED, message))
    }
}
