//! `error` tag: abort execution with a user-defined code
//!
//! `{% error "USER_NOT_FOUND" %}` fails the execution with
//! [`ExtensionError::Raised`]. Codes used by a template are reported in the
//! compilation metadata so API documentation can list them.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::extension::{
    Capabilities, CompilationHooks, CompileTimeHooks, ExtensionError, MetadataContribution,
    TagBuilder, TagRunner,
};
use crate::parser::{AstNode, Expr, Literal, Node, NodeKind};
use crate::runtime::TagContext;

const NAME: &str = "error";
pub const METADATA_KEY: &str = "error.codes";

pub struct ErrorTagBuilder;

impl CompileTimeHooks for ErrorTagBuilder {
    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    fn begin_compilation(&self) -> Box<dyn CompilationHooks> {
        Box::<ErrorCodeCollector>::default()
    }
}

impl TagBuilder for ErrorTagBuilder {
    fn name(&self) -> &str {
        NAME
    }
}

#[derive(Default)]
struct ErrorCodeCollector {
    codes: Vec<Value>,
}

impl CompilationHooks for ErrorCodeCollector {
    fn interested_in(&self, kind: NodeKind) -> bool {
        kind == NodeKind::Tag
    }

    fn on_ast_visit(&mut self, node: AstNode<'_>) {
        let AstNode::Node(node) = node else { return };
        let Node::Tag(call) = &node.node else { return };
        if call.name.node.as_str() != NAME {
            return;
        }
        if let Some(Expr::Literal(Literal::String(code))) = call.positional().next().map(|e| &e.node) {
            self.codes.push(json!({ "code": code, "offset": node.span.start }));
        }
    }

    fn provide_metadata(&self) -> Option<MetadataContribution> {
        if self.codes.is_empty() {
            return None;
        }
        Some(MetadataContribution::new(
            METADATA_KEY,
            Value::Array(self.codes.clone()),
        ))
    }
}

pub struct ErrorTagRunner;

#[async_trait]
impl TagRunner for ErrorTagRunner {
    fn name(&self) -> &str {
        NAME
    }

    async fn run(&self, ctx: &mut TagContext<'_>) -> Result<(), ExtensionError> {
        match ctx.arg(0) {
            Some(Value::String(code)) => Err(ExtensionError::Raised { code: code.clone() }),
            _ => Err(ExtensionError::invalid_argument(
                NAME,
                "expected an error code string",
            )),
        }
    }
}
