//! `req` block tag: renders its body into a named builder
//!
//! ```text
//! {% req "users" main=true %}
//!   SELECT * FROM users WHERE id = {{ id }}
//! {% endreq %}
//! ```
//!
//! The builder is stored as a template variable under its name, so later
//! parts of the template can interpolate it. The builder marked `main=true`
//! is exported; without one, the first request is exported.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::extension::{
    Capabilities, CompilationHooks, CompileTimeHooks, ExtensionError, MetadataContribution,
    TagBuilder, TagRunner,
};
use crate::parser::{AstNode, Expr, Literal, Node, NodeKind, TagGrammar};
use crate::runtime::{is_truthy, TagContext};

const NAME: &str = "req";
pub const METADATA_KEY: &str = "builder.requests";

pub struct RequestTagBuilder;

impl CompileTimeHooks for RequestTagBuilder {
    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    fn begin_compilation(&self) -> Box<dyn CompilationHooks> {
        Box::<RequestCollector>::default()
    }
}

impl TagBuilder for RequestTagBuilder {
    fn name(&self) -> &str {
        NAME
    }

    fn grammar(&self) -> TagGrammar {
        TagGrammar::block(NAME)
    }
}

/// Collects every `req` declaration of one template
#[derive(Default)]
struct RequestCollector {
    requests: Vec<Value>,
}

impl CompilationHooks for RequestCollector {
    fn interested_in(&self, kind: NodeKind) -> bool {
        kind == NodeKind::Tag
    }

    fn on_ast_visit(&mut self, node: AstNode<'_>) {
        let AstNode::Node(node) = node else { return };
        let Node::Tag(call) = &node.node else { return };
        if call.name.node.as_str() != NAME {
            return;
        }

        // Only literal names are known at compile time
        let name = match call.positional().next().map(|e| &e.node) {
            Some(Expr::Literal(Literal::String(s))) => Value::String(s.clone()),
            _ => Value::Null,
        };
        let main = matches!(
            call.keyword("main").map(|e| &e.node),
            Some(Expr::Literal(Literal::Bool(true)))
        );
        self.requests.push(json!({ "name": name, "main": main }));
    }

    fn provide_metadata(&self) -> Option<MetadataContribution> {
        if self.requests.is_empty() {
            return None;
        }
        Some(MetadataContribution::new(
            METADATA_KEY,
            Value::Array(self.requests.clone()),
        ))
    }
}

pub struct RequestTagRunner;

#[async_trait]
impl TagRunner for RequestTagRunner {
    fn name(&self) -> &str {
        NAME
    }

    async fn run(&self, ctx: &mut TagContext<'_>) -> Result<(), ExtensionError> {
        let name = match ctx.arg(0) {
            Some(Value::String(name)) if !name.is_empty() => name.clone(),
            _ => {
                return Err(ExtensionError::invalid_argument(
                    NAME,
                    "expected a request name as first argument",
                ))
            }
        };

        let mut builder = ctx.take_body().unwrap_or_default();
        builder.name = Some(name.clone());
        builder.trim();

        let main = ctx.kwarg("main").is_some_and(is_truthy);
        ctx.set_builder(name, builder.clone());
        if main || !ctx.has_exported() {
            ctx.export(builder);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::extension::{load_extensions, Extension};
    use pretty_assertions::assert_eq;

    fn compiler() -> Compiler {
        Compiler::new(
            load_extensions([
                Extension::tag_builder(RequestTagBuilder),
                Extension::tag_runner(RequestTagRunner),
            ])
            .unwrap(),
        )
    }

    #[test]
    fn test_requests_listed_in_document_order() {
        let source = "{% req \"users\" %}a{% endreq %}{% req \"orders\" main=true %}b{% endreq %}{% req name %}c{% endreq %}";
        let result = compiler().compile(source).unwrap();
        assert_eq!(
            result.metadata.get(METADATA_KEY),
            Some(&json!([
                {"name": "users", "main": false},
                {"name": "orders", "main": true},
                {"name": null, "main": false},
            ]))
        );
    }

    #[test]
    fn test_no_requests_no_metadata() {
        let result = compiler().compile("SELECT 1").unwrap();
        assert!(result.metadata.get(METADATA_KEY).is_none());
    }
}
