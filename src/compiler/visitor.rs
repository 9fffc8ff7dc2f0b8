//! Single pre-order pass over the tree, feeding every interested visitor

use crate::extension::{Capabilities, CompilationHooks, Environments};
use crate::parser::{AstNode, Expr, Node, Spanned, Template};

/// Hooks of one capability-bearing extension for one compilation
pub struct Session {
    pub name: String,
    pub capabilities: Capabilities,
    pub hooks: Box<dyn CompilationHooks>,
}

/// Start fresh hooks for every capability-bearing extension, in registration order
pub fn begin_sessions(envs: &Environments) -> Vec<Session> {
    envs.hooked()
        .iter()
        .filter_map(|ext| {
            ext.begin_compilation().map(|hooks| Session {
                name: ext.name().to_string(),
                capabilities: ext.capabilities(),
                hooks,
            })
        })
        .collect()
}

/// Visit every node and expression of `template` in document order.
///
/// For each element, visitors run in the order of `sessions`. Sessions
/// without the AST-visit capability are skipped.
pub fn walk_ast(template: &Template, sessions: &mut [Session]) {
    let mut visitors: Vec<&mut Session> = sessions
        .iter_mut()
        .filter(|s| s.capabilities.ast_visit)
        .collect();
    if visitors.is_empty() {
        return;
    }
    let mut walker = Walker {
        visitors: &mut visitors,
    };
    walker.nodes(&template.body);
}

struct Walker<'s, 'v> {
    visitors: &'s mut [&'v mut Session],
}

impl Walker<'_, '_> {
    fn visit(&mut self, element: AstNode<'_>) {
        let kind = element.kind();
        for session in self.visitors.iter_mut() {
            if session.hooks.interested_in(kind) {
                session.hooks.on_ast_visit(element);
            }
        }
    }

    fn nodes(&mut self, nodes: &[Spanned<Node>]) {
        for node in nodes {
            self.node(node);
        }
    }

    fn node(&mut self, node: &Spanned<Node>) {
        self.visit(AstNode::Node(node));
        match &node.node {
            Node::Text(_) => {}
            Node::Output(expr) => self.expr(expr),
            Node::If(block) => {
                for branch in &block.branches {
                    self.expr(&branch.condition);
                    self.nodes(&branch.body);
                }
                if let Some(otherwise) = &block.otherwise {
                    self.nodes(otherwise);
                }
            }
            Node::For(block) => {
                self.expr(&block.iterable);
                self.nodes(&block.body);
            }
            Node::Set(stmt) => self.expr(&stmt.value),
            Node::Tag(call) => {
                for arg in &call.args {
                    self.expr(arg.value());
                }
                if let Some(body) = &call.body {
                    self.nodes(body);
                }
            }
        }
    }

    fn expr(&mut self, expr: &Spanned<Expr>) {
        self.visit(AstNode::Expr(expr));
        match &expr.node {
            Expr::Literal(_) | Expr::Variable(_) => {}
            Expr::Attribute { target, .. } => self.expr(target),
            Expr::Filter(call) | Expr::AwaitFilter(call) => {
                self.expr(&call.target);
                for arg in &call.args {
                    self.expr(arg);
                }
            }
            Expr::Not(inner) => self.expr(inner),
            Expr::Binary { lhs, rhs, .. } => {
                self.expr(lhs);
                self.expr(rhs);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::parser::{parse, NodeKind, TagGrammar};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        label: &'static str,
        only: Option<NodeKind>,
        log: Log,
    }

    impl CompilationHooks for Recorder {
        fn interested_in(&self, kind: NodeKind) -> bool {
            self.only.map_or(true, |k| k == kind)
        }

        fn on_ast_visit(&mut self, node: AstNode<'_>) {
            let entry = format!("{}:{:?}@{}", self.label, node.kind(), node.span().start);
            self.log.lock().unwrap().push(entry);
        }
    }

    fn session(label: &'static str, only: Option<NodeKind>, ast_visit: bool, log: &Log) -> Session {
        Session {
            name: label.to_string(),
            capabilities: Capabilities {
                ast_visit,
                provide_metadata: false,
            },
            hooks: Box::new(Recorder {
                label,
                only,
                log: log.clone(),
            }),
        }
    }

    fn grammars() -> BTreeMap<String, TagGrammar> {
        let mut map = BTreeMap::new();
        map.insert("req".to_string(), TagGrammar::block("req"));
        map
    }

    #[test]
    fn test_document_order_and_registration_order() {
        let template = parse("a{{ x | upper }}b", &grammars()).unwrap();
        let log: Log = Arc::default();
        let mut sessions = vec![session("first", None, true, &log), session("second", None, true, &log)];
        walk_ast(&template, &mut sessions);

        let entries = log.lock().unwrap().clone();
        assert_eq!(
            entries,
            vec![
                "first:Text@0",
                "second:Text@0",
                "first:Output@1",
                "second:Output@1",
                "first:Filter@4",
                "second:Filter@4",
                "first:Variable@4",
                "second:Variable@4",
                "first:Text@16",
                "second:Text@16",
            ]
        );
    }

    #[test]
    fn test_interest_filters_node_kinds() {
        let source = "{% req \"users\" %}{% if a %}{{ b }}{% endif %}{% endreq %}";
        let template = parse(source, &grammars()).unwrap();
        let log: Log = Arc::default();
        let mut sessions = vec![session("vars", Some(NodeKind::Variable), true, &log)];
        walk_ast(&template, &mut sessions);

        let entries = log.lock().unwrap().clone();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.starts_with("vars:Variable")));
    }

    #[test]
    fn test_sessions_without_capability_are_skipped() {
        let template = parse("{{ a }}", &grammars()).unwrap();
        let log: Log = Arc::default();
        let mut sessions = vec![session("silent", None, false, &log)];
        walk_ast(&template, &mut sessions);
        assert!(log.lock().unwrap().is_empty());
    }
}
