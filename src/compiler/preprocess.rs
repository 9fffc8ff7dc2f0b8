//! Async-aware preprocessing
//!
//! Rewrites every application of an asynchronous filter into an explicit
//! [`Expr::AwaitFilter`], so code generation never has to discover
//! asynchrony late. The input tree is borrowed and a new tree is returned.

use std::collections::BTreeSet;

use crate::parser::{
    Branch, Expr, FilterCall, ForBlock, IfBlock, Node, SetStmt, Spanned, TagArg, TagCall, Template,
};

/// Produce a copy of `template` with async filter applications awaited
pub fn preprocess(template: &Template, async_filters: &BTreeSet<String>) -> Template {
    let rewriter = Rewriter { async_filters };
    Template {
        body: rewriter.nodes(&template.body),
    }
}

struct Rewriter<'a> {
    async_filters: &'a BTreeSet<String>,
}

impl Rewriter<'_> {
    fn nodes(&self, nodes: &[Spanned<Node>]) -> Vec<Spanned<Node>> {
        nodes.iter().map(|n| self.node(n)).collect()
    }

    fn node(&self, node: &Spanned<Node>) -> Spanned<Node> {
        let rewritten = match &node.node {
            Node::Text(text) => Node::Text(text.clone()),
            Node::Output(expr) => Node::Output(self.expr(expr)),
            Node::If(block) => Node::If(IfBlock {
                branches: block
                    .branches
                    .iter()
                    .map(|b| Branch {
                        condition: self.expr(&b.condition),
                        body: self.nodes(&b.body),
                    })
                    .collect(),
                otherwise: block.otherwise.as_deref().map(|body| self.nodes(body)),
            }),
            Node::For(block) => Node::For(ForBlock {
                variable: block.variable.clone(),
                iterable: self.expr(&block.iterable),
                body: self.nodes(&block.body),
            }),
            Node::Set(stmt) => Node::Set(SetStmt {
                target: stmt.target.clone(),
                value: self.expr(&stmt.value),
            }),
            Node::Tag(call) => Node::Tag(TagCall {
                name: call.name.clone(),
                args: call.args.iter().map(|a| self.arg(a)).collect(),
                body: call.body.as_deref().map(|body| self.nodes(body)),
            }),
        };
        Spanned::new(rewritten, node.span.clone())
    }

    fn arg(&self, arg: &TagArg) -> TagArg {
        match arg {
            TagArg::Positional(value) => TagArg::Positional(self.expr(value)),
            TagArg::Keyword { key, value } => TagArg::Keyword {
                key: key.clone(),
                value: self.expr(value),
            },
        }
    }

    fn expr(&self, expr: &Spanned<Expr>) -> Spanned<Expr> {
        let rewritten = match &expr.node {
            Expr::Literal(_) | Expr::Variable(_) => expr.node.clone(),
            Expr::Attribute { target, attr } => Expr::Attribute {
                target: Box::new(self.expr(target)),
                attr: attr.clone(),
            },
            Expr::Filter(call) => {
                let call = self.filter_call(call);
                if self.async_filters.contains(call.name.node.as_str()) {
                    Expr::AwaitFilter(call)
                } else {
                    Expr::Filter(call)
                }
            }
            Expr::AwaitFilter(call) => Expr::AwaitFilter(self.filter_call(call)),
            Expr::Not(inner) => Expr::Not(Box::new(self.expr(inner))),
            Expr::Binary { op, lhs, rhs } => Expr::Binary {
                op: *op,
                lhs: Box::new(self.expr(lhs)),
                rhs: Box::new(self.expr(rhs)),
            },
        };
        Spanned::new(rewritten, expr.span.clone())
    }

    fn filter_call(&self, call: &FilterCall) -> FilterCall {
        FilterCall {
            target: Box::new(self.expr(&call.target)),
            name: call.name.clone(),
            args: call.args.iter().map(|a| self.expr(a)).collect(),
        }
    }
}
