//! Code generation: preprocessed tree to stack-machine program

use crate::error::{CompileError, SymbolKind};
use crate::extension::RuntimeEnvironment;
use crate::parser::{BinaryOp, Expr, FilterCall, Identifier, Node, Spanned, TagArg, TagCall, Template};

use super::program::{FilterOp, Instr, IterOp, Program, TagOp};

/// Compile a preprocessed template against the runtime environment.
///
/// Every tag and filter must be registered in `runtime`; the first one
/// that is not, in document order, fails the compilation.
pub fn generate(template: &Template, runtime: &RuntimeEnvironment) -> Result<Program, CompileError> {
    resolve_nodes(&template.body, runtime)?;

    let mut gen = Generator::default();
    gen.nodes(&template.body);
    gen.push(Instr::Export);
    Ok(Program::new(gen.instrs))
}

fn unresolved(kind: SymbolKind, name: &Spanned<Identifier>) -> CompileError {
    CompileError::Unresolved {
        kind,
        name: name.node.0.clone(),
        span: name.span.clone(),
    }
}

fn resolve_nodes(nodes: &[Spanned<Node>], runtime: &RuntimeEnvironment) -> Result<(), CompileError> {
    for node in nodes {
        match &node.node {
            Node::Text(_) => {}
            Node::Output(expr) => resolve_expr(expr, runtime)?,
            Node::If(block) => {
                for branch in &block.branches {
                    resolve_expr(&branch.condition, runtime)?;
                    resolve_nodes(&branch.body, runtime)?;
                }
                if let Some(otherwise) = &block.otherwise {
                    resolve_nodes(otherwise, runtime)?;
                }
            }
            Node::For(block) => {
                resolve_expr(&block.iterable, runtime)?;
                resolve_nodes(&block.body, runtime)?;
            }
            Node::Set(stmt) => resolve_expr(&stmt.value, runtime)?,
            Node::Tag(call) => {
                if !runtime.has_tag(call.name.node.as_str()) {
                    return Err(unresolved(SymbolKind::Tag, &call.name));
                }
                for arg in &call.args {
                    resolve_expr(arg.value(), runtime)?;
                }
                if let Some(body) = &call.body {
                    resolve_nodes(body, runtime)?;
                }
            }
        }
    }
    Ok(())
}

fn resolve_expr(expr: &Spanned<Expr>, runtime: &RuntimeEnvironment) -> Result<(), CompileError> {
    match &expr.node {
        Expr::Literal(_) | Expr::Variable(_) => Ok(()),
        Expr::Attribute { target, .. } => resolve_expr(target, runtime),
        Expr::Filter(call) | Expr::AwaitFilter(call) => {
            resolve_expr(&call.target, runtime)?;
            if !runtime.has_filter(call.name.node.as_str()) {
                return Err(unresolved(SymbolKind::Filter, &call.name));
            }
            call.args.iter().try_for_each(|arg| resolve_expr(arg, runtime))
        }
        Expr::Not(inner) => resolve_expr(inner, runtime),
        Expr::Binary { lhs, rhs, .. } => {
            resolve_expr(lhs, runtime)?;
            resolve_expr(rhs, runtime)
        }
    }
}

#[derive(Default)]
struct Generator {
    instrs: Vec<Instr>,
}

impl Generator {
    fn push(&mut self, instr: Instr) -> usize {
        self.instrs.push(instr);
        self.instrs.len() - 1
    }

    fn here(&self) -> usize {
        self.instrs.len()
    }

    /// Point a previously emitted jump at `target`
    fn patch(&mut self, at: usize, target: usize) {
        match &mut self.instrs[at] {
            Instr::Jump(t)
            | Instr::JumpIfFalse(t)
            | Instr::JumpIfFalseOrPop(t)
            | Instr::JumpIfTrueOrPop(t) => *t = target,
            Instr::IterNext(op) => op.exit = target,
            _ => {}
        }
    }

    fn nodes(&mut self, nodes: &[Spanned<Node>]) {
        for node in nodes {
            self.node(node);
        }
    }

    fn node(&mut self, node: &Spanned<Node>) {
        match &node.node {
            Node::Text(text) => {
                if !text.is_empty() {
                    self.push(Instr::Text(text.clone()));
                }
            }
            Node::Output(expr) => {
                self.expr(expr);
                self.push(Instr::Emit);
            }
            Node::If(block) => {
                let mut exits = Vec::new();
                for branch in &block.branches {
                    self.expr(&branch.condition);
                    let skip = self.push(Instr::JumpIfFalse(0));
                    self.nodes(&branch.body);
                    exits.push(self.push(Instr::Jump(0)));
                    let next = self.here();
                    self.patch(skip, next);
                }
                if let Some(otherwise) = &block.otherwise {
                    self.nodes(otherwise);
                }
                let end = self.here();
                for exit in exits {
                    self.patch(exit, end);
                }
            }
            Node::For(block) => {
                self.expr(&block.iterable);
                self.push(Instr::IterStart);
                let head = self.push(Instr::IterNext(IterOp {
                    var: block.variable.node.0.clone(),
                    exit: 0,
                }));
                self.nodes(&block.body);
                self.push(Instr::Jump(head));
                let end = self.here();
                self.patch(head, end);
            }
            Node::Set(stmt) => {
                self.expr(&stmt.value);
                self.push(Instr::Set(stmt.target.node.0.clone()));
            }
            Node::Tag(call) => self.tag(call),
        }
    }

    fn tag(&mut self, call: &TagCall) {
        if let Some(body) = &call.body {
            self.push(Instr::Capture);
            self.nodes(body);
        }

        let mut argc = 0;
        for value in call.positional() {
            self.expr(value);
            argc += 1;
        }
        let mut kwargs = Vec::new();
        for arg in &call.args {
            if let TagArg::Keyword { key, value } = arg {
                self.expr(value);
                kwargs.push(key.node.0.clone());
            }
        }

        self.push(Instr::CallTag(TagOp {
            name: call.name.node.0.clone(),
            argc,
            kwargs,
            body: call.body.is_some(),
        }));
    }

    fn expr(&mut self, expr: &Spanned<Expr>) {
        match &expr.node {
            Expr::Literal(lit) => {
                self.push(Instr::Const(lit.to_value()));
            }
            Expr::Variable(id) => {
                self.push(Instr::Load(id.0.clone()));
            }
            Expr::Attribute { target, attr } => {
                self.expr(target);
                self.push(Instr::Attr(attr.0.clone()));
            }
            Expr::Filter(call) => {
                let op = self.filter_operands(call);
                self.push(Instr::Filter(op));
            }
            Expr::AwaitFilter(call) => {
                let op = self.filter_operands(call);
                self.push(Instr::AwaitFilter(op));
            }
            Expr::Not(inner) => {
                self.expr(inner);
                self.push(Instr::Not);
            }
            // The right operand only runs when the left one does not decide
            Expr::Binary {
                op: op @ (BinaryOp::And | BinaryOp::Or),
                lhs,
                rhs,
            } => {
                self.expr(lhs);
                let short = match op {
                    BinaryOp::And => self.push(Instr::JumpIfFalseOrPop(0)),
                    _ => self.push(Instr::JumpIfTrueOrPop(0)),
                };
                self.expr(rhs);
                let end = self.here();
                self.patch(short, end);
            }
            Expr::Binary { op, lhs, rhs } => {
                self.expr(lhs);
                self.expr(rhs);
                self.push(Instr::Binary(*op));
            }
        }
    }

    fn filter_operands(&mut self, call: &FilterCall) -> FilterOp {
        self.expr(&call.target);
        for arg in &call.args {
            self.expr(arg);
        }
        FilterOp {
            name: call.name.node.0.clone(),
            argc: call.args.len(),
        }
    }
}
