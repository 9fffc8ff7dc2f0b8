//! Stack machine executing compiled programs
//!
//! One [`Machine`] runs one program against one data object. All mutable
//! state (value stack, scopes, builders) lives in the machine, so concurrent
//! executions of the same program never share anything but the immutable
//! program and runtime environment.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::{json, Map, Value};

use crate::compiler::program::{FilterOp, IterOp, TagOp};
use crate::compiler::{Instr, Program};
use crate::extension::RuntimeEnvironment;
use crate::parser::BinaryOp;

use super::builder::QueryBuilder;
use super::error::RuntimeError;

/// Per-execution options
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Treat undefined variables as errors instead of null
    pub strict_variables: bool,
}

/// A value held on the stack or in a scope
///
/// Builders made by tags during this execution are kept apart from data:
/// emitting a builder splices its SQL, while data of any shape is bound as
/// a parameter.
#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Data(Value),
    Builder(QueryBuilder),
}

impl Slot {
    fn into_value(self) -> Value {
        match self {
            Slot::Data(value) => value,
            Slot::Builder(builder) => builder.to_value(),
        }
    }

    fn is_truthy(&self) -> bool {
        match self {
            Slot::Data(value) => is_truthy(value),
            Slot::Builder(_) => true,
        }
    }
}

/// Variables, builders and the export slot of one execution
#[derive(Debug)]
struct State {
    /// Bound request data, read-only
    data: Map<String, Value>,
    /// Template-level frame first, then one frame per open loop
    scopes: Vec<HashMap<String, Slot>>,
    main: QueryBuilder,
    nested: Vec<QueryBuilder>,
    exported: Option<QueryBuilder>,
}

impl State {
    fn lookup(&self, name: &str) -> Option<Slot> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).cloned())
            .or_else(|| self.data.get(name).cloned().map(Slot::Data))
    }

    fn set(&mut self, name: String, value: Slot) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(name, value);
        }
    }

    /// Builder receiving output: the innermost capture, else the main builder
    fn current(&mut self) -> &mut QueryBuilder {
        match self.nested.last_mut() {
            Some(builder) => builder,
            None => &mut self.main,
        }
    }
}

/// View of the execution handed to a tag runner
pub struct TagContext<'a> {
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    body: Option<QueryBuilder>,
    state: &'a mut State,
}

impl TagContext<'_> {
    /// Positional arguments, in source order
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }

    /// Builder rendered from the tag body; None for inline tags or once taken
    pub fn take_body(&mut self) -> Option<QueryBuilder> {
        self.body.take()
    }

    /// Current value of a variable; builders come back in their value form
    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.state.lookup(name).map(Slot::into_value)
    }

    /// Bind a variable in the innermost scope
    pub fn set_variable(&mut self, name: impl Into<String>, value: Value) {
        self.state.set(name.into(), Slot::Data(value));
    }

    /// Bind a builder in the innermost scope; interpolating it inlines its
    /// SQL and parameters
    pub fn set_builder(&mut self, name: impl Into<String>, builder: QueryBuilder) {
        self.state.set(name.into(), Slot::Builder(builder));
    }

    /// The builder the tag's surroundings are writing into
    pub fn output(&mut self) -> &mut QueryBuilder {
        self.state.current()
    }

    /// Make `builder` the result of the execution
    pub fn export(&mut self, builder: QueryBuilder) {
        self.state.exported = Some(builder);
    }

    pub fn has_exported(&self) -> bool {
        self.state.exported.is_some()
    }
}

struct LoopState {
    items: Vec<Value>,
    next: usize,
}

/// Stack machine for one execution
pub struct Machine<'p> {
    program: &'p Program,
    runtime: &'p RuntimeEnvironment,
    options: RunOptions,
    pc: usize,
    stack: Vec<Slot>,
    loops: Vec<LoopState>,
    state: State,
}

impl<'p> Machine<'p> {
    /// Bind `data` as the root scope; it must be a JSON object
    pub fn new(
        program: &'p Program,
        runtime: &'p RuntimeEnvironment,
        data: Value,
        options: RunOptions,
    ) -> Result<Self, RuntimeError> {
        let data = match data {
            Value::Object(map) => map,
            other => return Err(RuntimeError::InvalidData(type_name(&other))),
        };
        Ok(Self {
            program,
            runtime,
            options,
            pc: 0,
            stack: Vec::new(),
            loops: Vec::new(),
            state: State {
                data,
                scopes: vec![HashMap::new()],
                main: QueryBuilder::new(),
                nested: Vec::new(),
                exported: None,
            },
        })
    }

    /// Run to completion, returning the exported builder if any
    pub async fn run(mut self) -> Result<Option<QueryBuilder>, RuntimeError> {
        let program = self.program;
        while let Some(instr) = program.instrs.get(self.pc) {
            self.pc += 1;
            self.step(instr).await?;
        }
        Ok(self.state.exported)
    }

    fn pop(&mut self, instr: &'static str) -> Result<Slot, RuntimeError> {
        self.stack
            .pop()
            .ok_or(RuntimeError::StackUnderflow { instr })
    }

    /// Pop `n` values as data, returned in push order
    fn pop_values(&mut self, n: usize, instr: &'static str) -> Result<Vec<Value>, RuntimeError> {
        if self.stack.len() < n {
            return Err(RuntimeError::StackUnderflow { instr });
        }
        let slots = self.stack.split_off(self.stack.len() - n);
        Ok(slots.into_iter().map(Slot::into_value).collect())
    }

    /// Jump when the top value's truthiness equals `when`, keeping it;
    /// otherwise drop it
    fn short_circuit(
        &mut self,
        when: bool,
        target: usize,
        instr: &'static str,
    ) -> Result<(), RuntimeError> {
        let top = self
            .stack
            .last()
            .ok_or(RuntimeError::StackUnderflow { instr })?;
        if top.is_truthy() == when {
            self.pc = target;
        } else {
            self.stack.pop();
        }
        Ok(())
    }

    async fn step(&mut self, instr: &Instr) -> Result<(), RuntimeError> {
        match instr {
            Instr::Text(text) => self.state.current().push_sql(text),
            Instr::Const(value) => self.stack.push(Slot::Data(value.clone())),
            Instr::Load(name) => {
                let value = match self.state.lookup(name) {
                    Some(value) => value,
                    None if self.options.strict_variables => {
                        return Err(RuntimeError::UndefinedVariable(name.clone()))
                    }
                    None => Slot::Data(Value::Null),
                };
                self.stack.push(value);
            }
            Instr::Attr(attr) => {
                let target = self.pop("attr")?.into_value();
                let value = match target {
                    Value::Object(mut map) => map.remove(attr).unwrap_or(Value::Null),
                    _ => Value::Null,
                };
                self.stack.push(Slot::Data(value));
            }
            Instr::Not => {
                let value = self.pop("not")?;
                self.stack.push(Slot::Data(Value::Bool(!value.is_truthy())));
            }
            Instr::Binary(op) => {
                let rhs = self.pop("binop")?;
                let lhs = self.pop("binop")?;
                self.stack.push(binary(*op, lhs, rhs));
            }
            Instr::Filter(op) => self.filter(op, false).await?,
            Instr::AwaitFilter(op) => self.filter(op, true).await?,
            Instr::Emit => {
                let value = self.pop("emit")?;
                let out = self.state.current();
                match value {
                    Slot::Builder(sub) => out.append(sub),
                    Slot::Data(value) => out.bind(value),
                }
            }
            Instr::Set(name) => {
                let value = self.pop("set")?;
                self.state.set(name.clone(), value);
            }
            Instr::Jump(target) => self.pc = *target,
            Instr::JumpIfFalse(target) => {
                let cond = self.pop("jump_if_false")?;
                if !cond.is_truthy() {
                    self.pc = *target;
                }
            }
            Instr::JumpIfFalseOrPop(target) => {
                self.short_circuit(false, *target, "jump_if_false_or_pop")?
            }
            Instr::JumpIfTrueOrPop(target) => {
                self.short_circuit(true, *target, "jump_if_true_or_pop")?
            }
            Instr::IterStart => {
                let iterable = self.pop("iter_start")?.into_value();
                let items = match iterable {
                    Value::Array(items) => items,
                    Value::Object(map) => map.into_iter().map(|(key, _)| Value::String(key)).collect(),
                    Value::Null => Vec::new(),
                    other => return Err(RuntimeError::NotIterable(type_name(&other))),
                };
                self.loops.push(LoopState { items, next: 0 });
                self.state.scopes.push(HashMap::new());
            }
            Instr::IterNext(op) => self.iter_next(op)?,
            Instr::Capture => self.state.nested.push(QueryBuilder::new()),
            Instr::CallTag(op) => self.call_tag(op).await?,
            Instr::Export => {
                if self.state.exported.is_none() {
                    self.state.exported = Some(std::mem::take(&mut self.state.main));
                }
            }
        }
        Ok(())
    }

    async fn filter(&mut self, op: &FilterOp, awaited: bool) -> Result<(), RuntimeError> {
        let args = self.pop_values(op.argc, "filter")?;
        let value = self.pop("filter")?.into_value();
        let filter = self
            .runtime
            .filter(&op.name)
            .ok_or_else(|| RuntimeError::UnknownFilter(op.name.clone()))?;
        if filter.is_async && !awaited {
            return Err(RuntimeError::UnawaitedFilter(op.name.clone()));
        }
        let result = filter.runner.transform(value, args).await?;
        self.stack.push(Slot::Data(result));
        Ok(())
    }

    fn iter_next(&mut self, op: &IterOp) -> Result<(), RuntimeError> {
        let Some(state) = self.loops.last_mut() else {
            return Err(RuntimeError::StackUnderflow { instr: "iter_next" });
        };
        if state.next >= state.items.len() {
            self.loops.pop();
            self.state.scopes.pop();
            self.pc = op.exit;
            return Ok(());
        }

        let index = state.next;
        let length = state.items.len();
        let item = state.items[index].clone();
        state.next += 1;

        self.state.set(op.var.clone(), Slot::Data(item));
        self.state.set(
            "loop".to_string(),
            Slot::Data(json!({
                "index": index + 1,
                "index0": index,
                "first": index == 0,
                "last": index + 1 == length,
                "length": length,
            })),
        );
        Ok(())
    }

    async fn call_tag(&mut self, op: &TagOp) -> Result<(), RuntimeError> {
        let kw_values = self.pop_values(op.kwargs.len(), "call_tag")?;
        let args = self.pop_values(op.argc, "call_tag")?;
        let body = if op.body {
            let body = self
                .state
                .nested
                .pop()
                .ok_or(RuntimeError::MissingCapture { instr: "call_tag" })?;
            Some(body)
        } else {
            None
        };

        let runner = self
            .runtime
            .tag(&op.name)
            .cloned()
            .ok_or_else(|| RuntimeError::UnknownTag(op.name.clone()))?;

        let kwargs = op.kwargs.iter().cloned().zip(kw_values).collect();
        let mut ctx = TagContext {
            args,
            kwargs,
            body,
            state: &mut self.state,
        };
        runner.run(&mut ctx).await?;
        Ok(())
    }
}

/// Template truthiness: null, false, zero and empty containers are false
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn equals(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(_), Value::Number(_)) => compare(lhs, rhs) == Some(Ordering::Equal),
        _ => lhs == rhs,
    }
}

/// `and`/`or` yield one of their operands unchanged
fn binary(op: BinaryOp, lhs: Slot, rhs: Slot) -> Slot {
    match op {
        BinaryOp::And if lhs.is_truthy() => rhs,
        BinaryOp::And => lhs,
        BinaryOp::Or if lhs.is_truthy() => lhs,
        BinaryOp::Or => rhs,
        op => Slot::Data(Value::Bool(relation(op, &lhs.into_value(), &rhs.into_value()))),
    }
}

fn relation(op: BinaryOp, lhs: &Value, rhs: &Value) -> bool {
    let ordered = |want: fn(Ordering) -> bool| compare(lhs, rhs).is_some_and(want);
    match op {
        BinaryOp::Eq => equals(lhs, rhs),
        BinaryOp::NotEq => !equals(lhs, rhs),
        BinaryOp::Less => ordered(Ordering::is_lt),
        BinaryOp::LessEq => ordered(Ordering::is_le),
        BinaryOp::Greater => ordered(Ordering::is_gt),
        BinaryOp::GreaterEq => ordered(Ordering::is_ge),
        // Logical operators pick an operand in `binary`
        BinaryOp::And | BinaryOp::Or => false,
    }
}
