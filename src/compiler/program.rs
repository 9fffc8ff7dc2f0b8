//! Compiled program: instruction set and its text form
//!
//! Compiled code is a line-oriented listing framed by `program v1` and
//! `end`. Each line holds a mnemonic and an optional JSON operand:
//!
//! ```text
//! program v1
//! text "SELECT * FROM t WHERE id = "
//! load "id"
//! emit
//! export
//! end
//! ```
//!
//! Jump targets are zero-based instruction indices.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::parser::BinaryOp;

const HEADER: &str = "program v1";
const FOOTER: &str = "end";

/// Errors decoding compiled code
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodeError {
    #[error("compiled code does not start with '{HEADER}'")]
    MissingHeader,

    #[error("compiled code does not end with '{FOOTER}'")]
    MissingFooter,

    #[error("line {line}: unknown instruction '{mnemonic}'")]
    UnknownInstruction { line: usize, mnemonic: String },

    #[error("line {line}: {message}")]
    InvalidOperand { line: usize, message: String },

    #[error("jump target {target} out of bounds (program length {len})")]
    JumpOutOfBounds { target: usize, len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOp {
    pub name: String,
    pub argc: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterOp {
    pub var: String,
    pub exit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagOp {
    pub name: String,
    /// Positional argument count
    pub argc: usize,
    /// Keyword argument names, values pushed after the positional ones
    pub kwargs: Vec<String>,
    /// Whether a captured body sits on the output stack
    pub body: bool,
}

/// One stack-machine instruction
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    /// Append raw text to the current builder
    Text(String),
    /// Push a constant
    Const(Value),
    /// Push a variable from scope
    Load(String),
    /// Replace the top value with one of its attributes
    Attr(String),
    Not,
    Binary(BinaryOp),
    /// Apply a synchronous filter to `argc` args and the value beneath them
    Filter(FilterOp),
    /// Apply an asynchronous filter and await its result
    AwaitFilter(FilterOp),
    /// Bind the top value as a query parameter
    Emit,
    /// Pop into a variable of the innermost scope
    Set(String),
    Jump(usize),
    JumpIfFalse(usize),
    /// `and`: keep a falsy top value and jump, else pop it and continue
    JumpIfFalseOrPop(usize),
    /// `or`: keep a truthy top value and jump, else pop it and continue
    JumpIfTrueOrPop(usize),
    /// Pop an iterable and open a loop scope
    IterStart,
    /// Bind the next item or close the loop and jump to `exit`
    IterNext(IterOp),
    /// Open a nested builder collecting a tag body
    Capture,
    CallTag(TagOp),
    /// Export the main builder unless one was already exported
    Export,
}

impl Instr {
    fn mnemonic(&self) -> &'static str {
        match self {
            Instr::Text(_) => "text",
            Instr::Const(_) => "const",
            Instr::Load(_) => "load",
            Instr::Attr(_) => "attr",
            Instr::Not => "not",
            Instr::Binary(_) => "binop",
            Instr::Filter(_) => "filter",
            Instr::AwaitFilter(_) => "await_filter",
            Instr::Emit => "emit",
            Instr::Set(_) => "set",
            Instr::Jump(_) => "jump",
            Instr::JumpIfFalse(_) => "jump_if_false",
            Instr::JumpIfFalseOrPop(_) => "jump_if_false_or_pop",
            Instr::JumpIfTrueOrPop(_) => "jump_if_true_or_pop",
            Instr::IterStart => "iter_start",
            Instr::IterNext(_) => "iter_next",
            Instr::Capture => "capture",
            Instr::CallTag(_) => "call_tag",
            Instr::Export => "export",
        }
    }

    fn operand(&self) -> Option<String> {
        match self {
            Instr::Text(s) | Instr::Load(s) | Instr::Attr(s) | Instr::Set(s) => Some(json(s)),
            Instr::Const(v) => Some(json(v)),
            Instr::Binary(op) => Some(json(&op.as_str())),
            Instr::Filter(op) | Instr::AwaitFilter(op) => Some(json(op)),
            Instr::Jump(t)
            | Instr::JumpIfFalse(t)
            | Instr::JumpIfFalseOrPop(t)
            | Instr::JumpIfTrueOrPop(t) => Some(t.to_string()),
            Instr::IterNext(op) => Some(json(op)),
            Instr::CallTag(op) => Some(json(op)),
            Instr::Not | Instr::Emit | Instr::IterStart | Instr::Capture | Instr::Export => None,
        }
    }

    fn decode(line_no: usize, line: &str) -> Result<Instr, CodeError> {
        let (mnemonic, operand) = match line.split_once(' ') {
            Some((m, rest)) => (m, Some(rest)),
            None => (line, None),
        };

        let invalid = |message: String| CodeError::InvalidOperand {
            line: line_no,
            message,
        };
        let operand_of = |name: &str| {
            operand.ok_or_else(|| invalid(format!("'{}' requires an operand", name)))
        };
        fn parse<T: for<'de> Deserialize<'de>>(raw: &str) -> Result<T, String> {
            serde_json::from_str(raw).map_err(|e| e.to_string())
        }

        let instr = match mnemonic {
            "text" => Instr::Text(parse(operand_of(mnemonic)?).map_err(invalid)?),
            "const" => Instr::Const(parse(operand_of(mnemonic)?).map_err(invalid)?),
            "load" => Instr::Load(parse(operand_of(mnemonic)?).map_err(invalid)?),
            "attr" => Instr::Attr(parse(operand_of(mnemonic)?).map_err(invalid)?),
            "set" => Instr::Set(parse(operand_of(mnemonic)?).map_err(invalid)?),
            "binop" => {
                let raw: String = parse(operand_of(mnemonic)?).map_err(invalid)?;
                let op = BinaryOp::from_str(&raw)
                    .ok_or_else(|| invalid(format!("unknown operator '{}'", raw)))?;
                Instr::Binary(op)
            }
            "filter" => Instr::Filter(parse(operand_of(mnemonic)?).map_err(invalid)?),
            "await_filter" => Instr::AwaitFilter(parse(operand_of(mnemonic)?).map_err(invalid)?),
            "jump" => Instr::Jump(parse(operand_of(mnemonic)?).map_err(invalid)?),
            "jump_if_false" => Instr::JumpIfFalse(parse(operand_of(mnemonic)?).map_err(invalid)?),
            "jump_if_false_or_pop" => {
                Instr::JumpIfFalseOrPop(parse(operand_of(mnemonic)?).map_err(invalid)?)
            }
            "jump_if_true_or_pop" => {
                Instr::JumpIfTrueOrPop(parse(operand_of(mnemonic)?).map_err(invalid)?)
            }
            "iter_next" => Instr::IterNext(parse(operand_of(mnemonic)?).map_err(invalid)?),
            "call_tag" => Instr::CallTag(parse(operand_of(mnemonic)?).map_err(invalid)?),
            "not" => Instr::Not,
            "emit" => Instr::Emit,
            "iter_start" => Instr::IterStart,
            "capture" => Instr::Capture,
            "export" => Instr::Export,
            other => {
                return Err(CodeError::UnknownInstruction {
                    line: line_no,
                    mnemonic: other.to_string(),
                })
            }
        };
        Ok(instr)
    }

    fn jump_target(&self) -> Option<usize> {
        match self {
            Instr::Jump(t)
            | Instr::JumpIfFalse(t)
            | Instr::JumpIfFalseOrPop(t)
            | Instr::JumpIfTrueOrPop(t) => Some(*t),
            Instr::IterNext(op) => Some(op.exit),
            _ => None,
        }
    }
}

fn json<T: Serialize + ?Sized>(value: &T) -> String {
    // Operands are strings, JSON values and plain structs, which always serialize
    serde_json::to_string(value).unwrap_or_else(|_| "null".to_string())
}

/// A decoded compiled template
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub instrs: Vec<Instr>,
}

impl Program {
    pub fn new(instrs: Vec<Instr>) -> Self {
        Self { instrs }
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    /// Render as compiled code text
    pub fn to_code(&self) -> String {
        let mut code = String::from(HEADER);
        code.push('\n');
        for instr in &self.instrs {
            code.push_str(instr.mnemonic());
            if let Some(operand) = instr.operand() {
                code.push(' ');
                code.push_str(&operand);
            }
            code.push('\n');
        }
        code.push_str(FOOTER);
        code.push('\n');
        code
    }

    /// Decode compiled code text
    pub fn from_code(code: &str) -> Result<Self, CodeError> {
        let mut lines = code.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());

        match lines.next() {
            Some((_, line)) if line.trim() == HEADER => {}
            _ => return Err(CodeError::MissingHeader),
        }

        let mut instrs = Vec::new();
        let mut closed = false;
        for (idx, line) in lines {
            let line = line.trim();
            if closed {
                return Err(CodeError::MissingFooter);
            }
            if line == FOOTER {
                closed = true;
                continue;
            }
            instrs.push(Instr::decode(idx + 1, line)?);
        }
        if !closed {
            return Err(CodeError::MissingFooter);
        }

        let len = instrs.len();
        if let Some(target) = instrs
            .iter()
            .filter_map(Instr::jump_target)
            .find(|&t| t > len)
        {
            return Err(CodeError::JumpOutOfBounds { target, len });
        }

        Ok(Self { instrs })
    }
}
