//! Abstract Syntax Tree types for sqlweave templates

use serde_json::Value;

/// Byte range in source text
pub type Span = std::ops::Range<usize>;

/// AST node with source location
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<T> {
    pub node: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Self { node, span }
    }
}

/// Valid identifier (alphanumeric + underscore, starts with letter/_)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Identifier(pub String);

impl Identifier {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Root AST node - a complete template
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Template {
    pub body: Vec<Spanned<Node>>,
}

/// Structural template node
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Raw text copied into the query
    Text(String),
    /// Output expression: `{{ expr }}`
    Output(Spanned<Expr>),
    /// Conditional: `{% if %} ... {% elif %} ... {% else %} ... {% endif %}`
    If(IfBlock),
    /// Loop: `{% for x in items %} ... {% endfor %}`
    For(ForBlock),
    /// Assignment: `{% set x = expr %}`
    Set(SetStmt),
    /// Extension tag: `{% name args %}` with an optional body
    Tag(TagCall),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfBlock {
    /// `if` and `elif` arms, in source order
    pub branches: Vec<Branch>,
    pub otherwise: Option<Vec<Spanned<Node>>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub condition: Spanned<Expr>,
    pub body: Vec<Spanned<Node>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForBlock {
    pub variable: Spanned<Identifier>,
    pub iterable: Spanned<Expr>,
    pub body: Vec<Spanned<Node>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetStmt {
    pub target: Spanned<Identifier>,
    pub value: Spanned<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TagCall {
    pub name: Spanned<Identifier>,
    pub args: Vec<TagArg>,
    /// Present only for block tags
    pub body: Option<Vec<Spanned<Node>>>,
}

impl TagCall {
    pub fn positional(&self) -> impl Iterator<Item = &Spanned<Expr>> {
        self.args.iter().filter_map(|arg| match arg {
            TagArg::Positional(expr) => Some(expr),
            TagArg::Keyword { .. } => None,
        })
    }

    pub fn keyword(&self, key: &str) -> Option<&Spanned<Expr>> {
        self.args.iter().find_map(|arg| match arg {
            TagArg::Keyword { key: k, value } if k.node.as_str() == key => Some(value),
            _ => None,
        })
    }
}

/// Tag argument: `expr` or `key=expr`
#[derive(Debug, Clone, PartialEq)]
pub enum TagArg {
    Positional(Spanned<Expr>),
    Keyword {
        key: Spanned<Identifier>,
        value: Spanned<Expr>,
    },
}

impl TagArg {
    pub fn value(&self) -> &Spanned<Expr> {
        match self {
            TagArg::Positional(expr) => expr,
            TagArg::Keyword { value, .. } => value,
        }
    }
}

/// Expression node
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Literal),
    Variable(Identifier),
    /// `target.attr`
    Attribute {
        target: Box<Spanned<Expr>>,
        attr: Identifier,
    },
    /// `target | name(args)`
    Filter(FilterCall),
    /// Filter application whose result must be awaited before use.
    /// Produced by the preprocessor, never by the parser.
    AwaitFilter(FilterCall),
    Not(Box<Spanned<Expr>>),
    Binary {
        op: BinaryOp,
        lhs: Box<Spanned<Expr>>,
        rhs: Box<Spanned<Expr>>,
    },
}

impl Expr {
    /// Dotted variable path for `a`, `a.b.c`; None for anything else
    pub fn as_path(&self) -> Option<String> {
        match self {
            Expr::Variable(id) => Some(id.0.clone()),
            Expr::Attribute { target, attr } => target
                .node
                .as_path()
                .map(|base| format!("{}.{}", base, attr)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterCall {
    pub target: Box<Spanned<Expr>>,
    pub name: Spanned<Identifier>,
    pub args: Vec<Spanned<Expr>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Literal {
    pub fn to_value(&self) -> Value {
        match self {
            Literal::Null => Value::Null,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(n) => Value::from(*n),
            Literal::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Literal::String(s) => Value::String(s.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    And,
    Or,
}

impl BinaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Less => "<",
            BinaryOp::LessEq => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterEq => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::NotEq,
            "<" => BinaryOp::Less,
            "<=" => BinaryOp::LessEq,
            ">" => BinaryOp::Greater,
            ">=" => BinaryOp::GreaterEq,
            "and" => BinaryOp::And,
            "or" => BinaryOp::Or,
            _ => return None,
        })
    }
}

/// Discriminant of every node and expression, used by visitors to declare interest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Text,
    Output,
    If,
    For,
    Set,
    Tag,
    Literal,
    Variable,
    Attribute,
    Filter,
    AwaitFilter,
    Not,
    Binary,
}

/// Borrowed view of any tree element handed to visitors
#[derive(Debug, Clone, Copy)]
pub enum AstNode<'a> {
    Node(&'a Spanned<Node>),
    Expr(&'a Spanned<Expr>),
}

impl AstNode<'_> {
    pub fn kind(&self) -> NodeKind {
        match self {
            AstNode::Node(n) => match &n.node {
                Node::Text(_) => NodeKind::Text,
                Node::Output(_) => NodeKind::Output,
                Node::If(_) => NodeKind::If,
                Node::For(_) => NodeKind::For,
                Node::Set(_) => NodeKind::Set,
                Node::Tag(_) => NodeKind::Tag,
            },
            AstNode::Expr(e) => match &e.node {
                Expr::Literal(_) => NodeKind::Literal,
                Expr::Variable(_) => NodeKind::Variable,
                Expr::Attribute { .. } => NodeKind::Attribute,
                Expr::Filter(_) => NodeKind::Filter,
                Expr::AwaitFilter(_) => NodeKind::AwaitFilter,
                Expr::Not(_) => NodeKind::Not,
                Expr::Binary { .. } => NodeKind::Binary,
            },
        }
    }

    pub fn span(&self) -> &Span {
        match self {
            AstNode::Node(n) => &n.span,
            AstNode::Expr(e) => &e.span,
        }
    }
}
