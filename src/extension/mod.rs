//! Extension model: custom tags and filters in two phases
//!
//! Compile-time extensions teach the parser new tags, announce filters (and
//! whether they are asynchronous) and may inspect the tree to contribute
//! metadata. Runtime extensions carry the real tag handlers and filter
//! transforms used while executing compiled code.
//!
//! # Example
//!
//! ```text
//! {% req "users" main=true %}
//!   SELECT * FROM users WHERE id = {{ id | required }}
//! {% endreq %}
//! ```

mod environment;
mod registry;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::error::ConfigurationError;
use crate::parser::{AstNode, NodeKind, TagGrammar};
use crate::runtime::TagContext;

pub use environment::{CompileTimeEnvironment, CompileTimeFilter, RuntimeEnvironment, RuntimeFilter};
pub use registry::{load_extensions, Environments, ExtensionRegistry};

/// When an extension takes part in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Phase {
    CompileTime,
    Runtime,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::CompileTime => write!(f, "compile-time"),
            Phase::Runtime => write!(f, "runtime"),
        }
    }
}

impl FromStr for Phase {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "compile-time" => Ok(Phase::CompileTime),
            "runtime" => Ok(Phase::Runtime),
            other => Err(ConfigurationError::InvalidPhase(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExtensionKind {
    Tag,
    Filter,
}

impl fmt::Display for ExtensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtensionKind::Tag => write!(f, "tag"),
            ExtensionKind::Filter => write!(f, "filter"),
        }
    }
}

impl FromStr for ExtensionKind {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tag" => Ok(ExtensionKind::Tag),
            "filter" => Ok(ExtensionKind::Filter),
            other => Err(ConfigurationError::InvalidKind(other.to_string())),
        }
    }
}

/// Declarative extension reference, as written in configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExtensionDecl {
    pub phase: String,
    pub kind: String,
    pub name: String,
}

impl ExtensionDecl {
    pub fn new(phase: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Validate the phase and kind strings
    pub fn resolve(&self) -> Result<(Phase, ExtensionKind), ConfigurationError> {
        Ok((self.phase.parse()?, self.kind.parse()?))
    }
}

/// Optional compile-time capabilities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub ast_visit: bool,
    pub provide_metadata: bool,
}

impl Capabilities {
    pub const NONE: Capabilities = Capabilities {
        ast_visit: false,
        provide_metadata: false,
    };

    pub const ALL: Capabilities = Capabilities {
        ast_visit: true,
        provide_metadata: true,
    };

    pub fn any(self) -> bool {
        self.ast_visit || self.provide_metadata
    }
}

/// One keyed entry of the compilation metadata
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataContribution {
    pub key: String,
    pub value: Value,
}

impl MetadataContribution {
    pub fn new(key: impl Into<String>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Per-compilation state of an extension with capabilities.
///
/// A fresh instance is created for every compilation, so accumulated state
/// never leaks between templates.
pub trait CompilationHooks: Send {
    /// Node kinds this visitor wants to see
    fn interested_in(&self, _kind: NodeKind) -> bool {
        true
    }

    fn on_ast_visit(&mut self, _node: AstNode<'_>) {}

    fn provide_metadata(&self) -> Option<MetadataContribution> {
        None
    }
}

struct NoHooks;

impl CompilationHooks for NoHooks {}

/// Shared surface of compile-time extensions
pub trait CompileTimeHooks: Send + Sync {
    fn capabilities(&self) -> Capabilities {
        Capabilities::NONE
    }

    fn begin_compilation(&self) -> Box<dyn CompilationHooks> {
        Box::new(NoHooks)
    }
}

/// Compile-time tag: contributes the tag's grammar
pub trait TagBuilder: CompileTimeHooks {
    fn name(&self) -> &str;

    fn grammar(&self) -> TagGrammar {
        TagGrammar::inline(self.name())
    }
}

/// Compile-time filter: announces a filter and its asynchrony
pub trait FilterBuilder: CompileTimeHooks {
    fn name(&self) -> &str;

    fn is_async(&self) -> bool {
        false
    }
}

/// Errors raised by extension code at runtime
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExtensionError {
    /// Error deliberately raised by a template, e.g. `{% error "CODE" %}`
    #[error("template raised error {code}")]
    Raised { code: String },

    #[error("{extension}: {message}")]
    InvalidArgument { extension: String, message: String },

    #[error("{extension} failed: {message}")]
    Failed { extension: String, message: String },
}

impl ExtensionError {
    pub fn invalid_argument(extension: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            extension: extension.into(),
            message: message.into(),
        }
    }

    pub fn failed(extension: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            extension: extension.into(),
            message: message.into(),
        }
    }
}

/// Runtime tag handler
#[async_trait]
pub trait TagRunner: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, ctx: &mut TagContext<'_>) -> Result<(), ExtensionError>;
}

/// Runtime filter transform
#[async_trait]
pub trait FilterRunner: Send + Sync {
    fn name(&self) -> &str;

    /// Asynchronous filters must be awaited by compiled code
    fn is_async(&self) -> bool {
        false
    }

    async fn transform(&self, value: Value, args: Vec<Value>) -> Result<Value, ExtensionError>;
}

/// A loadable extension: a closed set of phase x kind variants
#[derive(Clone)]
pub enum Extension {
    TagBuilder(Arc<dyn TagBuilder>),
    FilterBuilder(Arc<dyn FilterBuilder>),
    TagRunner(Arc<dyn TagRunner>),
    FilterRunner(Arc<dyn FilterRunner>),
}

impl Extension {
    pub fn tag_builder(ext: impl TagBuilder + 'static) -> Self {
        Self::TagBuilder(Arc::new(ext))
    }

    pub fn filter_builder(ext: impl FilterBuilder + 'static) -> Self {
        Self::FilterBuilder(Arc::new(ext))
    }

    pub fn tag_runner(ext: impl TagRunner + 'static) -> Self {
        Self::TagRunner(Arc::new(ext))
    }

    pub fn filter_runner(ext: impl FilterRunner + 'static) -> Self {
        Self::FilterRunner(Arc::new(ext))
    }

    pub fn phase(&self) -> Phase {
        match self {
            Extension::TagBuilder(_) | Extension::FilterBuilder(_) => Phase::CompileTime,
            Extension::TagRunner(_) | Extension::FilterRunner(_) => Phase::Runtime,
        }
    }

    pub fn kind(&self) -> ExtensionKind {
        match self {
            Extension::TagBuilder(_) | Extension::TagRunner(_) => ExtensionKind::Tag,
            Extension::FilterBuilder(_) | Extension::FilterRunner(_) => ExtensionKind::Filter,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Extension::TagBuilder(ext) => ext.name(),
            Extension::FilterBuilder(ext) => ext.name(),
            Extension::TagRunner(ext) => ext.name(),
            Extension::FilterRunner(ext) => ext.name(),
        }
    }

    /// Capabilities declared by compile-time extensions; runtime ones have none
    pub fn capabilities(&self) -> Capabilities {
        match self {
            Extension::TagBuilder(ext) => ext.capabilities(),
            Extension::FilterBuilder(ext) => ext.capabilities(),
            Extension::TagRunner(_) | Extension::FilterRunner(_) => Capabilities::NONE,
        }
    }

    /// Fresh per-compilation hooks, for compile-time extensions
    pub fn begin_compilation(&self) -> Option<Box<dyn CompilationHooks>> {
        match self {
            Extension::TagBuilder(ext) => Some(ext.begin_compilation()),
            Extension::FilterBuilder(ext) => Some(ext.begin_compilation()),
            Extension::TagRunner(_) | Extension::FilterRunner(_) => None,
        }
    }

    pub fn implements_ast_visit(&self) -> bool {
        self.capabilities().ast_visit
    }

    pub fn implements_provide_metadata(&self) -> bool {
        self.capabilities().provide_metadata
    }

    /// Whether this extension matches a declarative reference
    pub fn matches(&self, phase: Phase, kind: ExtensionKind, name: &str) -> bool {
        self.phase() == phase && self.kind() == kind && self.name() == name
    }
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extension")
            .field("phase", &self.phase())
            .field("kind", &self.kind())
            .field("name", &self.name())
            .finish()
    }
}
