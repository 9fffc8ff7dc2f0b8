//! Engine configuration
//!
//! Configuration is read from TOML:
//!
//! ```toml
//! strict_variables = true
//!
//! [[extensions]]
//! phase = "compile-time"
//! kind = "tag"
//! name = "req"
//!
//! [[extensions]]
//! phase = "runtime"
//! kind = "tag"
//! name = "req"
//! ```
//!
//! Without an `extensions` list every built-in extension is loaded.

use std::path::Path;

use serde::Deserialize;

use crate::builtins;
use crate::error::ConfigurationError;
use crate::extension::{Extension, ExtensionDecl};
use crate::runtime::RunOptions;

/// Settings for building an [`Engine`](crate::Engine)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineConfig {
    /// Referencing an undefined variable fails the execution
    pub strict_variables: bool,
    /// Built-in extensions to load; None loads all of them
    pub extensions: Option<Vec<ExtensionDecl>>,
}

/// TOML structure for deserializing engine configuration
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct TomlConfig {
    #[serde(default)]
    strict_variables: bool,
    extensions: Option<Vec<ExtensionDecl>>,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigurationError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigurationError> {
        let parsed: TomlConfig = toml::from_str(content)?;
        Ok(EngineConfig {
            strict_variables: parsed.strict_variables,
            extensions: parsed.extensions,
        })
    }

    pub fn with_strict_variables(mut self, strict: bool) -> Self {
        self.strict_variables = strict;
        self
    }

    pub fn with_extensions(mut self, extensions: Vec<ExtensionDecl>) -> Self {
        self.extensions = Some(extensions);
        self
    }

    /// Resolve the configured extensions against the built-in catalog
    pub fn resolve_extensions(&self) -> Result<Vec<Extension>, ConfigurationError> {
        match &self.extensions {
            Some(decls) => builtins::select(decls),
            None => Ok(builtins::catalog()),
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            strict_variables: self.strict_variables,
        }
    }
}
