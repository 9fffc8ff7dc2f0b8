//! Extension registry: classifies extensions and fills both environments

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::ConfigurationError;

use super::{CompileTimeEnvironment, Extension, ExtensionKind, Phase, RuntimeEnvironment};

/// Words the template language claims for itself
const RESERVED: &[&str] = &[
    "if", "elif", "else", "endif", "for", "in", "endfor", "set", "and", "or", "not", "true",
    "false", "none", "null", "loop",
];

/// Registry for loading extensions
///
/// Extensions are loaded in order. The result of a successful load is an
/// immutable [`Environments`] value; a failed load yields nothing usable.
#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    compile_time: CompileTimeEnvironment,
    runtime: RuntimeEnvironment,
    seen: HashSet<(Phase, ExtensionKind, String)>,
    /// Compile-time extensions declaring capabilities, in registration order
    hooked: Vec<Extension>,
}

impl ExtensionRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one extension
    pub fn load_extension(&mut self, ext: Extension) -> Result<(), ConfigurationError> {
        let (phase, kind, name) = (ext.phase(), ext.kind(), ext.name().to_string());
        validate_name(kind, &name)?;

        let key = (phase, kind, name);
        if self.seen.contains(&key) {
            let (phase, kind, name) = key;
            return Err(ConfigurationError::Duplicate { phase, kind, name });
        }

        match &ext {
            // Compile time never executes tag bodies, it only needs to parse them
            Extension::TagBuilder(builder) => self.compile_time.add_tag(builder.grammar()),
            // No transform at compile time; the async flag drives preprocessing
            Extension::FilterBuilder(builder) => {
                self.compile_time.add_filter(builder.name(), builder.is_async())
            }
            Extension::TagRunner(runner) => self.runtime.add_tag(runner.clone()),
            Extension::FilterRunner(runner) => self.runtime.add_filter(runner.clone()),
        }

        if ext.capabilities().any() {
            self.hooked.push(ext.clone());
        }

        tracing::debug!(
            phase = %key.0,
            kind = %key.1,
            name = %key.2,
            ast_visit = ext.implements_ast_visit(),
            provide_metadata = ext.implements_provide_metadata(),
            "loaded extension"
        );
        self.seen.insert(key);
        Ok(())
    }

    /// Freeze the registry into shareable environments
    pub fn finish(self) -> Environments {
        Environments {
            compile_time: Arc::new(self.compile_time),
            runtime: Arc::new(self.runtime),
            hooked: self.hooked.into(),
        }
    }
}

fn validate_name(kind: ExtensionKind, name: &str) -> Result<(), ConfigurationError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(ConfigurationError::InvalidName(name.to_string()));
    }
    // `end<name>` closes block tags, so tags may not claim that prefix
    if RESERVED.contains(&name) || (kind == ExtensionKind::Tag && name.starts_with("end")) {
        return Err(ConfigurationError::ReservedName(name.to_string()));
    }
    Ok(())
}

/// Both environments plus the capability-bearing extensions, built once at startup
#[derive(Debug, Clone)]
pub struct Environments {
    pub compile_time: Arc<CompileTimeEnvironment>,
    pub runtime: Arc<RuntimeEnvironment>,
    hooked: Arc<[Extension]>,
}

impl Environments {
    /// Extensions implementing AST-visit, in registration order
    pub fn visitors(&self) -> impl Iterator<Item = &Extension> {
        self.hooked.iter().filter(|e| e.implements_ast_visit())
    }

    /// Extensions implementing metadata-provision, in registration order
    pub fn metadata_providers(&self) -> impl Iterator<Item = &Extension> {
        self.hooked.iter().filter(|e| e.implements_provide_metadata())
    }

    /// Every extension with at least one capability, in registration order
    pub(crate) fn hooked(&self) -> &[Extension] {
        &self.hooked
    }
}

/// Load a complete extension set into fresh environments.
///
/// All-or-nothing: the first configuration error aborts the whole load.
pub fn load_extensions(
    extensions: impl IntoIterator<Item = Extension>,
) -> Result<Environments, ConfigurationError> {
    let mut registry = ExtensionRegistry::new();
    for ext in extensions {
        registry.load_extension(ext)?;
    }
    Ok(registry.finish())
}
