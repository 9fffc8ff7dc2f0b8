//! Compile-time and runtime environments
//!
//! Both are filled once by the extension registry and are read-only
//! afterwards, so they can be shared between threads without locking.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::parser::{TagGrammar, TagGrammars};

use super::{FilterRunner, TagRunner};

/// Filter as seen at compile time: only its asynchrony matters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileTimeFilter {
    pub is_async: bool,
}

/// Registration context used while parsing, preprocessing and generating code
#[derive(Debug, Clone, Default)]
pub struct CompileTimeEnvironment {
    tags: BTreeMap<String, TagGrammar>,
    filters: BTreeMap<String, CompileTimeFilter>,
}

impl CompileTimeEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_tag(&mut self, grammar: TagGrammar) {
        self.tags.insert(grammar.name.clone(), grammar);
    }

    pub(crate) fn add_filter(&mut self, name: &str, is_async: bool) {
        self.filters
            .insert(name.to_string(), CompileTimeFilter { is_async });
    }

    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.contains_key(name)
    }

    pub fn filter(&self, name: &str) -> Option<CompileTimeFilter> {
        self.filters.get(name).copied()
    }

    /// Names of all filters flagged asynchronous
    pub fn async_filters(&self) -> BTreeSet<String> {
        self.filters
            .iter()
            .filter(|(_, f)| f.is_async)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn tag_names(&self) -> impl Iterator<Item = &str> {
        self.tags.keys().map(|s| s.as_str())
    }
}

impl TagGrammars for CompileTimeEnvironment {
    fn tag_grammar(&self, name: &str) -> Option<&TagGrammar> {
        self.tags.get(name)
    }
}

/// Filter as seen at runtime: the bound transform and its asynchrony
#[derive(Clone)]
pub struct RuntimeFilter {
    pub runner: Arc<dyn FilterRunner>,
    pub is_async: bool,
}

/// Registration context used when executing compiled code
#[derive(Clone, Default)]
pub struct RuntimeEnvironment {
    tags: HashMap<String, Arc<dyn TagRunner>>,
    filters: HashMap<String, RuntimeFilter>,
}

impl RuntimeEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_tag(&mut self, runner: Arc<dyn TagRunner>) {
        self.tags.insert(runner.name().to_string(), runner);
    }

    pub(crate) fn add_filter(&mut self, runner: Arc<dyn FilterRunner>) {
        let is_async = runner.is_async();
        self.filters
            .insert(runner.name().to_string(), RuntimeFilter { runner, is_async });
    }

    pub fn tag(&self, name: &str) -> Option<&Arc<dyn TagRunner>> {
        self.tags.get(name)
    }

    pub fn filter(&self, name: &str) -> Option<&RuntimeFilter> {
        self.filters.get(name)
    }

    pub fn has_tag(&self, name: &str) -> bool {
        self.tags.contains_key(name)
    }

    pub fn has_filter(&self, name: &str) -> bool {
        self.filters.contains_key(name)
    }

    /// Names of all runners that return futures needing an await
    pub fn async_filters(&self) -> BTreeSet<String> {
        self.filters
            .iter()
            .filter(|(_, f)| f.is_async)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl std::fmt::Debug for RuntimeEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut tags: Vec<_> = self.tags.keys().collect();
        tags.sort();
        let mut filters: Vec<_> = self.filters.keys().collect();
        filters.sort();
        f.debug_struct("RuntimeEnvironment")
            .field("tags", &tags)
            .field("filters", &filters)
            .finish()
    }
}
