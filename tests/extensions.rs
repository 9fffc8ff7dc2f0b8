//! Extension loading, visitor and metadata tests

use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use sqlweave::extension::{
    Capabilities, CompilationHooks, CompileTimeHooks, ExtensionKind, FilterBuilder,
    MetadataContribution, Phase, TagBuilder,
};
use sqlweave::parser::{AstNode, Expr, NodeKind};
use sqlweave::{builtins, load_extensions, Compiler, ConfigurationError, Engine, Extension};

/// Counts variable references and reports them under a configurable key
struct VariableCounter {
    name: &'static str,
    key: &'static str,
}

impl CompileTimeHooks for VariableCounter {
    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    fn begin_compilation(&self) -> Box<dyn CompilationHooks> {
        Box::new(CountState {
            key: self.key,
            count: 0,
        })
    }
}

impl FilterBuilder for VariableCounter {
    fn name(&self) -> &str {
        self.name
    }
}

struct CountState {
    key: &'static str,
    count: usize,
}

impl CompilationHooks for CountState {
    fn interested_in(&self, kind: NodeKind) -> bool {
        kind == NodeKind::Variable
    }

    fn on_ast_visit(&mut self, _node: AstNode<'_>) {
        self.count += 1;
    }

    fn provide_metadata(&self) -> Option<MetadataContribution> {
        Some(MetadataContribution::new(self.key, json!(self.count)))
    }
}

/// Records the order in which visitors see variables
struct OrderProbe {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl CompileTimeHooks for OrderProbe {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            ast_visit: true,
            provide_metadata: false,
        }
    }

    fn begin_compilation(&self) -> Box<dyn CompilationHooks> {
        Box::new(OrderProbeState {
            name: self.name,
            log: self.log.clone(),
        })
    }
}

impl TagBuilder for OrderProbe {
    fn name(&self) -> &str {
        self.name
    }
}

struct OrderProbeState {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

impl CompilationHooks for OrderProbeState {
    fn interested_in(&self, kind: NodeKind) -> bool {
        kind == NodeKind::Variable
    }

    fn on_ast_visit(&mut self, node: AstNode<'_>) {
        if let AstNode::Expr(expr) = node {
            if let Expr::Variable(id) = &expr.node {
                self.log
                    .lock()
                    .unwrap()
                    .push(format!("{}:{}", self.name, id));
            }
        }
    }
}

fn compiler_with(extensions: Vec<Extension>) -> Compiler {
    Compiler::new(load_extensions(extensions).expect("Should load"))
}

#[test]
fn test_metadata_union_of_disjoint_providers() {
    let source = "{{ a }}{{ b.c }}{% if d %}{% endif %}";
    let forward = compiler_with(vec![
        Extension::filter_builder(VariableCounter { name: "first", key: "vars.first" }),
        Extension::filter_builder(VariableCounter { name: "second", key: "vars.second" }),
    ]);
    let backward = compiler_with(vec![
        Extension::filter_builder(VariableCounter { name: "second", key: "vars.second" }),
        Extension::filter_builder(VariableCounter { name: "first", key: "vars.first" }),
    ]);

    let (_, forward) = forward.generate_ast(source).expect("Should compile");
    let (_, backward) = backward.generate_ast(source).expect("Should compile");
    assert_eq!(
        Value::Object(forward.clone()),
        json!({"vars.first": 3, "vars.second": 3})
    );
    assert_eq!(forward, backward);
}

#[test]
fn test_metadata_collision_last_registered_wins() {
    let compiler = compiler_with(vec![
        Extension::filter_builder(VariableCounter { name: "early", key: "shared" }),
        Extension::filter_builder(VariableCounter { name: "late", key: "shared" }),
    ]);
    let (_, metadata) = compiler.generate_ast("{{ a }}").expect("Should compile");
    assert_eq!(metadata.len(), 1);
    assert_eq!(metadata.get("shared"), Some(&json!(1)));
}

#[test]
fn test_visitors_run_in_registration_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let compiler = compiler_with(vec![
        Extension::tag_builder(OrderProbe { name: "zeta", log: log.clone() }),
        Extension::tag_builder(OrderProbe { name: "alpha", log: log.clone() }),
    ]);
    compiler.generate_ast("{{ x }}{{ y }}").expect("Should compile");
    assert_eq!(
        *log.lock().unwrap(),
        vec!["zeta:x", "alpha:x", "zeta:y", "alpha:y"]
    );
}

#[test]
fn test_visitor_state_is_per_compilation_across_threads() {
    let compiler = Arc::new(compiler_with(vec![Extension::filter_builder(VariableCounter {
        name: "count",
        key: "count",
    })]));

    let handles: Vec<_> = (1..=8usize)
        .map(|n| {
            let compiler = compiler.clone();
            std::thread::spawn(move || {
                let source = "{{ v }}".repeat(n);
                let (_, metadata) = compiler.generate_ast(&source).expect("Should compile");
                (n, metadata)
            })
        })
        .collect();

    for handle in handles {
        let (n, metadata) = handle.join().expect("Thread should not panic");
        assert_eq!(metadata.get("count"), Some(&json!(n)));
    }
}

#[test]
fn test_duplicate_extension_fails_before_engine_exists() {
    let mut extensions = builtins::catalog();
    extensions.push(Extension::tag_runner(builtins::RequestTagRunner));

    match Engine::new(extensions) {
        Err(ConfigurationError::Duplicate { phase, kind, name }) => {
            assert_eq!(phase, Phase::Runtime);
            assert_eq!(kind, ExtensionKind::Tag);
            assert_eq!(name, "req");
        }
        other => panic!("Expected duplicate error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_compile_time_only_tag_is_unresolved_at_codegen() {
    let compiler = compiler_with(vec![Extension::tag_builder(builtins::ErrorTagBuilder)]);
    let err = compiler
        .compile(r#"{% error "X" %}"#)
        .expect_err("Should fail");
    assert_eq!(err.unresolved_symbol(), Some("error"));
}

#[test]
fn test_keyword_names_rejected() {
    let result = load_extensions([Extension::filter_builder(VariableCounter {
        name: "not",
        key: "k",
    })]);
    assert!(matches!(result, Err(ConfigurationError::ReservedName(n)) if n == "not"));
}
