//! Integration tests for parsing and compiling sqlweave templates

use pretty_assertions::assert_eq;
use serde_json::json;
use sqlweave::compiler::{Instr, Program};
use sqlweave::error::SymbolKind;
use sqlweave::parser::{parse, Node, TagGrammar};
use sqlweave::{builtins, load_extensions, CompileError, Compiler, ParseError};
use std::collections::BTreeMap;

fn compiler() -> Compiler {
    Compiler::new(load_extensions(builtins::catalog()).expect("Should load"))
}

fn grammars() -> BTreeMap<String, TagGrammar> {
    let mut map = BTreeMap::new();
    map.insert("req".to_string(), TagGrammar::block("req"));
    map.insert("error".to_string(), TagGrammar::inline("error"));
    map
}

#[test]
fn test_parse_control_flow() {
    let input = r#"
        SELECT * FROM users
        {% if ids %}
        WHERE id IN {{ ids }}
        {% elif name %}
        WHERE name = {{ name | lower }}
        {% else %}
        LIMIT {{ limit }}
        {% endif %}
    "#;

    let template = parse(input, &grammars()).expect("Should parse");
    let blocks = template
        .body
        .iter()
        .filter(|n| matches!(n.node, Node::If(_)))
        .count();
    assert_eq!(blocks, 1);
}

#[test]
fn test_parse_nested_block_tags() {
    let input = r#"
        {% req "users" main=true %}
          {% for id in ids %}
            {% if loop.first %}SELECT {{ id }}{% else %} UNION SELECT {{ id }}{% endif %}
          {% endfor %}
        {% endreq %}
    "#;

    let template = parse(input, &grammars()).expect("Should parse");
    let tag = template
        .body
        .iter()
        .find_map(|n| match &n.node {
            Node::Tag(call) => Some(call),
            _ => None,
        })
        .expect("Should contain the req tag");
    assert_eq!(tag.name.node.as_str(), "req");
    assert!(tag.body.as_ref().is_some_and(|b| b.iter().any(|n| matches!(n.node, Node::For(_)))));
}

#[test]
fn test_comments_dropped() {
    let template = parse("a{# note {{ x }} #}b", &grammars()).expect("Should parse");
    let text: Vec<_> = template
        .body
        .iter()
        .filter_map(|n| match &n.node {
            Node::Text(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, vec!["a", "b"]);
}

#[test]
fn test_unclosed_block_tag() {
    let errors = parse("{% req \"users\" %}SELECT 1", &grammars()).unwrap_err();
    assert!(matches!(&errors[0], ParseError::UnclosedTag { name, .. } if name == "req"));
}

#[test]
fn test_unterminated_output() {
    let errors = parse("SELECT {{ id", &grammars()).unwrap_err();
    assert!(matches!(&errors[0], ParseError::Unterminated { .. }));
}

#[test]
fn test_parse_error_report_points_at_source() {
    let source = "SELECT {% bogus %}";
    let errors = parse(source, &grammars()).unwrap_err();
    let report = errors[0].format(source, "query.sql");
    assert!(report.contains("bogus"));
    assert!(report.contains("query.sql"));
}

#[test]
fn test_scenario_unknown_tag_names_symbol() {
    let err = compiler()
        .compile("SELECT 1 {% bogus %}")
        .expect_err("Should fail");
    assert_eq!(err.unresolved_symbol(), Some("bogus"));
    assert!(err.to_string().contains("bogus"));
}

#[test]
fn test_unknown_filter_names_symbol() {
    let err = compiler()
        .compile("SELECT {{ a | shout }}")
        .expect_err("Should fail");
    match err {
        CompileError::Unresolved { kind, name, .. } => {
            assert_eq!(kind, SymbolKind::Filter);
            assert_eq!(name, "shout");
        }
        other => panic!("Expected unresolved filter, got {:?}", other),
    }
}

#[test]
fn test_compiled_code_decodes() {
    let result = compiler()
        .compile("SELECT * FROM t WHERE id = {{ id }}")
        .expect("Should compile");
    let program = Program::from_code(&result.compiled_data).expect("Should decode");
    assert_eq!(
        program.instrs,
        vec![
            Instr::Text("SELECT * FROM t WHERE id = ".to_string()),
            Instr::Load("id".to_string()),
            Instr::Emit,
            Instr::Export,
        ]
    );
}

#[test]
fn test_compile_is_deterministic() {
    let source = r#"
        {% req "orders" main=true %}
        SELECT * FROM orders
        WHERE customer = {{ customer.id | required }}
        {% if status %}AND status = {{ status | upper }}{% endif %}
        {% for tag in tags %}AND {{ tag }} = ANY(tags){% endfor %}
        {% endreq %}
        {% if not customer %}{% error "CUSTOMER_MISSING" %}{% endif %}
    "#;

    let compiler = compiler();
    let first = compiler.compile(source).expect("Should compile");
    let second = compiler.compile(source).expect("Should compile");
    assert_eq!(first.compiled_data, second.compiled_data);
    assert_eq!(
        serde_json::to_string(&first.metadata).unwrap(),
        serde_json::to_string(&second.metadata).unwrap()
    );

    // A freshly loaded engine produces the same artifact
    let third = self::compiler().compile(source).expect("Should compile");
    assert_eq!(first, third);
}

#[test]
fn test_builtin_metadata() {
    let source = r#"{% req "users" %}SELECT * FROM users WHERE id = {{ id | required }} AND org = {{ org.id | required }}{% endreq %}{% error "NOPE" %}"#;
    let result = compiler().compile(source).expect("Should compile");
    assert_eq!(
        serde_json::Value::Object(result.metadata),
        json!({
            "builder.requests": [{"name": "users", "main": false}],
            "error.codes": [{"code": "NOPE", "offset": 113}],
            "parameters.required": ["id", "org.id"],
        })
    );
}

#[test]
fn test_compile_result_json_shape() {
    let result = compiler().compile("SELECT 1").expect("Should compile");
    insta::assert_snapshot!(serde_json::to_string_pretty(&result).unwrap(), @r###"
    {
      "compiledData": "program v1\ntext \"SELECT 1\"\nexport\nend\n",
      "metadata": {}
    }
    "###);
}
