//! Block nesting for parsed chunks
//!
//! Built-in control flow (`if`/`for`) is always known. Extension tags are
//! looked up in the registered [`TagGrammars`]; block tags consume everything
//! up to their matching `end<name>` header.

use std::collections::BTreeMap;

use crate::error::ParseError;
use crate::parser::ast::*;
use crate::parser::grammar::Chunk;
use crate::parser::MAX_NESTING;

/// Grammar contributed by a compile-time tag extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagGrammar {
    pub name: String,
    /// Block tags have a body closed by `{% end<name> %}`
    pub block: bool,
}

impl TagGrammar {
    pub fn inline(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            block: false,
        }
    }

    pub fn block(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            block: true,
        }
    }

    pub fn end_tag(&self) -> String {
        format!("end{}", self.name)
    }
}

/// Lookup of tag grammars by tag name
pub trait TagGrammars {
    fn tag_grammar(&self, name: &str) -> Option<&TagGrammar>;
}

impl TagGrammars for BTreeMap<String, TagGrammar> {
    fn tag_grammar(&self, name: &str) -> Option<&TagGrammar> {
        self.get(name)
    }
}

/// Why a nested block stopped
enum Stop {
    Eof,
    Chunk(Spanned<Chunk>),
}

struct TreeBuilder<'g, G: TagGrammars + ?Sized> {
    chunks: std::vec::IntoIter<Spanned<Chunk>>,
    grammars: &'g G,
    depth: usize,
}

/// Nest flat chunks into a template tree
pub fn build_tree<G: TagGrammars + ?Sized>(
    chunks: Vec<Spanned<Chunk>>,
    grammars: &G,
) -> Result<Template, ParseError> {
    let mut builder = TreeBuilder {
        chunks: chunks.into_iter(),
        grammars,
        depth: 0,
    };
    let (body, stop) = builder.nodes()?;
    match stop {
        Stop::Eof => Ok(Template { body }),
        Stop::Chunk(chunk) => Err(unexpected(chunk)),
    }
}

fn unexpected(chunk: Spanned<Chunk>) -> ParseError {
    let name = match &chunk.node {
        Chunk::Elif(_) => "elif".to_string(),
        Chunk::Else => "else".to_string(),
        Chunk::EndIf => "endif".to_string(),
        Chunk::EndFor => "endfor".to_string(),
        Chunk::Tag(name, _) => name.node.0.clone(),
        other => format!("{:?}", other),
    };
    ParseError::UnexpectedTag {
        name,
        span: chunk.span,
    }
}

impl<G: TagGrammars + ?Sized> TreeBuilder<'_, G> {
    /// Collect nodes until a chunk that closes or continues an enclosing block
    fn nodes(&mut self) -> Result<(Vec<Spanned<Node>>, Stop), ParseError> {
        let mut body = Vec::new();
        while let Some(chunk) = self.chunks.next() {
            let span = chunk.span.clone();
            let node = match chunk.node {
                Chunk::Text(text) => Node::Text(text),
                Chunk::Output(expr) => Node::Output(expr),
                Chunk::Set(target, value) => Node::Set(SetStmt { target, value }),
                Chunk::If(condition) => Node::If(self.if_block(condition, &span)?),
                Chunk::For(variable, iterable) => {
                    let (body, stop) = self.nested(&span)?;
                    match stop {
                        Stop::Chunk(Spanned {
                            node: Chunk::EndFor,
                            ..
                        }) => Node::For(ForBlock {
                            variable,
                            iterable,
                            body,
                        }),
                        Stop::Chunk(other) => return Err(unexpected(other)),
                        Stop::Eof => return Err(unclosed("for", span)),
                    }
                }
                Chunk::Tag(name, args) => {
                    if self.closes_custom_block(&name.node) {
                        return Ok((
                            body,
                            Stop::Chunk(Spanned::new(Chunk::Tag(name, args), span)),
                        ));
                    }
                    Node::Tag(self.tag(name, args, &span)?)
                }
                Chunk::Elif(_) | Chunk::Else | Chunk::EndIf | Chunk::EndFor => {
                    return Ok((body, Stop::Chunk(Spanned::new(chunk.node, span))));
                }
            };
            body.push(Spanned::new(node, span));
        }
        Ok((body, Stop::Eof))
    }

    /// Body of a block opened at `open`
    fn nested(&mut self, open: &Span) -> Result<(Vec<Spanned<Node>>, Stop), ParseError> {
        if self.depth >= MAX_NESTING {
            return Err(ParseError::TooDeep {
                limit: MAX_NESTING,
                span: open.clone(),
            });
        }
        self.depth += 1;
        let result = self.nodes();
        self.depth -= 1;
        result
    }

    /// `end<name>` headers for registered block tags terminate the current body
    fn closes_custom_block(&self, name: &Identifier) -> bool {
        name.as_str()
            .strip_prefix("end")
            .and_then(|base| self.grammars.tag_grammar(base))
            .is_some_and(|grammar| grammar.block)
    }

    fn if_block(&mut self, condition: Spanned<Expr>, open: &Span) -> Result<IfBlock, ParseError> {
        let mut branches = Vec::new();
        let mut condition = condition;
        loop {
            let (body, stop) = self.nested(open)?;
            branches.push(Branch { condition, body });
            match stop {
                Stop::Chunk(Spanned {
                    node: Chunk::Elif(next),
                    ..
                }) => condition = next,
                Stop::Chunk(Spanned {
                    node: Chunk::Else, ..
                }) => {
                    let (otherwise, stop) = self.nested(open)?;
                    return match stop {
                        Stop::Chunk(Spanned {
                            node: Chunk::EndIf, ..
                        }) => Ok(IfBlock {
                            branches,
                            otherwise: Some(otherwise),
                        }),
                        Stop::Chunk(other) => Err(unexpected(other)),
                        Stop::Eof => Err(unclosed("if", open.clone())),
                    };
                }
                Stop::Chunk(Spanned {
                    node: Chunk::EndIf, ..
                }) => {
                    return Ok(IfBlock {
                        branches,
                        otherwise: None,
                    })
                }
                Stop::Chunk(other) => return Err(unexpected(other)),
                Stop::Eof => return Err(unclosed("if", open.clone())),
            }
        }
    }

    fn tag(
        &mut self,
        name: Spanned<Identifier>,
        args: Vec<TagArg>,
        open: &Span,
    ) -> Result<TagCall, ParseError> {
        let Some(grammar) = self.grammars.tag_grammar(name.node.as_str()) else {
            return Err(ParseError::UnknownTag {
                name: name.node.0,
                span: name.span,
            });
        };
        if !grammar.block {
            return Ok(TagCall {
                name,
                args,
                body: None,
            });
        }

        let end_tag = grammar.end_tag();
        let (body, stop) = self.nested(open)?;
        match stop {
            Stop::Chunk(Spanned {
                node: Chunk::Tag(end, _),
                ..
            }) if end.node.as_str() == end_tag => Ok(TagCall {
                name,
                args,
                body: Some(body),
            }),
            Stop::Chunk(other) => Err(unexpected(other)),
            Stop::Eof => Err(unclosed(name.node.as_str(), open.clone())),
        }
    }
}

fn unclosed(name: &str, span: Span) -> ParseError {
    ParseError::UnclosedTag {
        name: name.to_string(),
        span,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::grammar::parse_chunks;

    fn grammars() -> BTreeMap<String, TagGrammar> {
        let mut map = BTreeMap::new();
        map.insert("req".to_string(), TagGrammar::block("req"));
        map.insert("error".to_string(), TagGrammar::inline("error"));
        map
    }

    fn tree(input: &str) -> Result<Template, ParseError> {
        let chunks = parse_chunks(input).expect("Should parse chunks");
        build_tree(chunks, &grammars())
    }

    #[test]
    fn test_if_elif_else() {
        let template = tree("{% if a %}A{% elif b %}B{% else %}C{% endif %}").expect("Should build");
        assert_eq!(template.body.len(), 1);
        match &template.body[0].node {
            Node::If(block) => {
                assert_eq!(block.branches.len(), 2);
                assert_eq!(block.branches[1].body[0].node, Node::Text("B".to_string()));
                assert_eq!(
                    block.otherwise.as_ref().map(|b| b.len()),
                    Some(1)
                );
            }
            other => panic!("Expected if, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_for_inside_block_tag() {
        let template = tree(
            r#"{% req "users" %}SELECT {% for c in cols %}{{ c }}{% endfor %}{% endreq %}"#,
        )
        .expect("Should build");
        match &template.body[0].node {
            Node::Tag(call) => {
                assert_eq!(call.name.node.as_str(), "req");
                let body = call.body.as_ref().expect("block tag has body");
                assert_eq!(body.len(), 2);
                assert!(matches!(body[1].node, Node::For(_)));
            }
            other => panic!("Expected tag, got {:?}", other),
        }
    }

    #[test]
    fn test_inline_tag_has_no_body() {
        let template = tree(r#"{% error "NOT_FOUND" %} tail"#).expect("Should build");
        assert_eq!(template.body.len(), 2);
        match &template.body[0].node {
            Node::Tag(call) => assert!(call.body.is_none()),
            other => panic!("Expected tag, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_tag() {
        let err = tree("SELECT {% bogus %}").unwrap_err();
        assert_eq!(
            err,
            ParseError::UnknownTag {
                name: "bogus".to_string(),
                span: 10..15,
            }
        );
    }

    #[test]
    fn test_unclosed_block_tag() {
        let err = tree(r#"{% req "a" %}SELECT 1"#).unwrap_err();
        assert!(matches!(err, ParseError::UnclosedTag { ref name, .. } if name == "req"));
    }

    #[test]
    fn test_unclosed_if() {
        let err = tree("{% if a %}x").unwrap_err();
        assert!(matches!(err, ParseError::UnclosedTag { ref name, .. } if name == "if"));
    }

    #[test]
    fn test_stray_end_tag() {
        let err = tree("x{% endfor %}").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedTag { ref name, .. } if name == "endfor"));
    }

    #[test]
    fn test_mismatched_end_tag() {
        let err = tree(r#"{% for x in xs %}{% endreq %}"#).unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedTag { ref name, .. } if name == "endreq"));
    }

    #[test]
    fn test_end_of_unregistered_tag_is_unknown() {
        let err = tree("{% endbogus %}").unwrap_err();
        assert!(matches!(err, ParseError::UnknownTag { ref name, .. } if name == "endbogus"));
    }

    #[test]
    fn test_nesting_limit() {
        let nested = |depth: usize| {
            format!(
                "{}x{}",
                "{% if a %}{% req \"r\" %}".repeat(depth / 2),
                "{% endreq %}{% endif %}".repeat(depth / 2)
            )
        };
        assert!(tree(&nested(MAX_NESTING)).is_ok());

        let err = tree(&nested(MAX_NESTING + 2)).unwrap_err();
        assert!(matches!(err, ParseError::TooDeep { limit, .. } if limit == MAX_NESTING));
    }

    #[test]
    fn test_runaway_nesting_is_an_error() {
        let source = format!("{}{}", "{% for x in xs %}".repeat(10_000), "{% endfor %}".repeat(10_000));
        let err = tree(&source).unwrap_err();
        assert!(matches!(err, ParseError::TooDeep { .. }));
    }
}
