//! Parser implementation using chumsky
//!
//! The grammar produces a flat list of [`Chunk`]s (text, outputs and tag
//! headers). Nesting of block tags is resolved afterwards by the tree
//! builder, which knows the tag grammars registered by extensions.

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;

use crate::parser::ast::*;
use crate::parser::lexer::Token;
use crate::parser::MAX_NESTING;
use crate::ParseError;

/// Operators one expression may chain; each adds a level to the tree
const MAX_OPERATORS: usize = MAX_NESTING * 4;

/// One flat element of a template before block nesting is resolved
#[derive(Debug, Clone, PartialEq)]
pub enum Chunk {
    Text(String),
    Output(Spanned<Expr>),
    If(Spanned<Expr>),
    Elif(Spanned<Expr>),
    Else,
    EndIf,
    For(Spanned<Identifier>, Spanned<Expr>),
    EndFor,
    Set(Spanned<Identifier>, Spanned<Expr>),
    /// Any other tag header, including custom `end*` tags
    Tag(Spanned<Identifier>, Vec<TagArg>),
}

/// Parse template source into flat chunks
pub fn parse_chunks(input: &str) -> Result<Vec<Spanned<Chunk>>, Vec<crate::ParseError>> {
    let len = input.len();
    let tokens = crate::parser::lexer::lex(input).map_err(|e| vec![e])?;
    check_nesting(&tokens).map_err(|e| vec![e])?;

    let token_iter = tokens
        .into_iter()
        .map(|(tok, span)| (tok, SimpleSpan::from(span)));

    // Turn the token iterator into a stream that chumsky can use
    let token_stream = Stream::from_iter(token_iter)
        // Split (Token, SimpleSpan) into token and span parts
        .map((len..len).into(), |(t, s): (_, _)| (t, s));

    chunk_parser()
        .parse(token_stream)
        .into_result()
        .map_err(|errs| errs.into_iter().map(|e| e.into()).collect())
}

/// Reject expressions nested too deeply for the recursive parser
///
/// Parentheses and runs of `not` recurse; operator chains do not while
/// parsing but still build a tree as deep as the chain is long.
fn check_nesting(tokens: &[(Token, Span)]) -> Result<(), ParseError> {
    let mut opened: Vec<usize> = Vec::new();
    let mut depth = 0;
    let mut nots = 0;
    let mut operators = 0;
    for (token, span) in tokens {
        match token {
            Token::OutputClose | Token::TagClose => {
                opened.clear();
                depth = 0;
                nots = 0;
                operators = 0;
                continue;
            }
            Token::Not => nots += 1,
            Token::ParenOpen => {
                opened.push(nots + 1);
                depth += nots + 1;
                nots = 0;
            }
            Token::ParenClose => depth -= opened.pop().unwrap_or(0),
            Token::Dot
            | Token::Pipe
            | Token::And
            | Token::Or
            | Token::Eq
            | Token::NotEq
            | Token::Less
            | Token::LessEq
            | Token::Greater
            | Token::GreaterEq => operators += 1,
            _ => nots = 0,
        }
        if depth + nots > MAX_NESTING {
            return Err(ParseError::TooDeep {
                limit: MAX_NESTING,
                span: span.clone(),
            });
        }
        if operators > MAX_OPERATORS {
            return Err(ParseError::TooDeep {
                limit: MAX_OPERATORS,
                span: span.clone(),
            });
        }
    }
    Ok(())
}

/// Helper to extract span range from chumsky's MapExtra
fn span_range(e: &impl chumsky::span::Span<Offset = usize>) -> std::ops::Range<usize> {
    e.start()..e.end()
}

fn join(a: &Span, b: &Span) -> Span {
    a.start..b.end
}

fn expr_parser<'a, I>() -> impl Parser<'a, I, Spanned<Expr>, extra::Err<Rich<'a, Token>>> + Clone
where
    I: ValueInput<'a, Token = Token, Span = SimpleSpan>,
{
    let identifier = select! {
        Token::Ident(s) => Identifier::new(s),
    }
    .map_with(|id, e| Spanned::new(id, span_range(&e.span())));

    recursive(|expr| {
        let literal = select! {
            Token::Int(n) => Literal::Int(n),
            Token::Float(f) => Literal::Float(f),
            Token::String(s) => Literal::String(s),
            Token::True => Literal::Bool(true),
            Token::False => Literal::Bool(false),
            Token::Null => Literal::Null,
        }
        .map_with(|lit, e| Spanned::new(Expr::Literal(lit), span_range(&e.span())));

        let variable = identifier
            .clone()
            .map(|id| Spanned::new(Expr::Variable(id.node), id.span));

        let parens = expr
            .clone()
            .delimited_by(just(Token::ParenOpen), just(Token::ParenClose));

        let atom = choice((literal, variable, parens));

        // Attribute access: a.b.c
        let attribute = atom.foldl(
            just(Token::Dot).ignore_then(identifier.clone()).repeated(),
            |target: Spanned<Expr>, attr: Spanned<Identifier>| {
                let span = join(&target.span, &attr.span);
                Spanned::new(
                    Expr::Attribute {
                        target: Box::new(target),
                        attr: attr.node,
                    },
                    span,
                )
            },
        );

        // Filter pipes: value | name | name(arg, ...)
        let filter_args = expr
            .clone()
            .separated_by(just(Token::Comma))
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(just(Token::ParenOpen), just(Token::ParenClose));

        let filter_suffix = just(Token::Pipe)
            .ignore_then(identifier.clone())
            .then(filter_args.or_not())
            .map_with(|(name, args), e| (name, args.unwrap_or_default(), span_range(&e.span())));

        let filtered = attribute.foldl(
            filter_suffix.repeated(),
            |target: Spanned<Expr>, (name, args, span): (Spanned<Identifier>, Vec<Spanned<Expr>>, Span)| {
                let full = join(&target.span, &span);
                Spanned::new(
                    Expr::Filter(FilterCall {
                        target: Box::new(target),
                        name,
                        args,
                    }),
                    full,
                )
            },
        );

        // Prefix `not`, possibly repeated
        let unary = just(Token::Not)
            .map_with(|_, e| span_range(&e.span()))
            .repeated()
            .collect::<Vec<_>>()
            .then(filtered)
            .map(|(nots, inner)| {
                nots.into_iter().rev().fold(inner, |acc, not_span| {
                    let span = not_span.start..acc.span.end;
                    Spanned::new(Expr::Not(Box::new(acc)), span)
                })
            });

        let comparison_op = choice((
            just(Token::Eq).to(BinaryOp::Eq),
            just(Token::NotEq).to(BinaryOp::NotEq),
            just(Token::LessEq).to(BinaryOp::LessEq),
            just(Token::GreaterEq).to(BinaryOp::GreaterEq),
            just(Token::Less).to(BinaryOp::Less),
            just(Token::Greater).to(BinaryOp::Greater),
        ));

        let comparison = unary
            .clone()
            .then(comparison_op.then(unary).or_not())
            .map(|(lhs, rhs)| match rhs {
                Some((op, rhs)) => binary(op, lhs, rhs),
                None => lhs,
            });

        let conjunction = comparison.clone().foldl(
            just(Token::And).ignore_then(comparison).repeated(),
            |lhs, rhs| binary(BinaryOp::And, lhs, rhs),
        );

        conjunction
            .clone()
            .foldl(
                just(Token::Or).ignore_then(conjunction).repeated(),
                |lhs, rhs| binary(BinaryOp::Or, lhs, rhs),
            )
            .boxed()
    })
}

fn binary(op: BinaryOp, lhs: Spanned<Expr>, rhs: Spanned<Expr>) -> Spanned<Expr> {
    let span = join(&lhs.span, &rhs.span);
    Spanned::new(
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
        span,
    )
}

fn chunk_parser<'a, I>() -> impl Parser<'a, I, Vec<Spanned<Chunk>>, extra::Err<Rich<'a, Token>>> + Clone
where
    I: ValueInput<'a, Token = Token, Span = SimpleSpan>,
{
    let identifier = select! {
        Token::Ident(s) => Identifier::new(s),
    }
    .map_with(|id, e| Spanned::new(id, span_range(&e.span())));

    let expr = expr_parser();

    let text = select! {
        Token::Text(s) => Chunk::Text(s),
    };

    let output = expr
        .clone()
        .delimited_by(just(Token::OutputOpen), just(Token::OutputClose))
        .map(Chunk::Output);

    // Tag arguments: `key=expr` or `expr`, optionally comma separated
    let tag_arg = choice((
        identifier
            .clone()
            .then_ignore(just(Token::Assign))
            .then(expr.clone())
            .map(|(key, value)| TagArg::Keyword { key, value }),
        expr.clone().map(TagArg::Positional),
    ));

    let tag_args = tag_arg
        .then_ignore(just(Token::Comma).or_not())
        .repeated()
        .collect::<Vec<_>>();

    // Order matters: keyword headers before the generic extension tag
    let tag_header = choice((
        just(Token::If).ignore_then(expr.clone()).map(Chunk::If),
        just(Token::Elif).ignore_then(expr.clone()).map(Chunk::Elif),
        just(Token::Else).to(Chunk::Else),
        just(Token::EndIf).to(Chunk::EndIf),
        just(Token::For)
            .ignore_then(identifier.clone())
            .then_ignore(just(Token::In))
            .then(expr.clone())
            .map(|(var, iterable)| Chunk::For(var, iterable)),
        just(Token::EndFor).to(Chunk::EndFor),
        just(Token::Set)
            .ignore_then(identifier.clone())
            .then_ignore(just(Token::Assign))
            .then(expr)
            .map(|(target, value)| Chunk::Set(target, value)),
        identifier
            .then(tag_args)
            .map(|(name, args)| Chunk::Tag(name, args)),
    ));

    let tag = tag_header.delimited_by(just(Token::TagOpen), just(Token::TagClose));

    choice((text, output, tag))
        .map_with(|c, e| Spanned::new(c, span_range(&e.span())))
        .repeated()
        .collect()
        .then_ignore(end())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_output(input: &str) -> Expr {
        let chunks = parse_chunks(input).expect("Should parse");
        assert_eq!(chunks.len(), 1);
        match &chunks[0].node {
            Chunk::Output(expr) => expr.node.clone(),
            other => panic!("Expected output, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_text_and_output() {
        let chunks = parse_chunks("SELECT * FROM t WHERE id = {{ id }}").expect("Should parse");
        assert_eq!(chunks.len(), 2);
        assert_eq!(
            chunks[0].node,
            Chunk::Text("SELECT * FROM t WHERE id = ".to_string())
        );
        assert!(matches!(&chunks[1].node, Chunk::Output(_)));
        assert_eq!(chunks[1].span, 27..35);
    }

    #[test]
    fn test_parse_attribute_chain() {
        match single_output("{{ context.params.id }}") {
            expr @ Expr::Attribute { .. } => {
                assert_eq!(expr.as_path().as_deref(), Some("context.params.id"));
            }
            other => panic!("Expected attribute, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_filter_chain() {
        match single_output("{{ name | trim | replace('a', 'b') }}") {
            Expr::Filter(outer) => {
                assert_eq!(outer.name.node.as_str(), "replace");
                assert_eq!(outer.args.len(), 2);
                match &outer.target.node {
                    Expr::Filter(inner) => {
                        assert_eq!(inner.name.node.as_str(), "trim");
                        assert!(inner.args.is_empty());
                    }
                    other => panic!("Expected inner filter, got {:?}", other),
                }
            }
            other => panic!("Expected filter, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_precedence() {
        // `or` binds loosest, comparisons tighter than `and`
        match single_output("{{ a == 1 and b or c }}") {
            Expr::Binary { op, lhs, .. } => {
                assert_eq!(op, BinaryOp::Or);
                match lhs.node {
                    Expr::Binary { op, lhs, .. } => {
                        assert_eq!(op, BinaryOp::And);
                        assert!(matches!(lhs.node, Expr::Binary { op: BinaryOp::Eq, .. }));
                    }
                    other => panic!("Expected and, got {:?}", other),
                }
            }
            other => panic!("Expected or, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_not_wraps_filter() {
        match single_output("{{ not flag | truthy }}") {
            Expr::Not(inner) => assert!(matches!(inner.node, Expr::Filter(_))),
            other => panic!("Expected not, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_parenthesized_filter_target() {
        match single_output("{{ (a or b) | upper }}") {
            Expr::Filter(call) => {
                assert!(matches!(call.target.node, Expr::Binary { op: BinaryOp::Or, .. }));
            }
            other => panic!("Expected filter, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_control_headers() {
        let chunks = parse_chunks(
            "{% if a %}{% elif b %}{% else %}{% endif %}{% for x in xs %}{% endfor %}{% set y = 1 %}",
        )
        .expect("Should parse");
        let kinds: Vec<_> = chunks
            .iter()
            .map(|c| match &c.node {
                Chunk::If(_) => "if",
                Chunk::Elif(_) => "elif",
                Chunk::Else => "else",
                Chunk::EndIf => "endif",
                Chunk::For(..) => "for",
                Chunk::EndFor => "endfor",
                Chunk::Set(..) => "set",
                _ => "other",
            })
            .collect();
        assert_eq!(kinds, vec!["if", "elif", "else", "endif", "for", "endfor", "set"]);
    }

    #[test]
    fn test_parse_tag_arguments() {
        let chunks = parse_chunks(r#"{% req "users", main=true %}"#).expect("Should parse");
        match &chunks[0].node {
            Chunk::Tag(name, args) => {
                assert_eq!(name.node.as_str(), "req");
                assert_eq!(args.len(), 2);
                assert!(matches!(&args[0], TagArg::Positional(_)));
                match &args[1] {
                    TagArg::Keyword { key, value } => {
                        assert_eq!(key.node.as_str(), "main");
                        assert_eq!(value.node, Expr::Literal(Literal::Bool(true)));
                    }
                    other => panic!("Expected keyword, got {:?}", other),
                }
            }
            other => panic!("Expected tag, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_tag_without_commas() {
        let chunks = parse_chunks(r#"{% req "users" main=true %}"#).expect("Should parse");
        match &chunks[0].node {
            Chunk::Tag(_, args) => assert_eq!(args.len(), 2),
            other => panic!("Expected tag, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_reports_position() {
        let errs = parse_chunks("SELECT {{ | }}").unwrap_err();
        assert!(!errs.is_empty());
        assert_eq!(errs[0].span().start, 10);
    }

    #[test]
    fn test_parse_empty_output_fails() {
        assert!(parse_chunks("{{ }}").is_err());
    }

    #[test]
    fn test_deep_parentheses_rejected() {
        let ok = format!("{{{{ {}a{} }}}}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert!(parse_chunks(&ok).is_ok());

        let deep = format!("{{{{ {}a{} }}}}", "(".repeat(5_000), ")".repeat(5_000));
        let errs = parse_chunks(&deep).unwrap_err();
        assert!(matches!(errs[0], ParseError::TooDeep { limit, .. } if limit == MAX_NESTING));
    }

    #[test]
    fn test_not_runs_count_toward_nesting() {
        let deep = format!("{{{{ {}flag }}}}", "not ".repeat(MAX_NESTING + 1));
        assert!(matches!(
            parse_chunks(&deep).unwrap_err()[0],
            ParseError::TooDeep { .. }
        ));
        let mixed = format!("{{{{ {}flag{} }}}}", "not (".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert!(parse_chunks(&mixed).is_err());
    }

    #[test]
    fn test_nesting_resets_per_region() {
        let one = format!("{{{{ {}a{} }}}}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert!(parse_chunks(&one.repeat(3)).is_ok());
    }

    #[test]
    fn test_long_operator_chain_rejected() {
        let chain = format!("{{{{ a{} }}}}", ".b".repeat(MAX_OPERATORS + 1));
        assert!(matches!(
            parse_chunks(&chain).unwrap_err()[0],
            ParseError::TooDeep { limit, .. } if limit == MAX_OPERATORS
        ));
        assert!(parse_chunks("{{ a.b.c | trim | upper and x or y == 1 }}").is_ok());
    }
}
