//! Lexer for sqlweave templates using logos
//!
//! A template interleaves raw SQL text with delimited code regions. The scanner
//! walks the raw text looking for `{{`, `{%` and `{#`; everything inside a code
//! region is tokenized by logos until the matching closing delimiter.

use logos::Logos;

use crate::error::ParseError;

/// Byte range in source text
pub type Span = std::ops::Range<usize>;

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\n\r]+")]
pub enum Token {
    // Region delimiters
    #[token("{{")]
    OutputOpen,
    #[token("}}")]
    OutputClose,
    #[token("{%")]
    TagOpen,
    #[token("%}")]
    TagClose,

    /// Raw text between code regions, produced by the scanner only
    Text(String),

    // Control-flow keywords
    #[token("if")]
    If,
    #[token("elif")]
    Elif,
    #[token("else")]
    Else,
    #[token("endif")]
    EndIf,
    #[token("for")]
    For,
    #[token("in")]
    In,
    #[token("endfor")]
    EndFor,
    #[token("set")]
    Set,

    // Logical keywords
    #[token("and")]
    And,
    #[token("or")]
    Or,
    #[token("not")]
    Not,

    // Constant keywords
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("none")]
    #[token("null")]
    Null,

    // Operators (longer patterns first)
    #[token("==")]
    Eq,
    #[token("!=")]
    NotEq,
    #[token("<=")]
    LessEq,
    #[token(">=")]
    GreaterEq,
    #[token("<")]
    Less,
    #[token(">")]
    Greater,
    #[token("=")]
    Assign,
    #[token("|")]
    Pipe,

    // Delimiters
    #[token(".")]
    Dot,
    #[token(",")]
    Comma,
    #[token("(")]
    ParenOpen,
    #[token(")")]
    ParenClose,

    // Literals - identifiers must come after keywords
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string(), priority = 1)]
    Ident(String),

    #[regex(r#""([^"\\]|\\.)*""#, unquote)]
    #[regex(r#"'([^'\\]|\\.)*'"#, unquote)]
    String(String),

    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    Float(f64),
}

/// Strip the quotes from a string literal and resolve backslash escapes
fn unquote(lex: &mut logos::Lexer<Token>) -> String {
    let raw = lex.slice();
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Which kind of code region the scanner is inside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Output,
    Tag,
}

impl Region {
    fn closer(self) -> Token {
        match self {
            Region::Output => Token::OutputClose,
            Region::Tag => Token::TagClose,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            Region::Output => "output expression '{{'",
            Region::Tag => "tag '{%'",
        }
    }
}

/// Lex a template into tokens with absolute spans
///
/// Raw text becomes [`Token::Text`]; comments (`{# ... #}`) are dropped.
pub fn lex(input: &str) -> Result<Vec<(Token, Span)>, ParseError> {
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < input.len() {
        let Some(start) = find_opener(input, pos) else {
            tokens.push((Token::Text(input[pos..].to_string()), pos..input.len()));
            break;
        };
        if start > pos {
            tokens.push((Token::Text(input[pos..start].to_string()), pos..start));
        }

        let region = match &input[start..start + 2] {
            "{{" => Region::Output,
            "{%" => Region::Tag,
            _ => {
                // Comment: skip through the closing `#}`
                let body = start + 2;
                match input[body..].find("#}") {
                    Some(offset) => {
                        pos = body + offset + 2;
                        continue;
                    }
                    None => {
                        return Err(ParseError::unterminated("comment '{#'", start..body));
                    }
                }
            }
        };

        pos = lex_region(input, start, region, &mut tokens)?;
    }

    Ok(tokens)
}

/// Find the next region opener at or after `from`
fn find_opener(input: &str, from: usize) -> Option<usize> {
    let bytes = input.as_bytes();
    (from..bytes.len().saturating_sub(1))
        .find(|&i| bytes[i] == b'{' && matches!(bytes[i + 1], b'{' | b'%' | b'#'))
}

/// Tokenize one code region, returning the offset just past its closer
fn lex_region(
    input: &str,
    start: usize,
    region: Region,
    tokens: &mut Vec<(Token, Span)>,
) -> Result<usize, ParseError> {
    let base = start + 2;
    let opener = match region {
        Region::Output => Token::OutputOpen,
        Region::Tag => Token::TagOpen,
    };
    tokens.push((opener, start..base));

    let closer = region.closer();
    let mut lexer = Token::lexer(&input[base..]);
    while let Some(result) = lexer.next() {
        let span = base + lexer.span().start..base + lexer.span().end;
        match result {
            Ok(tok) if tok == closer => {
                tokens.push((tok, span.clone()));
                return Ok(span.end);
            }
            Ok(tok) => tokens.push((tok, span)),
            Err(()) => {
                return Err(ParseError::Syntax {
                    message: format!("Unexpected character '{}'", &input[span.clone()]),
                    span,
                    expected: Vec::new(),
                });
            }
        }
    }

    Err(ParseError::unterminated(region.describe(), start..base))
}
