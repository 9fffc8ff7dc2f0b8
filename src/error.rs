//! Error types for parsing, extension loading and compilation

use ariadne::{Color, Label, Report, ReportKind, Source};
use thiserror::Error;

use crate::extension::{ExtensionKind, Phase};

/// Byte range in source text
pub type Span = std::ops::Range<usize>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Parse error at {span:?}: {message}")]
    Syntax {
        span: Span,
        message: String,
        expected: Vec<String>,
    },

    #[error("Unterminated {what} at {span:?}")]
    Unterminated { what: String, span: Span },

    #[error("Unknown tag '{name}' at {span:?}")]
    UnknownTag { name: String, span: Span },

    #[error("Tag '{name}' opened at {span:?} is never closed")]
    UnclosedTag { name: String, span: Span },

    #[error("Unexpected tag '{name}' at {span:?}")]
    UnexpectedTag { name: String, span: Span },

    #[error("Nesting deeper than {limit} levels at {span:?}")]
    TooDeep { limit: usize, span: Span },
}

impl ParseError {
    pub(crate) fn unterminated(what: impl Into<String>, span: Span) -> Self {
        Self::Unterminated {
            what: what.into(),
            span,
        }
    }

    /// Source position of the error
    pub fn span(&self) -> &Span {
        match self {
            Self::Syntax { span, .. }
            | Self::Unterminated { span, .. }
            | Self::UnknownTag { span, .. }
            | Self::UnclosedTag { span, .. }
            | Self::UnexpectedTag { span, .. }
            | Self::TooDeep { span, .. } => span,
        }
    }

    fn label(&self) -> String {
        match self {
            Self::Syntax {
                message, expected, ..
            } => {
                if expected.is_empty() {
                    message.clone()
                } else {
                    format!("{}\nExpected: {}", message, expected.join(", "))
                }
            }
            Self::Unterminated { what, .. } => format!("{} is never closed", what),
            Self::UnknownTag { name, .. } => format!("no extension registers tag '{}'", name),
            Self::UnclosedTag { name, .. } => format!("missing '{{% end{} %}}'", name),
            Self::UnexpectedTag { name, .. } => format!("'{}' has no matching opening tag", name),
            Self::TooDeep { limit, .. } => format!("at most {} levels may be nested", limit),
        }
    }

    /// Format the error with source context using ariadne
    pub fn format(&self, source: &str, filename: &str) -> String {
        let mut buf = Vec::new();
        let span = self.span().clone();
        let written = Report::build(ReportKind::Error, filename, span.start)
            .with_message(self.to_string())
            .with_label(
                Label::new((filename, span))
                    .with_message(self.label())
                    .with_color(Color::Red),
            )
            .finish()
            .write((filename, Source::from(source)), &mut buf);
        match written {
            Ok(()) => String::from_utf8_lossy(&buf).into_owned(),
            Err(_) => self.to_string(),
        }
    }
}

impl<'a> From<chumsky::error::Rich<'a, crate::parser::lexer::Token>> for ParseError {
    fn from(err: chumsky::error::Rich<'a, crate::parser::lexer::Token>) -> Self {
        use chumsky::error::RichReason;

        let message = match err.reason() {
            RichReason::ExpectedFound { found, .. } => {
                let found_str = match found {
                    Some(tok) => format_token(tok),
                    None => "end of input".to_string(),
                };
                format!("Unexpected {}", found_str)
            }
            RichReason::Custom(msg) => msg.to_string(),
        };

        let expected: Vec<String> = err
            .expected()
            .filter_map(|e| match e {
                chumsky::error::RichPattern::Token(tok) => Some(format_token(tok)),
                chumsky::error::RichPattern::Label(label) => Some(label.to_string()),
                chumsky::error::RichPattern::EndOfInput => Some("end of input".to_string()),
                chumsky::error::RichPattern::Identifier(s) => Some(format!("identifier '{}'", s)),
                chumsky::error::RichPattern::Any => Some("any token".to_string()),
                chumsky::error::RichPattern::SomethingElse => None,
            })
            .collect();

        ParseError::Syntax {
            span: err.span().into_range(),
            message,
            expected,
        }
    }
}

/// Format a token for human-readable error messages
fn format_token(tok: &crate::parser::lexer::Token) -> String {
    use crate::parser::lexer::Token;
    match tok {
        Token::Ident(s) => format!("identifier '{}'", s),
        Token::String(s) => format!("string \"{}\"", s),
        Token::Int(n) => format!("number {}", n),
        Token::Float(n) => format!("number {}", n),
        Token::Text(_) => "template text".to_string(),
        Token::OutputOpen => "'{{'".to_string(),
        Token::OutputClose => "'}}'".to_string(),
        Token::TagOpen => "'{%'".to_string(),
        Token::TagClose => "'%}'".to_string(),
        Token::Pipe => "'|'".to_string(),
        Token::Dot => "'.'".to_string(),
        Token::Comma => "','".to_string(),
        Token::ParenOpen => "'('".to_string(),
        Token::ParenClose => "')'".to_string(),
        Token::Assign => "'='".to_string(),
        Token::If => "keyword 'if'".to_string(),
        Token::Elif => "keyword 'elif'".to_string(),
        Token::Else => "keyword 'else'".to_string(),
        Token::EndIf => "keyword 'endif'".to_string(),
        Token::For => "keyword 'for'".to_string(),
        Token::In => "keyword 'in'".to_string(),
        Token::EndFor => "keyword 'endfor'".to_string(),
        Token::Set => "keyword 'set'".to_string(),
        _ => format!("{:?}", tok),
    }
}

/// Errors raised while loading extensions or configuration.
/// Fatal: an engine is never built from a partially loaded extension set.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("invalid extension phase '{0}' (expected 'compile-time' or 'runtime')")]
    InvalidPhase(String),

    #[error("invalid extension kind '{0}' (expected 'tag' or 'filter')")]
    InvalidKind(String),

    #[error("duplicate {phase} {kind} extension '{name}'")]
    Duplicate {
        phase: Phase,
        kind: ExtensionKind,
        name: String,
    },

    #[error("'{0}' is not a valid extension name")]
    InvalidName(String),

    #[error("extension name '{0}' is reserved by the template language")]
    ReservedName(String),

    #[error("no built-in {phase} {kind} extension named '{name}'")]
    UnknownExtension {
        phase: Phase,
        kind: ExtensionKind,
        name: String,
    },

    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration TOML: {0}")]
    Toml(#[from] toml::de::Error),
}

/// What kind of symbol a template referenced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Tag,
    Filter,
}

impl std::fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SymbolKind::Tag => write!(f, "tag"),
            SymbolKind::Filter => write!(f, "filter"),
        }
    }
}

/// Errors returned synchronously from compilation
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("parse errors: {}", format_parse_errors(.0))]
    Parse(Vec<ParseError>),

    #[error("unresolved {kind} '{name}' at {span:?}")]
    Unresolved {
        kind: SymbolKind,
        name: String,
        span: Span,
    },
}

impl From<Vec<ParseError>> for CompileError {
    fn from(errors: Vec<ParseError>) -> Self {
        CompileError::Parse(errors)
    }
}

impl CompileError {
    /// Name of the first tag or filter the template uses without a registration
    pub fn unresolved_symbol(&self) -> Option<&str> {
        match self {
            CompileError::Unresolved { name, .. } => Some(name),
            CompileError::Parse(errors) => errors.iter().find_map(|e| match e {
                ParseError::UnknownTag { name, .. } => Some(name.as_str()),
                _ => None,
            }),
        }
    }
}

fn format_parse_errors(errors: &[ParseError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
