//! Parser for sqlweave templates

pub mod ast;
mod grammar;
pub mod lexer;
mod tree;

pub use ast::*;
pub use tree::{TagGrammar, TagGrammars};

/// Deepest block or expression nesting a template may use
pub const MAX_NESTING: usize = 64;

/// Parse template source into an AST
///
/// Extension tags are resolved against `grammars`; a tag without a
/// registered grammar is a [`ParseError::UnknownTag`](crate::ParseError).
pub fn parse<G: TagGrammars + ?Sized>(
    input: &str,
    grammars: &G,
) -> Result<Template, Vec<crate::ParseError>> {
    let chunks = grammar::parse_chunks(input)?;
    tree::build_tree(chunks, grammars).map_err(|e| vec![e])
}
