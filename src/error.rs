//! The compile-call error surface.
use crate::{
    checker::BoundsError,
    env::DirectiveError,
    lexer::{LexError, Span},
    parser::ParseError,
};

/// Any way a source text can fail to become a [`Program`].
///
/// [`Program`]: crate::program::Program
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("{error}")]
    Lex { error: LexError, span: Span },
    #[error(transparent)]
    Directive(#[from] DirectiveError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Bounds(#[from] BoundsError),
}

impl From<(LexError, Span)> for CompileError {
    fn from((error, span): (LexError, Span)) -> Self {
        Self::Lex { error, span }
    }
}

impl CompileError {
    /// Byte range of the offending source, when one is known.
    pub fn span(&self) -> Option<Span> {
        match self {
            Self::Lex { span, .. } => Some(span.clone()),
            Self::Directive(error) => Some(error.span()),
            Self::Parse(error) => Some(error.span()),
            Self::Bounds(BoundsError::Arity { span, .. }) => Some(span.clone()),
            Self::Bounds(BoundsError::ProgramLen { .. }) => None,
        }
    }
}
