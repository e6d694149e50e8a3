//! Tokenization of rule-expression source text.
//!
//! The token set is deliberately small: parentheses, integers, strings,
//! identifiers and comments. Identifiers cover operator names such as `<=`
//! or `ver<` as well as variable and constant names, so the lexer never
//! needs to know what the environment will resolve a name to.
pub use logos::Span;
use logos::{Lexer, Logos};

fn parse_int(lexer: &mut Lexer<Token>) -> Result<i64, LexError> {
    lexer
        .slice()
        .parse::<i64>()
        .map_err(|_| LexError::IntegerOverflow)
}

fn unescape_string(lexer: &mut Lexer<Token>) -> Result<Box<str>, LexError> {
    // Strip the surrounding quotes
    let raw = &lexer.slice()[1..lexer.slice().len() - 1];
    let mut built = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(chr) = chars.next() {
        match chr {
            '\\' => match chars.next() {
                Some('"') => built.push('"'),
                Some('\\') => built.push('\\'),
                Some('n') => built.push('\n'),
                Some('t') => built.push('\t'),
                Some(c) => return Err(LexError::BadEscape(c)),
                None => return Err(LexError::BadEscape('\\')),
            },
            c => built.push(c),
        }
    }
    Ok(Box::from(built.as_str()))
}

fn comment_text(lexer: &mut Lexer<Token>) -> Box<str> {
    // Drop the leading `;` run and surrounding whitespace
    Box::from(lexer.slice().trim_start_matches(';').trim())
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+", error = LexError)]
pub enum Token {
    #[token("(")]
    LParen,

    #[token(")")]
    RParen,

    #[regex(r"-?[0-9]+", parse_int, priority = 10)]
    Integer(i64),

    #[regex(r#""([^"\\]|\\.)*""#, unescape_string)]
    Str(Box<str>),

    #[regex(
        r"[A-Za-z_+\-*/%<>=!?.][A-Za-z0-9_+\-*/%<>=!?.]*",
        |lex| Box::from(lex.slice())
    )]
    Ident(Box<str>),

    #[regex(r";[^\n]*", comment_text)]
    Comment(Box<str>),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Default)]
pub enum LexError {
    #[default]
    #[error("unexpected character")]
    Unexpected,
    #[error("invalid escape sequence `\\{0}` in string")]
    BadEscape(char),
    #[error("integer literal does not fit in 64 bits")]
    IntegerOverflow,
}

/// Tokenize a whole source string, keeping spans for error reporting.
pub fn lex(source: &str) -> Result<Vec<(Token, Span)>, (LexError, Span)> {
    let mut tokens = Vec::new();
    for (token, span) in Token::lexer(source).spanned() {
        match token {
            Ok(tok) => tokens.push((tok, span)),
            Err(err) => return Err((err, span)),
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::{check, let_assert};

    fn kinds(source: &str) -> Vec<Token> {
        lex(source).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn lexes_call_syntax() {
        check!(
            kinds("(<= age 3)")
                == vec![
                    Token::LParen,
                    Token::Ident(Box::from("<=")),
                    Token::Ident(Box::from("age")),
                    Token::Integer(3),
                    Token::RParen,
                ]
        );
    }

    #[test]
    fn negative_integers_are_single_tokens() {
        check!(kinds("-42") == vec![Token::Integer(-42)]);
        // a bare minus is an identifier (the subtraction operator)
        check!(kinds("-") == vec![Token::Ident(Box::from("-"))]);
    }

    #[test]
    fn strings_unescape() {
        check!(kinds(r#""a\"b\n""#) == vec![Token::Str(Box::from("a\"b\n"))]);
        let_assert!(Err((LexError::BadEscape('q'), _)) = lex(r#""\q""#));
    }

    #[test]
    fn comments_capture_their_text() {
        check!(
            kinds("; fold: false\n1")
                == vec![Token::Comment(Box::from("fold: false")), Token::Integer(1)]
        );
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let_assert!(Err((LexError::Unexpected, span)) = lex("\"oops"));
        check!(span.start == 0);
    }

    #[test]
    fn overflowing_integer_is_an_error() {
        let_assert!(Err((LexError::IntegerOverflow, _)) = lex("99999999999999999999"));
    }
}
