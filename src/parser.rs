//! Token stream to tree, resolving identifiers against the environment.
//!
//! The surface grammar is prefix (S-expression) form `(operator arg...)`
//! with one special form, `(if cond then else)`. A parenthesized run of
//! same-typed literals is recognized positionally as a single list constant
//! rather than a call. The infix surface lives in [`infix`] and produces the
//! same tree; everything downstream of the parser is shared.
use crate::{
    ast::{AstNode, NodeCore},
    env::Environment,
    lexer::{Span, Token},
    value::Value,
};

pub mod infix;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("unexpected `)`")]
    UnbalancedClose { span: Span },
    #[error("missing `)` before end of input")]
    UnbalancedOpen { span: Span },
    #[error("expected an expression")]
    ExpectedExpression { span: Span },
    #[error("expected an operator name after `(`")]
    ExpectedOperator { span: Span },
    #[error("`()` is not an expression")]
    EmptyForm { span: Span },
    #[error("`if` takes exactly 3 arguments, got {got}")]
    IfArity { got: usize, span: Span },
    #[error("mismatched element types inside literal list")]
    MismatchedListElement { span: Span },
    #[error("unknown identifier `{name}`")]
    UnknownIdentifier { name: Box<str>, span: Span },
    #[error("unknown operator `{name}`")]
    UnknownOperator { name: Box<str>, span: Span },
    #[error("unexpected trailing input")]
    TrailingTokens { span: Span },
}

impl ParseError {
    pub fn span(&self) -> Span {
        match self {
            Self::UnbalancedClose { span }
            | Self::UnbalancedOpen { span }
            | Self::ExpectedExpression { span }
            | Self::ExpectedOperator { span }
            | Self::EmptyForm { span }
            | Self::IfArity { span, .. }
            | Self::MismatchedListElement { span }
            | Self::UnknownIdentifier { span, .. }
            | Self::UnknownOperator { span, .. }
            | Self::TrailingTokens { span } => span.clone(),
        }
    }
}

/// Parse a full prefix-form expression; trailing tokens are an error.
pub(crate) fn parse(tokens: &[(Token, Span)], env: &Environment) -> Result<AstNode, ParseError> {
    let mut parser = Parser::new(tokens, env);
    let node = parser.expression()?;
    parser.expect_end()?;
    Ok(node)
}

pub(crate) struct Parser<'a> {
    tokens: Vec<&'a (Token, Span)>,
    pos: usize,
    env: &'a Environment,
}

impl<'a> Parser<'a> {
    pub(crate) fn new(tokens: &'a [(Token, Span)], env: &'a Environment) -> Self {
        // comments only matter to the directive scan, which runs earlier
        let tokens = tokens
            .iter()
            .filter(|(t, _)| !matches!(t, Token::Comment(_)))
            .collect();
        Self {
            tokens,
            pos: 0,
            env,
        }
    }

    fn peek(&self) -> Option<&'a (Token, Span)> {
        self.tokens.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<&'a (Token, Span)> {
        let tok = self.tokens.get(self.pos).copied();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    /// Span to blame when input ends unexpectedly.
    fn end_span(&self) -> Span {
        self.tokens
            .last()
            .map(|(_, s)| s.clone())
            .unwrap_or(0..0)
    }

    pub(crate) fn expect_end(&mut self) -> Result<(), ParseError> {
        match self.peek() {
            None => Ok(()),
            Some((_, span)) => Err(ParseError::TrailingTokens { span: span.clone() }),
        }
    }

    pub(crate) fn expression(&mut self) -> Result<AstNode, ParseError> {
        match self.next() {
            None => Err(ParseError::ExpectedExpression {
                span: self.end_span(),
            }),
            Some((Token::Integer(n), span)) => {
                Ok(AstNode::constant(Value::Int(*n), span.clone()))
            }
            Some((Token::Str(s), span)) => {
                Ok(AstNode::constant(Value::str(s), span.clone()))
            }
            Some((Token::Ident(name), span)) => self.resolve_identifier(name, span.clone()),
            Some((Token::LParen, open)) => self.form(open.clone()),
            Some((Token::RParen, span)) => {
                Err(ParseError::UnbalancedClose { span: span.clone() })
            }
            Some((Token::Comment(_), _)) => unreachable!("comments are filtered"),
        }
    }

    /// Resolution priority: boolean literal, environment constant,
    /// environment variable, then (if enabled) a free variable.
    pub(crate) fn resolve_identifier(
        &self,
        name: &str,
        span: Span,
    ) -> Result<AstNode, ParseError> {
        match name {
            "true" => return Ok(AstNode::constant(Value::Bool(true), span)),
            "false" => return Ok(AstNode::constant(Value::Bool(false), span)),
            _ => {}
        }
        if let Some(value) = self.env.constant(name) {
            return Ok(AstNode::constant(value.clone(), span));
        }
        if let Some(key) = self.env.variable_key(name) {
            return Ok(AstNode::new(
                NodeCore::Variable {
                    name: Box::from(name),
                    key: Some(key),
                },
                Vec::new(),
                span,
            ));
        }
        if self.env.options.free_variables {
            return Ok(AstNode::new(
                NodeCore::Variable {
                    name: Box::from(name),
                    key: None,
                },
                Vec::new(),
                span,
            ));
        }
        Err(ParseError::UnknownIdentifier {
            name: Box::from(name),
            span,
        })
    }

    fn form(&mut self, open: Span) -> Result<AstNode, ParseError> {
        match self.peek() {
            None => Err(ParseError::UnbalancedOpen { span: open }),
            Some((Token::RParen, span)) => Err(ParseError::EmptyForm {
                span: open.start..span.end,
            }),
            Some((Token::Integer(_) | Token::Str(_), _)) => self.literal_list(open),
            Some((Token::Ident(name), head_span)) => {
                let (name, head_span) = (name.clone(), head_span.clone());
                self.pos += 1;
                self.call(&name, open, head_span)
            }
            Some((Token::LParen, span)) => Err(ParseError::ExpectedOperator {
                span: span.clone(),
            }),
            Some((Token::Comment(_), _)) => unreachable!("comments are filtered"),
        }
    }

    /// `(1 2 3)` or `("a" "b")`: a run of same-typed literals becomes one
    /// list constant, not nested call nodes.
    fn literal_list(&mut self, open: Span) -> Result<AstNode, ParseError> {
        let mut items: Vec<Value> = Vec::new();
        loop {
            match self.next() {
                None => return Err(ParseError::UnbalancedOpen { span: open }),
                Some((Token::RParen, close)) => {
                    let span = open.start..close.end;
                    return Ok(AstNode::constant(Value::List(items.into()), span));
                }
                Some((Token::Integer(n), span)) => {
                    if matches!(items.first(), Some(Value::Str(_))) {
                        return Err(ParseError::MismatchedListElement { span: span.clone() });
                    }
                    items.push(Value::Int(*n));
                }
                Some((Token::Str(s), span)) => {
                    if matches!(items.first(), Some(Value::Int(_))) {
                        return Err(ParseError::MismatchedListElement { span: span.clone() });
                    }
                    items.push(Value::str(s));
                }
                Some((_, span)) => {
                    return Err(ParseError::MismatchedListElement { span: span.clone() })
                }
            }
        }
    }

    fn call(&mut self, name: &str, open: Span, head_span: Span) -> Result<AstNode, ParseError> {
        let mut args = Vec::new();
        let close = loop {
            match self.peek() {
                None => return Err(ParseError::UnbalancedOpen { span: open }),
                Some((Token::RParen, span)) => {
                    self.pos += 1;
                    break span.clone();
                }
                Some(_) => args.push(self.expression()?),
            }
        };
        let span = open.start..close.end;
        if name == "if" {
            if args.len() != 3 {
                return Err(ParseError::IfArity {
                    got: args.len(),
                    span,
                });
            }
            return Ok(AstNode::new(NodeCore::Conditional, args, span));
        }
        let Some(op) = self.env.operator(name) else {
            return Err(ParseError::UnknownOperator {
                name: Box::from(name),
                span: head_span,
            });
        };
        Ok(AstNode::new(
            NodeCore::Operator {
                name: Box::from(name),
                op,
            },
            args,
            span,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;
    use assert2::{check, let_assert};

    fn env() -> Environment {
        Environment::builder()
            .variable("age")
            .variable("country")
            .constant("limit", 21i64)
            .freeze()
    }

    fn parse_str(src: &str) -> Result<AstNode, ParseError> {
        parse(&lex(src).unwrap(), &env())
    }

    #[test]
    fn parses_nested_calls() {
        let_assert!(Ok(node) = parse_str("(and (<= age limit) (= country \"SE\"))"));
        let_assert!(NodeCore::Operator { name, .. } = &node.core);
        check!(name.as_ref() == "and");
        check!(node.args.len() == 2);
        let_assert!(NodeCore::Operator { name, .. } = &node.args[0].core);
        check!(name.as_ref() == "<=");
        // `limit` resolved to its constant value
        let_assert!(NodeCore::Constant(Value::Int(21)) = &node.args[0].args[1].core);
    }

    #[test]
    fn variables_resolve_to_their_keys() {
        let_assert!(Ok(node) = parse_str("age"));
        let_assert!(NodeCore::Variable { name, key } = &node.core);
        check!(name.as_ref() == "age");
        check!(*key == Some(0));
    }

    #[test]
    fn unknown_identifiers_are_fatal_unless_free_variables() {
        let_assert!(Err(ParseError::UnknownIdentifier { name, .. }) = parse_str("(= tier 1)"));
        check!(name.as_ref() == "tier");

        let mut free = env();
        free.options.free_variables = true;
        let_assert!(Ok(node) = parse(&lex("tier").unwrap(), &free));
        let_assert!(NodeCore::Variable { key: None, .. } = &node.core);
    }

    #[test]
    fn literal_lists_become_single_constants() {
        let_assert!(Ok(node) = parse_str("(in age (18 21 25))"));
        let_assert!(NodeCore::Constant(Value::List(items)) = &node.args[1].core);
        check!(items.len() == 3);

        let_assert!(
            Err(ParseError::MismatchedListElement { .. }) = parse_str("(in age (18 \"a\"))")
        );
    }

    #[test]
    fn if_requires_exactly_three_arguments() {
        let_assert!(Ok(node) = parse_str("(if (<= age 3) 1 2)"));
        let_assert!(NodeCore::Conditional = &node.core);
        check!(node.args.len() == 3);
        let_assert!(Err(ParseError::IfArity { got: 2, .. }) = parse_str("(if true 1)"));
    }

    #[test]
    fn paren_errors_are_position_annotated() {
        let_assert!(Err(ParseError::UnbalancedOpen { .. }) = parse_str("(and age"));
        let_assert!(Err(ParseError::UnbalancedClose { span }) = parse_str(")"));
        check!(span == (0..1));
        let_assert!(Err(ParseError::TrailingTokens { .. }) = parse_str("age age"));
        let_assert!(Err(ParseError::EmptyForm { .. }) = parse_str("()"));
    }

    #[test]
    fn unknown_operator_at_call_head() {
        let_assert!(Err(ParseError::UnknownOperator { name, .. }) = parse_str("(frob age)"));
        check!(name.as_ref() == "frob");
    }
}
