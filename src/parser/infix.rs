//! Infix surface syntax.
//!
//! A Pratt parser over the same token stream as the prefix form, producing
//! the same tree; the compiler core never knows which surface was used.
//! Binary operators are the registered names with entries in the fixed
//! precedence table below; `not` is prefix; parentheses group. The special
//! form `if` and n-ary calls remain prefix-only surface.
use crate::{
    ast::{AstNode, NodeCore},
    env::Environment,
    lexer::{Span, Token},
};

use super::{ParseError, Parser};

/// Left binding powers; right is always `left + 1` (left associative).
fn binding_power(name: &str) -> Option<u8> {
    Some(match name {
        "or" => 1,
        "and" => 3,
        "=" | "!=" | "<" | "<=" | ">" | ">=" | "in" | "matches" | "ver<" | "ver<=" | "ver>"
        | "ver>=" | "date<" | "date<=" | "date>" | "date>=" => 5,
        "+" | "-" => 7,
        "*" | "/" | "%" => 9,
        _ => return None,
    })
}

// `not` binds tighter than `and`/`or`, looser than comparisons
const NOT_POWER: u8 = 5;

pub(crate) fn parse(tokens: &[(Token, Span)], env: &Environment) -> Result<AstNode, ParseError> {
    let mut parser = Parser::new(tokens, env);
    let node = expression(&mut parser, 0)?;
    parser.expect_end()?;
    Ok(node)
}

fn expression(parser: &mut Parser<'_>, min_power: u8) -> Result<AstNode, ParseError> {
    let mut lhs = primary(parser)?;
    loop {
        let Some((Token::Ident(name), span)) = parser.peek() else {
            break;
        };
        let Some(power) = binding_power(name) else {
            break;
        };
        if power < min_power {
            break;
        }
        let (name, head_span) = (name.clone(), span.clone());
        parser.pos += 1;
        let op = parser
            .env
            .operator(&name)
            .ok_or_else(|| ParseError::UnknownOperator {
                name: name.clone(),
                span: head_span,
            })?;
        let rhs = expression(parser, power + 1)?;
        let span = lhs.span.start..rhs.span.end;
        lhs = AstNode::new(
            NodeCore::Operator { name, op },
            vec![lhs, rhs],
            span,
        );
    }
    Ok(lhs)
}

fn primary(parser: &mut Parser<'_>) -> Result<AstNode, ParseError> {
    match parser.peek() {
        Some((Token::Ident(name), span)) if name.as_ref() == "not" => {
            let (name, head_span) = (name.clone(), span.clone());
            parser.pos += 1;
            let op = parser
                .env
                .operator(&name)
                .ok_or_else(|| ParseError::UnknownOperator {
                    name: name.clone(),
                    span: head_span.clone(),
                })?;
            let arg = expression(parser, NOT_POWER)?;
            let span = head_span.start..arg.span.end;
            Ok(AstNode::new(NodeCore::Operator { name, op }, vec![arg], span))
        }
        Some((Token::LParen, open)) => {
            let open = open.clone();
            parser.pos += 1;
            // a paren opening on a literal is a list constant, as in the
            // prefix form; grouping starts with an identifier or `(`
            if matches!(parser.peek(), Some((Token::Integer(_) | Token::Str(_), _))) {
                return parser.literal_list(open);
            }
            let inner = expression(parser, 0)?;
            match parser.next() {
                Some((Token::RParen, _)) => Ok(inner),
                Some((_, span)) => Err(ParseError::TrailingTokens { span: span.clone() }),
                None => Err(ParseError::UnbalancedOpen { span: open }),
            }
        }
        _ => parser.expression(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lexer::lex, value::Value};
    use assert2::{check, let_assert};

    fn env() -> Environment {
        Environment::builder()
            .variable("age")
            .variable("country")
            .freeze()
    }

    fn parse_str(src: &str) -> Result<AstNode, ParseError> {
        parse(&lex(src).unwrap(), &env())
    }

    fn render(node: &AstNode) -> String {
        match &node.core {
            NodeCore::Constant(v) => v.to_string(),
            NodeCore::Variable { name, .. } => name.to_string(),
            NodeCore::Operator { name, .. } | NodeCore::FastOperator { name, .. } => {
                let args: Vec<_> = node.args.iter().map(render).collect();
                format!("({} {})", name, args.join(" "))
            }
            NodeCore::Conditional => {
                let args: Vec<_> = node.args.iter().map(render).collect();
                format!("(if {})", args.join(" "))
            }
        }
    }

    #[test]
    fn precedence_and_grouping() {
        let_assert!(Ok(node) = parse_str("age >= 18 and country = \"SE\" or age > 65"));
        check!(
            render(&node) == "(or (and (>= age 18) (= country \"SE\")) (> age 65))"
        );

        let_assert!(Ok(node) = parse_str("(age + 1) * 2"));
        check!(render(&node) == "(* (+ age 1) 2)");
    }

    #[test]
    fn arithmetic_is_left_associative() {
        let_assert!(Ok(node) = parse_str("10 - 3 - 2"));
        check!(render(&node) == "(- (- 10 3) 2)");
    }

    #[test]
    fn not_binds_between_connectives_and_comparisons() {
        let_assert!(Ok(node) = parse_str("not age = 1 and true"));
        check!(render(&node) == "(and (not (= age 1)) true)");
    }

    #[test]
    fn same_tree_as_prefix_form() {
        let infix = parse_str("age >= 18 and age < 65").unwrap();
        let prefix =
            super::super::parse(&lex("(and (>= age 18) (< age 65))").unwrap(), &env()).unwrap();
        check!(render(&infix) == render(&prefix));
    }

    #[test]
    fn literal_runs_in_parens_are_lists() {
        let_assert!(Ok(node) = parse_str("age in (18 21)"));
        let_assert!(NodeCore::Operator { name, .. } = &node.core);
        check!(name.as_ref() == "in");
        let_assert!(NodeCore::Constant(Value::List(items)) = &node.args[1].core);
        check!(items.as_ref() == [Value::Int(18), Value::Int(21)]);
    }
}
