//! Structural bounds enforced before linearization.
//!
//! The program's index arithmetic assumes operand counts fit in a signed
//! 8-bit value and instruction indices in a signed 16-bit value. The
//! checker proves both before the builder commits to those widths.
use crate::{
    ast::{AstNode, NodeCore},
    lexer::Span,
};

/// Maximum operand count of a single operator node.
pub const MAX_ARITY: usize = 127;
/// Maximum instruction count of a compiled program.
pub const MAX_PROGRAM_LEN: usize = 32767;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BoundsError {
    #[error("operator `{name}` has {got} operands, more than the limit of 127")]
    Arity {
        name: Box<str>,
        got: usize,
        span: Span,
    },
    #[error("expression needs {got} instructions, more than the limit of 32767")]
    ProgramLen { got: usize },
}

pub(crate) fn check(node: &AstNode) -> Result<(), BoundsError> {
    let mut slots = 0usize;
    count(node, &mut slots)?;
    if slots > MAX_PROGRAM_LEN {
        return Err(BoundsError::ProgramLen { got: slots });
    }
    Ok(())
}

/// Counts the instruction slots a node will occupy. The arity check runs
/// before descending, so an oversized node fails without completing the
/// count below it.
fn count(node: &AstNode, slots: &mut usize) -> Result<(), BoundsError> {
    match &node.core {
        NodeCore::Operator { name, .. } | NodeCore::FastOperator { name, .. } => {
            if node.args.len() > MAX_ARITY {
                return Err(BoundsError::Arity {
                    name: name.clone(),
                    got: node.args.len(),
                    span: node.span.clone(),
                });
            }
            *slots += 1;
        }
        // a conditional occupies two slots: the branch dispatcher and the
        // end marker closing its true branch
        NodeCore::Conditional => *slots += 2,
        NodeCore::Constant(_) | NodeCore::Variable { .. } => *slots += 1,
    }
    for child in &node.args {
        count(child, slots)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{env::Environment, lexer::lex, parser};
    use assert2::{check, let_assert};

    fn parsed(src: &str) -> AstNode {
        let env = Environment::builder().variable("x").freeze();
        parser::parse(&lex(src).unwrap(), &env).unwrap()
    }

    #[test]
    fn counts_conditionals_as_two_slots() {
        let node = parsed("(if x 1 2)");
        let mut slots = 0;
        count(&node, &mut slots).unwrap();
        check!(slots == 5);
    }

    #[test]
    fn arity_ceiling() {
        let wide = format!("(+ {})", vec!["x"; 128].join(" "));
        let_assert!(Err(BoundsError::Arity { name, got: 128, .. }) = check(&parsed(&wide)));
        check!(name.as_ref() == "+");

        let ok = format!("(+ {})", vec!["x"; 127].join(" "));
        check!(check(&parsed(&ok)) == Ok(()));
    }
}
