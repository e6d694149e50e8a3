//! The tree form an expression takes between parsing and linearization.
use crate::{lexer::Span, ops::OpImpl, value::Value};

/// One node of the compile-time expression tree.
///
/// The tree is owned by the compile call that produced it; optimization
/// passes rewrite it in place and the linearizer reads it once. `cost` is
/// scratch state written by the reordering pass and meaningless outside it.
#[derive(Debug)]
pub struct AstNode {
    pub core: NodeCore,
    /// Children in source order. `Conditional` always has exactly three:
    /// condition, true branch, false branch.
    pub args: Vec<AstNode>,
    pub span: Span,
    pub cost: f64,
}

#[derive(Debug)]
pub enum NodeCore {
    /// A literal, including folded results and literal lists.
    Constant(Value),
    /// A resolved binding reference. `key` is the compile-time slot handle;
    /// free variables (when the environment allows them) carry `None` and
    /// resolve by name at evaluation time.
    Variable { name: Box<str>, key: Option<u32> },
    /// An n-ary call to a registered operator.
    Operator { name: Box<str>, op: OpImpl },
    /// A binary call whose two operands are provably leaves; the linearizer
    /// emits it ahead of its operands so the evaluator can read them from
    /// fixed adjacent slots.
    FastOperator { name: Box<str>, op: OpImpl },
    /// `(if cond then else)`.
    Conditional,
}

impl AstNode {
    pub fn new(core: NodeCore, args: Vec<AstNode>, span: Span) -> Self {
        Self {
            core,
            args,
            span,
            cost: 0.0,
        }
    }

    pub fn constant(value: Value, span: Span) -> Self {
        Self::new(NodeCore::Constant(value), Vec::new(), span)
    }

    pub fn is_leaf(&self) -> bool {
        matches!(
            self.core,
            NodeCore::Constant(_) | NodeCore::Variable { .. }
        )
    }

    /// The boolean connective this node is, if any. Fast-path tagging does
    /// not change what a node means, so both operator shapes qualify.
    pub fn connective(&self) -> Option<Connective> {
        match &self.core {
            NodeCore::Operator { name, .. } | NodeCore::FastOperator { name, .. } => {
                match name.as_ref() {
                    "and" => Some(Connective::And),
                    "or" => Some(Connective::Or),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// The identifier used for cost lookups and error messages: a variable
    /// or operator name, or the rendered literal for constants.
    pub fn ident(&self) -> String {
        match &self.core {
            NodeCore::Constant(v) => v.to_string(),
            NodeCore::Variable { name, .. } => name.to_string(),
            NodeCore::Operator { name, .. } | NodeCore::FastOperator { name, .. } => {
                name.to_string()
            }
            NodeCore::Conditional => "if".to_string(),
        }
    }
}

/// `and` short-circuits on `false`, `or` on `true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connective {
    And,
    Or,
}
