//! Compile-time environments.
//!
//! An [`Environment`] is a frozen snapshot: constants, variable keys, custom
//! operators, the cost model and the pass options. It is produced once by an
//! [`EnvironmentBuilder`] and never mutated afterwards; `compile` clones the
//! snapshot before applying per-source directives, so registration of ad hoc
//! operators for one caller can never leak into another's compile.
use std::collections::{HashMap, HashSet};

use crate::{
    lexer::{Span, Token},
    ops::{self, CustomFn, OpImpl},
    value::Value,
};

/// Which optimization passes run, plus the parser- and debug-level switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// NestingReduction: flatten associative `and`/`or` chains.
    pub flatten: bool,
    /// ConstantFolding.
    pub fold: bool,
    /// FastPathTagging.
    pub fastpath: bool,
    /// Cost-based reordering of `and`/`or` operands.
    pub reorder: bool,
    /// Accept variable names the environment does not know; they resolve by
    /// name against the binding at evaluation time.
    pub free_variables: bool,
    /// Interleave non-executing trace shadows into the compiled program.
    pub trace: bool,
    /// Parse infix surface syntax instead of the prefix form.
    pub infix: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            flatten: true,
            fold: true,
            fastpath: true,
            reorder: true,
            free_variables: false,
            trace: false,
            infix: false,
        }
    }
}

impl Options {
    /// All optimization passes off; parser and debug switches untouched.
    pub fn without_optimizations(mut self) -> Self {
        self.flatten = false;
        self.fold = false;
        self.fastpath = false;
        self.reorder = false;
        self
    }
}

/// Caller-supplied operation costs consulted by the reordering pass.
///
/// Lookup precedence, most specific first: structural signature (only for
/// nodes directly under a boolean connective), exact identifier, node-kind
/// category, hard-coded default. Signature keys have the shape
/// `parent/ident(child,child,...)`, e.g. `and/=(v1,1)`.
#[derive(Debug, Clone, Default)]
pub struct CostModel {
    exact: HashMap<Box<str>, f64>,
    signature: HashMap<Box<str>, f64>,
    category: HashMap<CostCategory, f64>,
}

/// Node-kind categories for coarse cost overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CostCategory {
    Constant,
    Variable,
    Operator,
    FastOperator,
    Conditional,
}

/// Operation cost applied when no table matches.
pub const DEFAULT_OP_COST: f64 = 10.0;

impl CostModel {
    pub fn set_exact(&mut self, ident: impl AsRef<str>, cost: f64) {
        self.exact.insert(Box::from(ident.as_ref()), cost);
    }

    pub fn set_signature(&mut self, signature: impl AsRef<str>, cost: f64) {
        self.signature.insert(Box::from(signature.as_ref()), cost);
    }

    pub fn set_category(&mut self, category: CostCategory, cost: f64) {
        self.category.insert(category, cost);
    }

    /// Resolve the operation cost for a node. `signature` is only given for
    /// nodes sitting directly under `and`/`or`.
    pub(crate) fn operation_cost(
        &self,
        signature: Option<&str>,
        ident: &str,
        category: CostCategory,
    ) -> f64 {
        if let Some(cost) = signature.and_then(|sig| self.signature.get(sig)) {
            return *cost;
        }
        if let Some(cost) = self.exact.get(ident) {
            return *cost;
        }
        if let Some(cost) = self.category.get(&category) {
            return *cost;
        }
        if category == CostCategory::Constant {
            // a literal costs nothing beyond its base
            0.0
        } else {
            DEFAULT_OP_COST
        }
    }
}

/// Frozen compile-time environment. Cloning is cheap enough to do once per
/// compile call (custom operators are shared behind `Arc`).
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub(crate) constants: HashMap<Box<str>, Value>,
    pub(crate) variables: HashMap<Box<str>, u32>,
    pub(crate) operators: HashMap<Box<str>, OpImpl>,
    pub(crate) stateless: HashSet<Box<str>>,
    pub costs: CostModel,
    pub options: Options,
}

impl Environment {
    pub fn builder() -> EnvironmentBuilder {
        EnvironmentBuilder::default()
    }

    pub fn constant(&self, name: &str) -> Option<&Value> {
        self.constants.get(name)
    }

    pub fn variable_key(&self, name: &str) -> Option<u32> {
        self.variables.get(name).copied()
    }

    /// Look up an operator: custom registrations first, then the built-in
    /// table. Collisions are rejected at registration time, so the order
    /// here is never observable.
    pub fn operator(&self, name: &str) -> Option<OpImpl> {
        self.operators
            .get(name)
            .cloned()
            .or_else(|| ops::builtin(name))
    }

    /// Whether folding may invoke this operator at compile time. Built-ins
    /// are pure by construction; custom operators must be declared so.
    pub fn is_stateless(&self, name: &str) -> bool {
        if self.operators.contains_key(name) {
            self.stateless.contains(name)
        } else {
            ops::BUILTINS.contains_key(name)
        }
    }
}

/// Accumulates registrations, then freezes into an [`Environment`].
#[derive(Debug, Default)]
pub struct EnvironmentBuilder {
    env: Environment,
    next_key: u32,
}

impl EnvironmentBuilder {
    pub fn constant(mut self, name: impl AsRef<str>, value: impl Into<Value>) -> Self {
        self.env
            .constants
            .insert(Box::from(name.as_ref()), value.into());
        self
    }

    /// Declare a variable with an explicit slot key.
    pub fn variable_keyed(mut self, name: impl AsRef<str>, key: u32) -> Self {
        self.env.variables.insert(Box::from(name.as_ref()), key);
        self.next_key = self.next_key.max(key + 1);
        self
    }

    /// Declare a variable with the next sequential slot key.
    pub fn variable(self, name: impl AsRef<str>) -> Self {
        let key = self.next_key;
        self.variable_keyed(name, key)
    }

    /// Register a custom operator. Colliding with a built-in or an earlier
    /// registration is a configuration error, never a silent overwrite.
    pub fn operator(
        &mut self,
        name: impl AsRef<str>,
        stateless: bool,
        f: CustomFn,
    ) -> Result<(), RegistryError> {
        let name = name.as_ref();
        if ops::BUILTINS.contains_key(name) || self.env.operators.contains_key(name) {
            return Err(RegistryError::Duplicate(Box::from(name)));
        }
        self.env.operators.insert(Box::from(name), OpImpl::Custom(f));
        if stateless {
            self.env.stateless.insert(Box::from(name));
        }
        Ok(())
    }

    pub fn options(mut self, options: Options) -> Self {
        self.env.options = options;
        self
    }

    pub fn costs(mut self, costs: CostModel) -> Self {
        self.env.costs = costs;
        self
    }

    pub fn freeze(self) -> Environment {
        self.env
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("operator `{0}` is already registered")]
    Duplicate(Box<str>),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DirectiveError {
    #[error("unknown directive key `{key}`")]
    UnknownKey { key: Box<str>, span: Span },
    #[error("directive `{key}` needs a boolean value, got `{value}`")]
    BadValue {
        key: Box<str>,
        value: Box<str>,
        span: Span,
    },
    #[error("malformed directive entry `{entry}`")]
    Malformed { entry: Box<str>, span: Span },
}

impl DirectiveError {
    pub fn span(&self) -> Span {
        match self {
            Self::UnknownKey { span, .. }
            | Self::BadValue { span, .. }
            | Self::Malformed { span, .. } => span.clone(),
        }
    }
}

/// Apply the leading-comment directive block to this compile's options.
///
/// Only comments before the first non-comment token participate. A comment
/// without a `:` is prose and ignored; one with a `:` must be a
/// comma-separated list of `key: bool` pairs.
pub(crate) fn apply_directives(
    options: &mut Options,
    tokens: &[(Token, Span)],
) -> Result<(), DirectiveError> {
    for (token, span) in tokens {
        let Token::Comment(text) = token else {
            break;
        };
        if !text.contains(':') {
            continue;
        }
        for entry in text.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let Some((key, value)) = entry.split_once(':') else {
                return Err(DirectiveError::Malformed {
                    entry: Box::from(entry),
                    span: span.clone(),
                });
            };
            let (key, value) = (key.trim(), value.trim());
            let enabled = match value {
                "true" => true,
                "false" => false,
                _ => {
                    return Err(DirectiveError::BadValue {
                        key: Box::from(key),
                        value: Box::from(value),
                        span: span.clone(),
                    })
                }
            };
            match key {
                "flatten" => options.flatten = enabled,
                "fold" => options.fold = enabled,
                "fastpath" => options.fastpath = enabled,
                "reorder" => options.reorder = enabled,
                "optimize" => {
                    options.flatten = enabled;
                    options.fold = enabled;
                    options.fastpath = enabled;
                    options.reorder = enabled;
                }
                "trace" => options.trace = enabled,
                _ => {
                    return Err(DirectiveError::UnknownKey {
                        key: Box::from(key),
                        span: span.clone(),
                    })
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::lex;
    use assert2::{check, let_assert};
    use std::sync::Arc;

    #[test]
    fn duplicate_operator_registration_is_rejected() {
        let mut builder = Environment::builder();
        let f: CustomFn = Arc::new(|_, _| Ok(Value::Bool(true)));
        check!(builder.operator("always", true, f.clone()) == Ok(()));
        let_assert!(Err(RegistryError::Duplicate(name)) = builder.operator("always", true, f.clone()));
        check!(name.as_ref() == "always");
        // built-ins are protected too
        let_assert!(Err(RegistryError::Duplicate(_)) = builder.operator("and", true, f));
    }

    #[test]
    fn custom_operators_are_stateful_unless_declared() {
        let mut builder = Environment::builder();
        let f: CustomFn = Arc::new(|_, _| Ok(Value::Int(0)));
        builder.operator("roll", false, f).unwrap();
        let env = builder.freeze();
        check!(!env.is_stateless("roll"));
        check!(env.is_stateless("+"));
    }

    #[test]
    fn directives_override_options() {
        let mut options = Options::default();
        let tokens = lex("; fold: false, reorder: false\n(+ 1 1)").unwrap();
        apply_directives(&mut options, &tokens).unwrap();
        check!(!options.fold);
        check!(!options.reorder);
        check!(options.flatten);
    }

    #[test]
    fn group_directive_covers_all_passes() {
        let mut options = Options::default();
        let tokens = lex("; optimize: false\n1").unwrap();
        apply_directives(&mut options, &tokens).unwrap();
        check!(options == Options::default().without_optimizations());
    }

    #[test]
    fn prose_comments_are_ignored_but_bad_pairs_are_not() {
        let mut options = Options::default();
        let tokens = lex("; checks the age gate\n1").unwrap();
        check!(apply_directives(&mut options, &tokens) == Ok(()));

        let tokens = lex("; fold: maybe\n1").unwrap();
        let_assert!(
            Err(DirectiveError::BadValue { key, .. }) = apply_directives(&mut options, &tokens)
        );
        check!(key.as_ref() == "fold");

        let tokens = lex("; speed: true\n1").unwrap();
        let_assert!(
            Err(DirectiveError::UnknownKey { key, .. }) = apply_directives(&mut options, &tokens)
        );
        check!(key.as_ref() == "speed");
    }

    #[test]
    fn only_leading_comments_participate() {
        let mut options = Options::default();
        let tokens = lex("1 ; fold: nonsense").unwrap();
        check!(apply_directives(&mut options, &tokens) == Ok(()));
    }

    #[test]
    fn signature_costs_beat_exact_costs() {
        let mut costs = CostModel::default();
        costs.set_exact("=", 5.0);
        costs.set_signature("and/=(v1,1)", 90.0);
        let got = costs.operation_cost(Some("and/=(v1,1)"), "=", CostCategory::Operator);
        check!(got == 90.0);
        let got = costs.operation_cost(Some("or/=(v1,1)"), "=", CostCategory::Operator);
        check!(got == 5.0);
        let got = costs.operation_cost(None, "<", CostCategory::Operator);
        check!(got == DEFAULT_OP_COST);
    }
}
