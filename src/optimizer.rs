//! Tree-rewriting passes between parsing and linearization.
//!
//! Every pass is a pure in-place transform and runs unconditionally unless
//! disabled, in fixed order: nesting reduction, constant folding, fast-path
//! tagging, cost-based reordering. None of them may change what an
//! expression evaluates to, only how much work evaluation does and which
//! short-circuit paths exist.
use crate::{
    ast::{AstNode, Connective, NodeCore},
    env::{CostCategory, Environment},
    ops::OpContext,
    value::Value,
};

pub(crate) fn run(env: &Environment, node: &mut AstNode) {
    let options = env.options;
    if options.flatten {
        flatten(node);
    }
    if options.fold {
        fold(env, node);
    }
    if options.fastpath {
        tag_fast_paths(node);
    }
    if options.reorder {
        assign_costs(env, node, None);
        reorder(node);
    }
    tracing::trace!(cost = node.cost, "optimizer passes done");
}

/// NestingReduction: splice same-kind boolean children into their parent,
/// flattening associative chains. All or nothing per node: the pass never
/// partially flattens.
fn flatten(node: &mut AstNode) {
    for child in &mut node.args {
        flatten(child);
    }
    let Some(kind) = node.connective() else {
        return;
    };
    let splicable = node
        .args
        .iter()
        .all(|child| child.is_leaf() || child.connective() == Some(kind));
    if !splicable {
        return;
    }
    let mut spliced = Vec::with_capacity(node.args.len());
    for child in node.args.drain(..) {
        if child.connective() == Some(kind) {
            spliced.extend(child.args);
        } else {
            spliced.push(child);
        }
    }
    node.args = spliced;
}

/// ConstantFolding, bottom-up. For `and`/`or`, a single constant child that
/// alone determines the result collapses the whole node even when other
/// children are not constant. Otherwise a stateless operator with all-constant
/// operands is invoked with a nil context; an error from the operator leaves
/// the node unfolded rather than failing the compile.
fn fold(env: &Environment, node: &mut AstNode) {
    for child in &mut node.args {
        fold(env, child);
    }
    let (name, op) = match &node.core {
        NodeCore::Operator { name, op } | NodeCore::FastOperator { name, op } => {
            (name.clone(), op.clone())
        }
        _ => return,
    };
    if let Some(kind) = node.connective() {
        let decider = match kind {
            Connective::And => false,
            Connective::Or => true,
        };
        let decided = node.args.iter().any(|child| {
            matches!(&child.core, NodeCore::Constant(Value::Bool(b)) if *b == decider)
        });
        if decided {
            node.core = NodeCore::Constant(Value::Bool(decider));
            node.args.clear();
            return;
        }
    }
    if !env.is_stateless(&name) {
        return;
    }
    let constants: Option<Vec<Value>> = node
        .args
        .iter()
        .map(|child| match &child.core {
            NodeCore::Constant(v) => Some(v.clone()),
            _ => None,
        })
        .collect();
    let Some(args) = constants else {
        return;
    };
    match op.invoke(&OpContext::NIL, &args) {
        Ok(value) => {
            node.core = NodeCore::Constant(value);
            node.args.clear();
        }
        // folding is best-effort; the unfolded node keeps its meaning
        Err(_) => {}
    }
}

/// FastPathTagging: a binary operator whose operands are both leaves is
/// retagged so the linearizer can lay its operands out inline. Purely a
/// representation choice, semantics are unchanged. `and`/`or` are never
/// tagged: the fast call resolves both operand slots up front, which would
/// force a variable fetch a short-circuit must skip.
fn tag_fast_paths(node: &mut AstNode) {
    for child in &mut node.args {
        tag_fast_paths(child);
    }
    let retag = match &node.core {
        NodeCore::Operator { name, op }
            if node.args.len() == 2
                && node.connective().is_none()
                && node.args.iter().all(AstNode::is_leaf) =>
        {
            Some((name.clone(), op.clone()))
        }
        _ => None,
    };
    if let Some((name, op)) = retag {
        node.core = NodeCore::FastOperator { name, op };
    }
}

fn base_cost(node: &AstNode) -> f64 {
    match &node.core {
        NodeCore::Constant(_) => 1.0,
        NodeCore::Variable { .. } => 5.0,
        NodeCore::FastOperator { .. } => 10.0,
        NodeCore::Operator { .. } => 10.0 * node.args.len() as f64,
        NodeCore::Conditional => 20.0,
    }
}

fn category(node: &AstNode) -> CostCategory {
    match &node.core {
        NodeCore::Constant(_) => CostCategory::Constant,
        NodeCore::Variable { .. } => CostCategory::Variable,
        NodeCore::Operator { .. } => CostCategory::Operator,
        NodeCore::FastOperator { .. } => CostCategory::FastOperator,
        NodeCore::Conditional => CostCategory::Conditional,
    }
}

/// Structural signature `parent/ident(child,child,...)`, used for cost
/// lookup when the node sits directly under a boolean connective.
fn signature(parent: &str, node: &AstNode) -> String {
    let children: Vec<_> = node.args.iter().map(AstNode::ident).collect();
    format!("{parent}/{}({})", node.ident(), children.join(","))
}

/// Bottom-up cost assignment. A conditional only ever runs one branch, so
/// its children contribute `cond + max(then, else)`.
fn assign_costs(env: &Environment, node: &mut AstNode, parent_connective: Option<&str>) {
    let own_connective = node.connective().map(|kind| match kind {
        Connective::And => "and",
        Connective::Or => "or",
    });
    for child in &mut node.args {
        assign_costs(env, child, own_connective);
    }
    let children_cost = match &node.core {
        NodeCore::Conditional => {
            node.args[0].cost + node.args[1].cost.max(node.args[2].cost)
        }
        _ => node.args.iter().map(|c| c.cost).sum(),
    };
    let sig = parent_connective.map(|parent| signature(parent, node));
    let operation = env
        .costs
        .operation_cost(sig.as_deref(), &node.ident(), category(node));
    node.cost = base_cost(node) + operation + children_cost;
}

/// Stable sort of `and`/`or` operands by ascending cost. Stability matters:
/// equal-cost children keep source order, which is user-visible when custom
/// operators have side effects.
fn reorder(node: &mut AstNode) {
    for child in &mut node.args {
        reorder(child);
    }
    if node.connective().is_some() {
        node.args.sort_by(|a, b| a.cost.total_cmp(&b.cost));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{env::CostModel, lexer::lex, parser};
    use assert2::{check, let_assert};

    fn env() -> Environment {
        Environment::builder()
            .variable("v1")
            .variable("v2")
            .variable("v3")
            .freeze()
    }

    fn parsed(src: &str) -> AstNode {
        parser::parse(&lex(src).unwrap(), &env()).unwrap()
    }

    fn names(node: &AstNode) -> Vec<String> {
        node.args.iter().map(AstNode::ident).collect()
    }

    #[test]
    fn flatten_splices_same_kind_chains() {
        let mut node = parsed("(and v1 (and v2 v3))");
        flatten(&mut node);
        check!(names(&node) == ["v1", "v2", "v3"]);
    }

    #[test]
    fn flatten_is_all_or_nothing() {
        // (= v1 1) is neither a leaf nor an `and`, so nothing is spliced
        let mut node = parsed("(and (and v1 v2) (= v1 1))");
        flatten(&mut node);
        check!(node.args.len() == 2);
        check!(names(&node) == ["and", "="]);
    }

    #[test]
    fn flatten_does_not_mix_connectives() {
        let mut node = parsed("(and v1 (or v2 v3))");
        flatten(&mut node);
        check!(names(&node) == ["v1", "or"]);
    }

    #[test]
    fn fold_collapses_constant_calls() {
        let mut node = parsed("(+ 1 (* 2 3))");
        fold(&env(), &mut node);
        let_assert!(NodeCore::Constant(Value::Int(7)) = &node.core);
        check!(node.args.is_empty());
    }

    #[test]
    fn fold_short_circuits_on_deciding_constants() {
        // `true` alone satisfies `or`, even with a non-constant sibling
        let mut node = parsed("(or (= v1 2) true)");
        fold(&env(), &mut node);
        let_assert!(NodeCore::Constant(Value::Bool(true)) = &node.core);

        let mut node = parsed("(and (= v1 2) false)");
        fold(&env(), &mut node);
        let_assert!(NodeCore::Constant(Value::Bool(false)) = &node.core);
    }

    #[test]
    fn fold_keeps_undecided_connectives() {
        let mut node = parsed("(and (= v1 2) true)");
        fold(&env(), &mut node);
        let_assert!(NodeCore::Operator { .. } = &node.core);
        check!(node.args.len() == 2);
    }

    #[test]
    fn fold_absorbs_operator_errors() {
        let mut node = parsed("(/ 1 0)");
        fold(&env(), &mut node);
        // division by zero during folding leaves the node for evaluation
        // time to report
        let_assert!(NodeCore::Operator { name, .. } = &node.core);
        check!(name.as_ref() == "/");
        check!(node.args.len() == 2);
    }

    #[test]
    fn fold_skips_stateful_operators() {
        let mut builder = Environment::builder();
        builder
            .operator("roll", false, std::sync::Arc::new(|_, _| Ok(Value::Int(4))))
            .unwrap();
        let env = builder.freeze();
        let mut node = parser::parse(&lex("(roll 1 2)").unwrap(), &env).unwrap();
        fold(&env, &mut node);
        let_assert!(NodeCore::Operator { .. } = &node.core);
    }

    #[test]
    fn fold_is_idempotent() {
        let mut node = parsed("(and (= v1 2) (< 1 2) (or false (= v2 3)))");
        fold(&env(), &mut node);
        let first = format!("{node:?}");
        fold(&env(), &mut node);
        check!(format!("{node:?}") == first);
    }

    #[test]
    fn fast_path_tagging_requires_two_leaves() {
        let mut node = parsed("(and (= v1 1) (= v1 (+ v2 1)))");
        tag_fast_paths(&mut node);
        let_assert!(NodeCore::FastOperator { .. } = &node.args[0].core);
        // second comparison has an operator operand, stays a full call
        let_assert!(NodeCore::Operator { .. } = &node.args[1].core);
        // (+ v2 1) itself qualifies
        let_assert!(NodeCore::FastOperator { .. } = &node.args[1].args[1].core);
    }

    #[test]
    fn connectives_are_never_fast_tagged() {
        // a fast call fetches both operand slots before invoking, which
        // would defeat the connective's laziness
        let mut node = parsed("(and v1 v2)");
        tag_fast_paths(&mut node);
        let_assert!(NodeCore::Operator { name, .. } = &node.core);
        check!(name.as_ref() == "and");

        let mut node = parsed("(or (= v1 1) (= v2 2))");
        tag_fast_paths(&mut node);
        let_assert!(NodeCore::Operator { name, .. } = &node.core);
        check!(name.as_ref() == "or");
        let_assert!(NodeCore::FastOperator { .. } = &node.args[0].core);
    }

    #[test]
    fn reordering_puts_cheap_operands_first() {
        let mut costs = CostModel::default();
        costs.set_exact("v1", 20.0);
        costs.set_exact("v2", 10.0);
        let env = Environment::builder()
            .variable("v1")
            .variable("v2")
            .costs(costs)
            .freeze();
        let mut node = parser::parse(&lex("(and (= v1 1) (= v2 2))").unwrap(), &env).unwrap();
        tag_fast_paths(&mut node);
        assign_costs(&env, &mut node, None);
        reorder(&mut node);
        check!(names(&node.args[0]) == ["v2", "2"]);
        check!(names(&node.args[1]) == ["v1", "1"]);
    }

    #[test]
    fn reordering_is_stable_under_ties() {
        let mut node = parsed("(and (= v1 1) (= v2 2) (= v3 3))");
        let env = env();
        assign_costs(&env, &mut node, None);
        reorder(&mut node);
        // identical costs keep source order
        check!(
            node.args
                .iter()
                .map(|c| c.args[0].ident())
                .collect::<Vec<_>>()
                == ["v1", "v2", "v3"]
        );
    }

    #[test]
    fn contextual_signature_cost_overrides_exact() {
        let mut costs = CostModel::default();
        costs.set_exact("=", 1.0);
        // this particular comparison is expensive only under this `and`
        costs.set_signature("and/=(v1,1)", 500.0);
        let env = Environment::builder()
            .variable("v1")
            .variable("v2")
            .costs(costs)
            .freeze();
        let mut node = parser::parse(&lex("(and (= v1 1) (= v2 2))").unwrap(), &env).unwrap();
        assign_costs(&env, &mut node, None);
        reorder(&mut node);
        check!(names(&node.args[0]) == ["v2", "2"]);
    }

    #[test]
    fn conditional_cost_takes_the_dearer_branch_once() {
        let env = env();
        let mut plain = parser::parse(&lex("(if v1 v2 v3)").unwrap(), &env).unwrap();
        assign_costs(&env, &mut plain, None);
        let cond = plain.args[0].cost;
        let then = plain.args[1].cost;
        let els = plain.args[2].cost;
        check!(plain.cost == 20.0 + crate::env::DEFAULT_OP_COST + cond + then.max(els));
    }
}
