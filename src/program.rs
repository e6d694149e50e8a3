//! Linearization: from the optimized tree to the flat, immutable program.
//!
//! The builder makes four passes over the tree, each depending on the one
//! before:
//!
//! 1. node ordering: operators after their operands (post-order), fast
//!    operators ahead of their two inline operands, conditionals lowered to
//!    condition / branch dispatcher / true branch / end marker / false
//!    branch;
//! 2. parent indices: every slot records the slot of its owning node;
//! 3. stack-depth annotation: the operand-stack height after every
//!    instruction in straight-line order, whose maximum sizes the
//!    evaluator's stack;
//! 4. short-circuit flags and jump targets: children of `and`/`or` learn
//!    which boolean value lets them skip their remaining siblings, and
//!    where to resume. Targets are chased through same-disposition
//!    ancestors at compile time, so deeply nested boolean trees jump once,
//!    not along a chain.
//!
//! The result is read-only and safe to evaluate concurrently: evaluation
//! never touches the program beyond reading it.
use core::fmt;

use bitflags::bitflags;
use lasso::{Rodeo, RodeoReader, Spur};

use crate::{
    ast::{AstNode, Connective, NodeCore},
    ops::OpImpl,
    value::Value,
};

bitflags! {
    /// Short-circuit disposition of an instruction's boolean result.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ShortCircuit: u8 {
        /// Skip ahead if the result is `false` (children of `and`).
        const ON_FALSE = 1 << 0;
        /// Skip ahead if the result is `true` (children of `or`).
        const ON_TRUE = 1 << 1;
    }
}

/// Sentinel for "no short-circuit jump on this value".
pub const NO_TARGET: u16 = u16::MAX;
/// Sentinel parent index of root slots.
pub const NO_PARENT: u16 = u16::MAX;

#[derive(Debug, Clone)]
pub struct Instruction {
    pub op: Opcode,
    pub flags: ShortCircuit,
    /// Resume slot when the result is `false` and [`ShortCircuit::ON_FALSE`]
    /// is set. A target equal to the program length terminates evaluation
    /// with that boolean as the final result.
    pub jump_false: u16,
    /// Resume slot when the result is `true`, as above.
    pub jump_true: u16,
    /// Operand-stack height after this instruction in straight-line order.
    pub stack_after: u16,
    /// Inline operand of a preceding fast call; never executed directly.
    pub inline: bool,
}

impl Instruction {
    fn new(op: Opcode) -> Self {
        Self {
            op,
            flags: ShortCircuit::empty(),
            jump_false: NO_TARGET,
            jump_true: NO_TARGET,
            stack_after: 0,
            inline: false,
        }
    }

    /// The jump target selected by a boolean result, if its flag is set.
    pub fn jump_on(&self, value: bool) -> Option<u16> {
        let (flag, target) = if value {
            (ShortCircuit::ON_TRUE, self.jump_true)
        } else {
            (ShortCircuit::ON_FALSE, self.jump_false)
        };
        (self.flags.contains(flag) && target != NO_TARGET).then_some(target)
    }

    fn set_jump(&mut self, flag: ShortCircuit, target: u16) {
        self.flags |= flag;
        if flag.contains(ShortCircuit::ON_FALSE) {
            self.jump_false = target;
        }
        if flag.contains(ShortCircuit::ON_TRUE) {
            self.jump_true = target;
        }
    }
}

#[derive(Debug, Clone)]
pub enum Opcode {
    /// Push a literal.
    Const(Value),
    /// Fetch a binding by (key, name) and push it.
    Var { name: Spur, key: Option<u32> },
    /// Pop `argc` operands, invoke, push the result.
    Call { name: Spur, op: OpImpl, argc: u8 },
    /// Invoke over the two inline slots that follow; nothing is popped.
    FastCall { name: Spur, op: OpImpl },
    /// Conditional dispatcher: pops the condition, falls through into the
    /// true branch or jumps to `end + 1` for the false branch.
    Branch { end: u16 },
    /// Closes a true branch: skips the false branch by resuming at `resume`.
    End { resume: u16 },
    /// Non-executing shadow of the following instruction (debug builds).
    Trace(Box<str>),
}

/// The compiled, immutable artifact. Produced once per expression text,
/// then shared freely: evaluation allocates its own transient stack, so a
/// single `Program` may be evaluated from many threads at once.
pub struct Program {
    nodes: Box<[Instruction]>,
    parent: Box<[u16]>,
    max_stack: usize,
    names: RodeoReader,
}

impl Program {
    pub fn instructions(&self) -> &[Instruction] {
        &self.nodes
    }

    /// Owning-slot index per slot; `NO_PARENT` for the root.
    pub fn parents(&self) -> &[u16] {
        &self.parent
    }

    /// Operand-stack capacity any evaluation of this program needs.
    pub fn max_stack(&self) -> usize {
        self.max_stack
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn name(&self, spur: Spur) -> &str {
        self.names.resolve(&spur)
    }

    /// Duplicate the program with a non-executing trace shadow ahead of
    /// every instruction (a fast call keeps its operand slots adjacent, so
    /// its shadow precedes the whole triple). Strictly additive: the
    /// expanded program evaluates to the same results.
    pub fn expanded(self) -> Program {
        let old = &self.nodes;
        let old_len = old.len();
        let mut nodes: Vec<Instruction> = Vec::with_capacity(old_len * 2);
        // old slot -> new slot, one extra entry so the "one past the end"
        // terminate target stays meaningful
        let mut remap = vec![0u16; old_len + 1];
        // new slot -> old slot it came from (shadows map to their original)
        let mut origin = Vec::with_capacity(old_len * 2);

        let mut i = 0;
        while i < old_len {
            let group = match old[i].op {
                Opcode::FastCall { .. } => 3,
                _ => 1,
            };
            let mut shadow = Instruction::new(Opcode::Trace(self.describe(&old[i]).into()));
            shadow.stack_after = if i == 0 { 0 } else { old[i - 1].stack_after };
            origin.push(i as u16);
            nodes.push(shadow);
            for j in 0..group {
                remap[i + j] = nodes.len() as u16;
                origin.push((i + j) as u16);
                nodes.push(old[i + j].clone());
            }
            i += group;
        }
        remap[old_len] = nodes.len() as u16;

        let fix = |target: u16| -> u16 {
            if target == NO_TARGET {
                NO_TARGET
            } else {
                remap[target as usize]
            }
        };
        for ins in &mut nodes {
            ins.jump_false = fix(ins.jump_false);
            ins.jump_true = fix(ins.jump_true);
            match &mut ins.op {
                Opcode::Branch { end } => *end = remap[*end as usize],
                Opcode::End { resume } => *resume = remap[*resume as usize],
                _ => {}
            }
        }

        let parent = origin
            .iter()
            .map(|&from| match self.parent[from as usize] {
                NO_PARENT => NO_PARENT,
                p => remap[p as usize],
            })
            .collect();

        Program {
            nodes: nodes.into(),
            parent,
            max_stack: self.max_stack,
            names: self.names,
        }
    }

    fn describe(&self, ins: &Instruction) -> String {
        match &ins.op {
            Opcode::Const(v) => format!("const {v}"),
            Opcode::Var { name, key } => match key {
                Some(k) => format!("var {}#{k}", self.name(*name)),
                None => format!("var {}", self.name(*name)),
            },
            Opcode::Call { name, argc, .. } => {
                format!("call {}/{argc}", self.name(*name))
            }
            Opcode::FastCall { name, .. } => format!("fast {}", self.name(*name)),
            Opcode::Branch { end } => format!("branch end={end}"),
            Opcode::End { resume } => format!("end resume={resume}"),
            Opcode::Trace(text) => format!("trace {text}"),
        }
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("len", &self.nodes.len())
            .field("max_stack", &self.max_stack)
            .finish()
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.nodes.len();
        for (i, ins) in self.nodes.iter().enumerate() {
            let pad = if ins.inline { "    " } else { "" };
            write!(f, "{i:>4} {pad}{}", self.describe(ins))?;
            for (flag, label, target) in [
                (ShortCircuit::ON_FALSE, "on-false", ins.jump_false),
                (ShortCircuit::ON_TRUE, "on-true", ins.jump_true),
            ] {
                if ins.flags.contains(flag) && target != NO_TARGET {
                    if target as usize == len {
                        write!(f, " {label}->halt")?;
                    } else {
                        write!(f, " {label}->{target}")?;
                    }
                }
            }
            writeln!(f, " [stack {}]", ins.stack_after)?;
        }
        Ok(())
    }
}

/// A node's place in the instruction array, kept alongside the tree shape
/// so the later passes can walk structure and slots together.
struct Placed<'a> {
    node: &'a AstNode,
    /// The node's own slot: its post-order slot for full operators, the
    /// dispatcher slot for conditionals.
    slot: u16,
    /// The end-marker slot of a conditional.
    end_slot: u16,
    kids: Vec<Placed<'a>>,
}

pub(crate) struct Builder {
    rodeo: Rodeo,
    nodes: Vec<Instruction>,
}

impl Builder {
    pub(crate) fn build(ast: &AstNode) -> Program {
        let mut builder = Builder {
            rodeo: Rodeo::default(),
            nodes: Vec::new(),
        };
        let placed = builder.emit(ast, false);
        let mut parent = vec![NO_PARENT; builder.nodes.len()];
        assign_parents(&placed, &mut parent);
        let max_stack = builder.assign_depths();
        builder.assign_flags(&placed);
        tracing::debug!(
            len = builder.nodes.len(),
            max_stack,
            "linearized program"
        );
        Program {
            nodes: builder.nodes.into_boxed_slice(),
            parent: parent.into_boxed_slice(),
            max_stack,
            names: builder.rodeo.into_reader(),
        }
    }

    fn push(&mut self, op: Opcode, inline: bool) -> u16 {
        let slot = self.nodes.len() as u16;
        let mut ins = Instruction::new(op);
        ins.inline = inline;
        self.nodes.push(ins);
        slot
    }

    /// Pass 1: node ordering.
    fn emit<'a>(&mut self, node: &'a AstNode, inline: bool) -> Placed<'a> {
        match &node.core {
            NodeCore::Constant(value) => {
                let slot = self.push(Opcode::Const(value.clone()), inline);
                Placed {
                    node,
                    slot,
                    end_slot: NO_TARGET,
                    kids: Vec::new(),
                }
            }
            NodeCore::Variable { name, key } => {
                let name = self.rodeo.get_or_intern(name.as_ref());
                let slot = self.push(Opcode::Var { name, key: *key }, inline);
                Placed {
                    node,
                    slot,
                    end_slot: NO_TARGET,
                    kids: Vec::new(),
                }
            }
            NodeCore::Operator { name, op } => {
                // operands first: their values are on the operand stack
                // when the call executes
                let kids: Vec<_> = node.args.iter().map(|a| self.emit(a, false)).collect();
                let name = self.rodeo.get_or_intern(name.as_ref());
                let slot = self.push(
                    Opcode::Call {
                        name,
                        op: op.clone(),
                        argc: node.args.len() as u8,
                    },
                    false,
                );
                Placed {
                    node,
                    slot,
                    end_slot: NO_TARGET,
                    kids,
                }
            }
            NodeCore::FastOperator { name, op } => {
                // the call first, its two leaf operands in the slots right
                // after it; the evaluator reads them at fixed offsets
                let name = self.rodeo.get_or_intern(name.as_ref());
                let slot = self.push(Opcode::FastCall { name, op: op.clone() }, false);
                let kids = node.args.iter().map(|a| self.emit(a, true)).collect();
                Placed {
                    node,
                    slot,
                    end_slot: NO_TARGET,
                    kids,
                }
            }
            NodeCore::Conditional => {
                let cond = self.emit(&node.args[0], false);
                let slot = self.push(Opcode::Branch { end: 0 }, false);
                let then = self.emit(&node.args[1], false);
                let end_slot = self.push(Opcode::End { resume: 0 }, false);
                let els = self.emit(&node.args[2], false);
                let resume = self.nodes.len() as u16;
                self.nodes[slot as usize].op = Opcode::Branch { end: end_slot };
                self.nodes[end_slot as usize].op = Opcode::End { resume };
                Placed {
                    node,
                    slot,
                    end_slot,
                    kids: vec![cond, then, els],
                }
            }
        }
    }

    /// Pass 3: straight-line operand-stack heights. Inline operands of a
    /// fast call never execute on their own, so they carry their call's
    /// height; an end marker nets -1 in straight-line order so the false
    /// branch that follows it starts from the height the dispatcher left.
    fn assign_depths(&mut self) -> usize {
        let mut height: i32 = 0;
        let mut max = 0i32;
        for ins in &mut self.nodes {
            let delta = if ins.inline {
                0
            } else {
                match &ins.op {
                    Opcode::Const(_) | Opcode::Var { .. } | Opcode::FastCall { .. } => 1,
                    Opcode::Call { argc, .. } => 1 - i32::from(*argc),
                    Opcode::Branch { .. } | Opcode::End { .. } => -1,
                    Opcode::Trace(_) => 0,
                }
            };
            height += delta;
            debug_assert!(height >= 0, "stack height underflow during layout");
            max = max.max(height);
            ins.stack_after = height as u16;
        }
        max as usize
    }

    /// Pass 4: short-circuit flags and targets, children walked
    /// right-to-left beneath each boolean connective.
    ///
    /// A child's target for flag `f` is its parent's own target for `f`
    /// when the parent carries that flag, else the slot just past the
    /// parent; iterated top-down this lands every child on the outermost
    /// same-disposition ancestor in a single precomputed jump.
    fn assign_flags(&mut self, placed: &Placed<'_>) {
        let connective = placed.node.connective();
        let fast = matches!(placed.node.core, NodeCore::FastOperator { .. });
        if fast {
            // inline operands never execute, nothing to flag below here
            return;
        }
        if let Some(kind) = connective {
            let base = match kind {
                Connective::And => ShortCircuit::ON_FALSE,
                Connective::Or => ShortCircuit::ON_TRUE,
            };
            let last = placed.kids.len().saturating_sub(1);
            for (i, kid) in placed.kids.iter().enumerate().rev() {
                // a last child's value always determines or forwards the
                // parent's result, so it short-circuits on either value
                let flags = if i == last {
                    ShortCircuit::all()
                } else {
                    base
                };
                for flag in [ShortCircuit::ON_FALSE, ShortCircuit::ON_TRUE] {
                    if !flags.contains(flag) {
                        continue;
                    }
                    let here = &self.nodes[placed.slot as usize];
                    let target = if here.flags.contains(flag) {
                        if flag == ShortCircuit::ON_FALSE {
                            here.jump_false
                        } else {
                            here.jump_true
                        }
                    } else {
                        placed.slot + 1
                    };
                    self.propagate_flag(kid, flag, target);
                }
            }
        }
        for kid in &placed.kids {
            self.assign_flags(kid);
        }
    }

    /// Attach a flag to the slot that will push the node's value. A
    /// conditional's dispatcher pushes nothing; its branches produce the
    /// value, so they inherit the disposition instead.
    fn propagate_flag(&mut self, placed: &Placed<'_>, flag: ShortCircuit, target: u16) {
        if matches!(placed.node.core, NodeCore::Conditional) {
            self.propagate_flag(&placed.kids[1], flag, target);
            self.propagate_flag(&placed.kids[2], flag, target);
        } else {
            self.nodes[placed.slot as usize].set_jump(flag, target);
        }
    }
}

/// Pass 2: owning-slot index for every slot, breadth-first.
fn assign_parents(root: &Placed<'_>, parent: &mut [u16]) {
    let mut queue = std::collections::VecDeque::new();
    queue.push_back((root, NO_PARENT));
    while let Some((placed, owner)) = queue.pop_front() {
        parent[placed.slot as usize] = owner;
        if placed.end_slot != NO_TARGET {
            parent[placed.end_slot as usize] = placed.slot;
        }
        for kid in &placed.kids {
            queue.push_back((kid, placed.slot));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{env::Environment, lexer::lex, optimizer, parser};
    use assert2::{check, let_assert};

    fn compile_ast(src: &str, optimize: bool) -> Program {
        let mut env = Environment::builder()
            .variable("a")
            .variable("b")
            .variable("c")
            .freeze();
        if !optimize {
            env.options = env.options.without_optimizations();
        }
        let mut ast = parser::parse(&lex(src).unwrap(), &env).unwrap();
        optimizer::run(&env, &mut ast);
        Builder::build(&ast)
    }

    fn kinds(program: &Program) -> Vec<&'static str> {
        program
            .instructions()
            .iter()
            .map(|ins| match ins.op {
                Opcode::Const(_) => "const",
                Opcode::Var { .. } => "var",
                Opcode::Call { .. } => "call",
                Opcode::FastCall { .. } => "fast",
                Opcode::Branch { .. } => "branch",
                Opcode::End { .. } => "end",
                Opcode::Trace(_) => "trace",
            })
            .collect()
    }

    #[test]
    fn operators_follow_their_operands() {
        let program = compile_ast("(+ a (+ b 1))", false);
        check!(kinds(&program) == ["var", "var", "const", "call", "call"]);
        check!(program.parents() == [4, 3, 3, 4, NO_PARENT]);
        check!(program.max_stack() == 3);
    }

    #[test]
    fn fast_calls_precede_their_inline_operands() {
        let program = compile_ast("(= a 1)", true);
        check!(kinds(&program) == ["fast", "var", "const"]);
        check!(program.instructions()[1].inline);
        check!(program.instructions()[2].inline);
        // a fast call nets one pushed result, its operands none
        check!(
            program
                .instructions()
                .iter()
                .map(|i| i.stack_after)
                .collect::<Vec<_>>()
                == [1, 1, 1]
        );
        check!(program.max_stack() == 1);
    }

    #[test]
    fn conditional_lowering() {
        let program = compile_ast("(if a 1 2)", false);
        check!(kinds(&program) == ["var", "branch", "const", "end", "const"]);
        let_assert!(Opcode::Branch { end: 3 } = &program.instructions()[1].op);
        let_assert!(Opcode::End { resume: 5 } = &program.instructions()[3].op);
        check!(program.parents() == [1, NO_PARENT, 1, 1, 1]);
        check!(program.max_stack() == 1);
    }

    #[test]
    fn and_children_skip_on_false() {
        let program = compile_ast("(and a b c)", false);
        check!(kinds(&program) == ["var", "var", "var", "call"]);
        let len = program.len() as u16;
        let ins = program.instructions();
        check!(ins[0].flags == ShortCircuit::ON_FALSE);
        check!(ins[0].jump_false == len);
        check!(ins[1].jump_false == len);
        // the last child forwards either way
        check!(ins[2].flags == ShortCircuit::all());
        check!(ins[2].jump_false == len);
        check!(ins[2].jump_true == len);
        check!(ins[3].flags.is_empty());
    }

    #[test]
    fn mixed_connectives_chase_to_the_outermost_matching_ancestor() {
        // (or (and a b) c): slots [a, b, and, c, or]
        let program = compile_ast("(or (and a b) c)", false);
        check!(kinds(&program) == ["var", "var", "call", "var", "call"]);
        let ins = program.instructions();
        // `a` false only settles the inner `and`; resume at `c`
        check!(ins[0].flags == ShortCircuit::ON_FALSE);
        check!(ins[0].jump_false == 3);
        // `b` false resumes at `c`, but `b` true decides the whole `or`
        check!(ins[1].flags == ShortCircuit::all());
        check!(ins[1].jump_false == 3);
        check!(ins[1].jump_true == 5);
        // the inner `and` as a value is `or`'s non-last child
        check!(ins[2].flags == ShortCircuit::ON_TRUE);
        check!(ins[2].jump_true == 5);
    }

    #[test]
    fn nested_same_kind_connectives_jump_once() {
        // keep nesting by disabling flattening
        let program = compile_ast("(and (and a b) c)", false);
        let ins = program.instructions();
        let len = program.len() as u16;
        // `a` false terminates the whole program, not just the inner `and`
        check!(ins[0].jump_false == len);
        check!(ins[1].jump_false == len);
    }

    #[test]
    fn conditional_branches_inherit_the_dispatcher_disposition() {
        // (and a (if b 1 2)): [a, b, branch, 1, end, 2, and]
        let program = compile_ast("(and a (if b c true))", false);
        let ins = program.instructions();
        let len = program.len() as u16;
        check!(kinds(&program) == ["var", "var", "branch", "var", "end", "const", "call"]);
        // branch roots carry the conditional's last-child disposition
        check!(ins[3].flags == ShortCircuit::all());
        check!(ins[3].jump_false == len);
        check!(ins[5].flags == ShortCircuit::all());
        check!(ins[5].jump_true == len);
        // the dispatcher and end marker stay unflagged
        check!(ins[2].flags.is_empty());
        check!(ins[4].flags.is_empty());
    }

    #[test]
    fn expansion_interleaves_trace_shadows() {
        let program = compile_ast("(and (= a 1) (= b 2))", true).expanded();
        check!(
            kinds(&program)
                == [
                    "trace", "fast", "var", "const", "trace", "fast", "var", "const", "trace",
                    "call"
                ]
        );
        // targets survive the remap: the last child halts either way
        let ins = program.instructions();
        check!(ins[5].flags == ShortCircuit::all());
        check!(ins[5].jump_true == program.len() as u16);
        check!(program.max_stack() == 2);
    }

    #[test]
    fn listing_is_stable_enough_to_read() {
        let program = compile_ast("(and (= a 1) b)", true);
        let listing = format!("{program}");
        check!(listing.contains("fast ="));
        check!(listing.contains("var a#0"));
        check!(listing.contains("on-false->halt"));
    }
}
