//! Non-recursive evaluation of compiled programs.
//!
//! The evaluator is a single forward scan over the instruction array with an
//! explicit operand stack, sized up front from the compile-time maximum.
//! Short-circuit jumps use the precomputed targets; on a jump the operand
//! stack is cut back to the height recorded for the resume point, so a fired
//! child behaves exactly as if its whole connective had run and produced
//! that boolean.
//!
//! All state lives in the stack frame of [`Program::evaluate`]; the program
//! itself is only read. Evaluating one program from many threads at once
//! needs no synchronization.
use std::collections::HashMap;

use crate::{
    ops::{OpContext, OperatorError},
    program::{Opcode, Program},
    value::Value,
};

/// Source of variable values during one evaluation.
///
/// `key` is the slot handle assigned when the variable was declared to the
/// environment; free variables carry no key and resolve by name only.
pub trait Binding {
    fn get(&self, key: Option<u32>, name: &str) -> Option<Value>;

    fn has(&self, key: Option<u32>, name: &str) -> bool {
        self.get(key, name).is_some()
    }
}

/// Ready-made [`Binding`] backed by a slot table for keyed variables and a
/// name map for free ones. Keyed lookups fall back to the name map, so a
/// caller who only ever calls [`set`](Bindings::set) still satisfies keyed
/// programs.
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    slots: Vec<Option<Value>>,
    named: HashMap<Box<str>, Value>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind by name.
    pub fn set(&mut self, name: impl AsRef<str>, value: impl Into<Value>) -> &mut Self {
        self.named.insert(Box::from(name.as_ref()), value.into());
        self
    }

    /// Bind by slot key; constant-time lookup during evaluation.
    pub fn set_slot(&mut self, key: u32, value: impl Into<Value>) -> &mut Self {
        let index = key as usize;
        if index >= self.slots.len() {
            self.slots.resize(index + 1, None);
        }
        self.slots[index] = Some(value.into());
        self
    }
}

impl Binding for Bindings {
    fn get(&self, key: Option<u32>, name: &str) -> Option<Value> {
        if let Some(key) = key {
            if let Some(Some(value)) = self.slots.get(key as usize) {
                return Some(value.clone());
            }
        }
        self.named.get(name).cloned()
    }
}

impl Binding for HashMap<String, Value> {
    fn get(&self, _key: Option<u32>, name: &str) -> Option<Value> {
        HashMap::get(self, name).cloned()
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("variable `{name}` is not bound")]
    UnboundVariable { name: Box<str> },
    #[error("operator `{name}` failed: {source}")]
    Operator {
        name: Box<str>,
        #[source]
        source: OperatorError,
    },
    #[error("condition evaluated to a {got}, expected a boolean")]
    NonBooleanCondition { got: &'static str },
    #[error("expression evaluated to a {got}, expected a boolean")]
    NonBooleanResult { got: &'static str },
    #[error("operand stack underflow at instruction {pc}")]
    StackUnderflow { pc: usize },
}

impl Program {
    /// Run the program against a binding and produce its value.
    pub fn evaluate(&self, binding: &dyn Binding) -> Result<Value, EvalError> {
        let nodes = self.instructions();
        let len = nodes.len();
        let mut stack: Vec<Value> = Vec::with_capacity(self.max_stack());
        let mut pc = 0usize;

        while pc < len {
            let ins = &nodes[pc];
            let value = match &ins.op {
                Opcode::Const(value) => value.clone(),
                Opcode::Var { name, key } => self.lookup(binding, *name, *key)?,
                Opcode::Call { name, op, argc } => {
                    let argc = usize::from(*argc);
                    let at = stack
                        .len()
                        .checked_sub(argc)
                        .ok_or(EvalError::StackUnderflow { pc })?;
                    let ctx = OpContext {
                        binding: Some(binding),
                    };
                    // operands are consumed in place, no per-call allocation
                    let value = op.invoke(&ctx, &stack[at..]).map_err(|source| {
                        EvalError::Operator {
                            name: Box::from(self.name(*name)),
                            source,
                        }
                    })?;
                    stack.truncate(at);
                    value
                }
                Opcode::FastCall { name, op } => {
                    // operands sit in the two slots after the call
                    let args = [
                        self.operand(binding, pc + 1)?,
                        self.operand(binding, pc + 2)?,
                    ];
                    let ctx = OpContext {
                        binding: Some(binding),
                    };
                    let value =
                        op.invoke(&ctx, &args).map_err(|source| EvalError::Operator {
                            name: Box::from(self.name(*name)),
                            source,
                        })?;
                    pc += 2;
                    value
                }
                Opcode::Branch { end } => {
                    let cond = stack.pop().ok_or(EvalError::StackUnderflow { pc })?;
                    let cond = cond.as_bool().ok_or(EvalError::NonBooleanCondition {
                        got: cond.type_name(),
                    })?;
                    pc = if cond { pc + 1 } else { usize::from(*end) + 1 };
                    continue;
                }
                Opcode::End { resume } => {
                    pc = usize::from(*resume);
                    continue;
                }
                Opcode::Trace(text) => {
                    tracing::trace!(pc, stack = stack.len(), "{text}");
                    pc += 1;
                    continue;
                }
            };

            // a boolean that decides an enclosing connective jumps straight
            // to the precomputed resume point; non-booleans fall through so
            // the connective call itself reports the type error
            if !ins.flags.is_empty() {
                if let Value::Bool(b) = value {
                    if let Some(target) = ins.jump_on(b) {
                        let target = usize::from(target);
                        if target == len {
                            return Ok(Value::Bool(b));
                        }
                        // cut back to the height the resume point expects,
                        // with the decided connective's value on top
                        let height = usize::from(nodes[target - 1].stack_after);
                        stack.truncate(height - 1);
                        stack.push(Value::Bool(b));
                        pc = target;
                        continue;
                    }
                }
            }

            stack.push(value);
            pc += 1;
        }

        stack.pop().ok_or(EvalError::StackUnderflow { pc })
    }

    /// As [`evaluate`](Program::evaluate), demanding a boolean result.
    pub fn evaluate_bool(&self, binding: &dyn Binding) -> Result<bool, EvalError> {
        let value = self.evaluate(binding)?;
        value.as_bool().ok_or(EvalError::NonBooleanResult {
            got: value.type_name(),
        })
    }

    fn lookup(
        &self,
        binding: &dyn Binding,
        name: lasso::Spur,
        key: Option<u32>,
    ) -> Result<Value, EvalError> {
        let name = self.name(name);
        binding
            .get(key, name)
            .ok_or_else(|| EvalError::UnboundVariable {
                name: Box::from(name),
            })
    }

    /// Resolve an inline operand slot of a fast call.
    fn operand(&self, binding: &dyn Binding, slot: usize) -> Result<Value, EvalError> {
        match &self.instructions()[slot].op {
            Opcode::Const(value) => Ok(value.clone()),
            Opcode::Var { name, key } => self.lookup(binding, *name, *key),
            _ => unreachable!("fast-call operands are literals or variables"),
        }
    }
}
