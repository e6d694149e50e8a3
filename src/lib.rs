//! A small embeddable rule-expression language.
//!
//! Expressions are written in a prefix S-expression surface (an infix
//! surface is available behind an option), compiled once against a frozen
//! [`Environment`], and evaluated many times against per-call [`Binding`]s.
//! Compilation parses, optimizes, bounds-checks and finally flattens the
//! expression into an immutable instruction array; evaluation is a single
//! non-recursive scan with precomputed short-circuit jumps, safe to run
//! concurrently from any number of threads over one shared [`Program`].
//!
//! ```
//! use sift::{Bindings, Environment};
//!
//! let env = Environment::builder()
//!     .variable("age")
//!     .variable("country")
//!     .freeze();
//! let program = sift::compile(&env, r#"(and (>= age 18) (= country "SE"))"#)?;
//!
//! let mut bindings = Bindings::new();
//! bindings.set_slot(0, 30i64).set_slot(1, "SE");
//! assert!(program.evaluate_bool(&bindings)?);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
pub mod ast;
pub mod checker;
pub mod env;
mod error;
pub mod eval;
pub mod lexer;
pub mod ops;
mod optimizer;
pub mod parser;
pub mod program;
pub mod value;

pub use env::{CostCategory, CostModel, Environment, EnvironmentBuilder, Options};
pub use error::CompileError;
pub use eval::{Binding, Bindings, EvalError};
pub use ops::{CustomFn, OpContext, OperatorError};
pub use program::Program;
pub use value::Value;

/// Compile a source text against an environment.
///
/// The environment is cloned first and per-source directives from the
/// leading comment block are applied to the clone, so one caller's
/// directives never affect another compile using the same environment.
pub fn compile(env: &Environment, source: &str) -> Result<Program, CompileError> {
    let tokens = lexer::lex(source)?;
    let mut env = env.clone();
    env::apply_directives(&mut env.options, &tokens)?;
    let mut ast = if env.options.infix {
        parser::infix::parse(&tokens, &env)?
    } else {
        parser::parse(&tokens, &env)?
    };
    optimizer::run(&env, &mut ast);
    checker::check(&ast)?;
    let mut program = program::Builder::build(&ast);
    if env.options.trace {
        program = program.expanded();
    }
    tracing::debug!(source_len = source.len(), program_len = program.len(), "compiled");
    Ok(program)
}
