use anyhow::Context;
use clap::Parser;
use codesnake::{Block, CodeWidth, Label, LineIndex};
use sift::{lexer::Span, Bindings, Environment, Value};
use yansi::Paint;

#[derive(Parser)]
#[command(about = "Interactive shell for sift rule expressions")]
struct Cli {
    /// Bind a variable, e.g. `--bind age=30` or `--bind country=SE`
    #[arg(short, long = "bind", value_name = "NAME=VALUE")]
    bind: Vec<String>,
    /// Parse the infix surface instead of prefix S-expressions
    #[arg(long)]
    infix: bool,
    /// Print the compiled instruction listing before evaluating
    #[arg(long)]
    list: bool,
    /// Evaluate one expression and exit instead of starting the shell
    expression: Option<String>,
}

fn parse_binding(spec: &str) -> anyhow::Result<(String, Value)> {
    let (name, value) = spec
        .split_once('=')
        .context("bindings take the form NAME=VALUE")?;
    let value = match value {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => match value.parse::<i64>() {
            Ok(n) => Value::Int(n),
            Err(_) => Value::str(value),
        },
    };
    Ok((name.to_string(), value))
}

fn report(source: &str, span: Option<Span>, message: &str) {
    let idx = LineIndex::new(source);
    let block = span.and_then(|span| {
        Block::new(
            &idx,
            [Label::new(span).with_text(message.red().to_string())],
        )
    });
    match block {
        Some(block) => {
            let block = block.map_code(|c| CodeWidth::new(c, c.len()));
            eprintln!("{}[rule]", block.prologue());
            eprint!("{block}");
            eprintln!("{}", block.epilogue());
        }
        None => eprintln!("{}: {message}", "error".red()),
    }
}

fn run(env: &Environment, bindings: &Bindings, source: &str, list: bool) {
    match sift::compile(env, source) {
        Err(error) => report(source, error.span(), &error.to_string()),
        Ok(program) => {
            if list {
                print!("{program}");
            }
            match program.evaluate(bindings) {
                Ok(value) => println!("{}", value.to_string().green()),
                Err(error) => report(source, None, &error.to_string()),
            }
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut env = Environment::default();
    // the shell has no declared variable set; resolve names at evaluation
    env.options.free_variables = true;
    env.options.infix = cli.infix;

    let mut bindings = Bindings::new();
    for spec in &cli.bind {
        let (name, value) = parse_binding(spec)?;
        bindings.set(name, value);
    }

    if let Some(expression) = cli.expression {
        run(&env, &bindings, &expression, cli.list);
        return Ok(());
    }

    let mut readline = rustyline::DefaultEditor::new()?;
    while let Ok(input) = readline.readline(">> ") {
        if input.trim().is_empty() {
            continue;
        }
        readline.add_history_entry(&input)?;
        run(&env, &bindings, &input, cli.list);
    }

    Ok(())
}
