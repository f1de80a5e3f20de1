use clap::Parser;
use spice_expr::builder::clif_listing;
use spice_expr::errors::ConvertError;
use spice_expr::expr::Expr;
use spice_expr::prelude::*;
use std::process;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "spice-expr")]
#[command(about = "Inspect, differentiate and compile behavioral expressions")]
#[command(version)]
struct Args {
    /// Expression to process, e.g. "V(out)^2 / 1000"
    expression: String,

    /// Variable assignment such as `x=2` or `V(out)=1.5`; may be repeated
    #[arg(long = "var", value_name = "NAME=VALUE")]
    vars: Vec<String>,

    /// Differentiate with respect to every assigned variable
    #[arg(long)]
    derive: bool,

    /// Use the stack executor instead of native code
    #[arg(long)]
    portable: bool,

    /// Print the Cranelift IR of the compiled expression
    #[arg(long)]
    clif: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let expr = parse(&args.expression)?;
    println!("expression: {expr}");

    let mut variables = VariableTable::<f64>::default();
    let mut assigned = Vec::new();
    for assignment in &args.vars {
        let (variable, value) = parse_assignment(assignment)?;
        variables.define(&variable, value);
        assigned.push(variable);
    }

    let options = CompilerOptions {
        native: !args.portable,
        ..CompilerOptions::default()
    };
    let mut compiler = Compiler::<RealDomain>::default().with_options(options);
    compiler.resolution_mut().push_variable(variables);

    let program = compiler.program(&expr)?;
    println!("\nprogram:\n{program}");

    let f = compiler.compile(&expr)?;
    println!("value: {}", f.invoke());

    if args.clif {
        println!("\nCLIF IR:\n{}", clif_listing(&program)?);
    }

    if args.derive {
        println!("\nderivatives:");
        match derive(&expr, &assigned)? {
            None => println!("  (zero for every variable)"),
            Some(derivatives) => {
                for (variable, df) in compiler.compile_derivatives(&derivatives)? {
                    let node = derivatives.get(&variable).map(Node::to_string);
                    println!(
                        "  d/d{variable} = {} = {}",
                        node.unwrap_or_default(),
                        df.invoke()
                    );
                }
            }
        }
    }

    Ok(())
}

/// Splits `name=value`, parsing the name with the expression syntax so `V(out)` works.
fn parse_assignment(text: &str) -> Result<(VariableNode, f64), Box<dyn std::error::Error>> {
    let (name, value) = text
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got `{text}`"))?;
    let variable = match parse(name.trim())?.expr() {
        Expr::Variable(variable) => variable.clone(),
        _ => return Err(ConvertError::QuantityArgument(name.trim().to_string()).into()),
    };
    Ok((variable, value.trim().parse()?))
}
