//! Compiled instruction streams and the callables built from them.
//!
//! The compiler lowers an expression tree into a flat postfix sequence of [`Instr`]s operating
//! on a value stack, bound to a private table of captured [`Reference`]s. A [`Program`] can be
//! run directly by the stack executor, or (in the real domain) lowered further to native code.
//!
//! Literal constants are stored inline in the instruction stream. Variable sources and external
//! functions live in the reference table, once per distinct shared allocation.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use colored::Colorize;

use crate::domain::NumericDomain;
use crate::errors::{ExpressionError, Result};
use crate::expr::BinaryOp;
use crate::functions::Builtin;
use crate::types::{ExternalFunction, Tolerance, VariableSource};

/// A single stack-machine instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr<V> {
    /// Push an immediate value
    Const(V),
    /// Push the current value of the variable at a reference index
    Load(usize),
    /// Negate the top of the stack
    Neg,
    /// Logical negation of the top of the stack (1 if not true, else 0)
    Not,
    /// Pop two operands and push the result of a binary operator
    Binary(BinaryOp),
    /// Pop `if_false`, `if_true` and `condition`, push the branch picked by the condition
    Select,
    /// Pop `argc` arguments and push the result of a built-in
    Builtin(Builtin, usize),
    /// Pop `argc` arguments and push the result of the external function at a reference index
    Call(usize, usize),
}

impl<V> Instr<V> {
    /// Number of values consumed. Every instruction pushes exactly one.
    pub fn arity(&self) -> usize {
        match self {
            Instr::Const(_) | Instr::Load(_) => 0,
            Instr::Neg | Instr::Not => 1,
            Instr::Binary(_) => 2,
            Instr::Select => 3,
            Instr::Builtin(_, argc) | Instr::Call(_, argc) => *argc,
        }
    }
}

/// A value captured by a program.
pub enum Reference<V> {
    Variable {
        label: String,
        source: VariableSource<V>,
    },
    Function {
        label: String,
        function: ExternalFunction<V>,
    },
}

impl<V: Copy + 'static> Reference<V> {
    pub fn label(&self) -> &str {
        match self {
            Reference::Variable { label, .. } | Reference::Function { label, .. } => label,
        }
    }

    /// Address of the shared allocation, used to deduplicate captures.
    pub fn identity(&self) -> *const () {
        match self {
            Reference::Variable { source, .. } => source.identity(),
            Reference::Function { function, .. } => Rc::as_ptr(function) as *const (),
        }
    }
}

impl<V> Clone for Reference<V> {
    fn clone(&self) -> Self {
        match self {
            Reference::Variable { label, source } => Reference::Variable {
                label: label.clone(),
                source: source.clone(),
            },
            Reference::Function { label, function } => Reference::Function {
                label: label.clone(),
                function: function.clone(),
            },
        }
    }
}

impl<V> fmt::Debug for Reference<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Variable { label, .. } => write!(f, "Variable({label})"),
            Reference::Function { label, .. } => write!(f, "Function({label})"),
        }
    }
}

/// A validated instruction stream with its reference table.
pub struct Program<D: NumericDomain> {
    code: Vec<Instr<D::Value>>,
    references: Vec<Reference<D::Value>>,
    tolerance: Tolerance,
    max_depth: usize,
    max_args: usize,
}

impl<D: NumericDomain> Clone for Program<D> {
    fn clone(&self) -> Self {
        Self {
            code: self.code.clone(),
            references: self.references.clone(),
            tolerance: self.tolerance,
            max_depth: self.max_depth,
            max_args: self.max_args,
        }
    }
}

impl<D: NumericDomain> fmt::Debug for Program<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("domain", &D::NAME)
            .field("code", &self.code)
            .field("references", &self.references)
            .field("max_depth", &self.max_depth)
            .finish()
    }
}

impl<D: NumericDomain> Program<D> {
    /// Checks that `code` leaves exactly one value on the stack and that every reference index
    /// points at an entry of the right kind.
    pub fn new(
        code: Vec<Instr<D::Value>>,
        references: Vec<Reference<D::Value>>,
        tolerance: Tolerance,
    ) -> Result<Self> {
        let mut depth = 0usize;
        let mut max_depth = 0usize;
        let mut max_args = 0usize;
        for (position, instr) in code.iter().enumerate() {
            let arity = instr.arity();
            if depth < arity {
                return Err(ExpressionError::InvalidOperator(format!(
                    "instruction {position} ({instr:?}) needs {arity} operand(s), stack holds {depth}"
                )));
            }
            match instr {
                Instr::Load(index) => match references.get(*index) {
                    Some(Reference::Variable { .. }) => {}
                    _ => {
                        return Err(ExpressionError::InvalidOperator(format!(
                            "instruction {position} loads missing variable #{index}"
                        )))
                    }
                },
                Instr::Call(index, _) => match references.get(*index) {
                    Some(Reference::Function { .. }) => {}
                    _ => {
                        return Err(ExpressionError::InvalidOperator(format!(
                            "instruction {position} calls missing function #{index}"
                        )))
                    }
                },
                _ => {}
            }
            if matches!(instr, Instr::Builtin(..) | Instr::Call(..)) {
                max_args = max_args.max(arity);
            }
            depth = depth - arity + 1;
            max_depth = max_depth.max(depth);
        }
        if depth != 1 {
            return Err(ExpressionError::InvalidOperator(format!(
                "program leaves {depth} value(s) on the stack"
            )));
        }
        Ok(Self {
            code,
            references,
            tolerance,
            max_depth,
            max_args,
        })
    }

    pub fn code(&self) -> &[Instr<D::Value>] {
        &self.code
    }

    pub fn references(&self) -> &[Reference<D::Value>] {
        &self.references
    }

    pub fn tolerance(&self) -> &Tolerance {
        &self.tolerance
    }

    /// Largest stack height reached while running.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Largest argument count of any call.
    pub fn max_args(&self) -> usize {
        self.max_args
    }

    /// The value of a program consisting of a single immediate.
    pub fn constant_value(&self) -> Option<D::Value> {
        match self.code.as_slice() {
            [Instr::Const(value)] => Some(*value),
            _ => None,
        }
    }

    /// Splits the program into its parts.
    pub fn into_parts(self) -> (Vec<Instr<D::Value>>, Vec<Reference<D::Value>>, Tolerance) {
        (self.code, self.references, self.tolerance)
    }

    /// Runs the program on `stack`, which is cleared first.
    pub fn execute(&self, stack: &mut Vec<D::Value>) -> D::Value {
        stack.clear();
        let tolerance = &self.tolerance;
        for instr in &self.code {
            let value = match instr {
                Instr::Const(value) => *value,
                Instr::Load(index) => match &self.references[*index] {
                    Reference::Variable { source, .. } => source.value(),
                    Reference::Function { .. } => D::from_real(f64::NAN),
                },
                Instr::Neg => {
                    let a = pop::<D>(stack);
                    D::neg(a)
                }
                Instr::Not => {
                    let a = pop::<D>(stack);
                    D::boolean(!D::truthy(a))
                }
                Instr::Binary(op) => {
                    let b = pop::<D>(stack);
                    let a = pop::<D>(stack);
                    D::binary(*op, a, b, tolerance)
                }
                Instr::Select => {
                    let if_false = pop::<D>(stack);
                    let if_true = pop::<D>(stack);
                    let condition = pop::<D>(stack);
                    if D::truthy(condition) {
                        if_true
                    } else {
                        if_false
                    }
                }
                Instr::Builtin(builtin, argc) => {
                    let start = stack.len() - argc;
                    let value = D::apply(*builtin, &stack[start..]);
                    stack.truncate(start);
                    value
                }
                Instr::Call(index, argc) => {
                    let start = stack.len() - argc;
                    let value = match &self.references[*index] {
                        Reference::Function { function, .. } => function(&stack[start..]),
                        Reference::Variable { .. } => D::from_real(f64::NAN),
                    };
                    stack.truncate(start);
                    value
                }
            };
            stack.push(value);
        }
        pop::<D>(stack)
    }

    /// Wraps the program in a callable running on the stack executor.
    pub fn into_function(self) -> CompiledFunction<D> {
        let stack = Vec::with_capacity(self.max_depth);
        CompiledFunction {
            program: Rc::new(self),
            backend: Backend::Stack(RefCell::new(stack)),
        }
    }
}

fn pop<D: NumericDomain>(stack: &mut Vec<D::Value>) -> D::Value {
    stack.pop().unwrap_or_else(|| D::from_real(f64::NAN))
}

/// Prints a colored listing, one instruction per line.
impl<D: NumericDomain> fmt::Display for Program<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} {} ({} instructions, stack depth {})",
            "program".cyan(),
            D::NAME,
            self.code.len(),
            self.max_depth
        )?;
        for (index, reference) in self.references.iter().enumerate() {
            let kind = match reference {
                Reference::Variable { .. } => "var",
                Reference::Function { .. } => "fn",
            };
            writeln!(f, "  {} {:<3} {}", format!("#{index}").yellow(), kind, reference.label())?;
        }
        for (position, instr) in self.code.iter().enumerate() {
            let text = match instr {
                Instr::Const(value) => format!("{} {:?}", "const".green(), value),
                Instr::Load(index) => format!(
                    "{} {} {}",
                    "load".green(),
                    format!("#{index}").yellow(),
                    self.references[*index].label()
                ),
                Instr::Neg => "neg".green().to_string(),
                Instr::Not => "not".green().to_string(),
                Instr::Binary(op) => format!("{} {}", "op".green(), op.symbol()),
                Instr::Select => "select".green().to_string(),
                Instr::Builtin(builtin, argc) => {
                    format!("{} {}/{}", "builtin".green(), builtin, argc)
                }
                Instr::Call(index, argc) => format!(
                    "{} {} {}/{}",
                    "call".green(),
                    format!("#{index}").yellow(),
                    self.references[*index].label(),
                    argc
                ),
            };
            writeln!(f, "  {position:>4}  {text}")?;
        }
        Ok(())
    }
}

enum Backend<V> {
    Stack(RefCell<Vec<V>>),
    Native(Box<dyn Fn() -> V>),
}

/// A compiled expression, invoked repeatedly without re-compiling.
///
/// Each invocation reads the current values of the captured variable sources. Not safe to
/// share across threads; the owner of the captured state serializes access.
pub struct CompiledFunction<D: NumericDomain> {
    program: Rc<Program<D>>,
    backend: Backend<D::Value>,
}

impl<D: NumericDomain> CompiledFunction<D> {
    /// Wraps native code generated from `program`. The program must outlive the code, since
    /// the code addresses its reference table directly.
    pub(crate) fn native(program: Rc<Program<D>>, entry: Box<dyn Fn() -> D::Value>) -> Self {
        Self {
            program,
            backend: Backend::Native(entry),
        }
    }

    /// Evaluates the expression.
    pub fn invoke(&self) -> D::Value {
        match &self.backend {
            Backend::Native(entry) => entry(),
            Backend::Stack(stack) => match stack.try_borrow_mut() {
                Ok(mut stack) => self.program.execute(&mut stack),
                // Re-entered from an external function
                Err(_) => self.program.execute(&mut Vec::with_capacity(self.program.max_depth)),
            },
        }
    }

    pub fn program(&self) -> &Program<D> {
        &self.program
    }

    /// True if the function runs native code.
    pub fn is_native(&self) -> bool {
        matches!(self.backend, Backend::Native(_))
    }
}

impl<D: NumericDomain> fmt::Debug for CompiledFunction<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("native", &self.is_native())
            .field("program", &self.program)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ComplexDomain, RealDomain};
    use num_complex::Complex64;

    fn program(code: Vec<Instr<f64>>, references: Vec<Reference<f64>>) -> Result<Program<RealDomain>> {
        Program::new(code, references, Tolerance::default())
    }

    #[test]
    fn test_validation() {
        assert!(program(vec![Instr::Const(1.0), Instr::Binary(BinaryOp::Add)], vec![]).is_err());
        assert!(program(vec![Instr::Const(1.0), Instr::Const(2.0)], vec![]).is_err());
        assert!(program(vec![Instr::Load(0)], vec![]).is_err());
        let p = program(
            vec![Instr::Const(1.0), Instr::Const(2.0), Instr::Binary(BinaryOp::Add)],
            vec![],
        )
        .unwrap();
        assert_eq!(p.max_depth(), 2);
    }

    #[test]
    fn test_execute_reads_live_values() {
        let x = VariableSource::new(2.0);
        let p = program(
            vec![
                Instr::Load(0),
                Instr::Const(3.0),
                Instr::Binary(BinaryOp::Mul),
                Instr::Builtin(Builtin::Sqrt, 1),
            ],
            vec![Reference::Variable {
                label: "x".to_string(),
                source: x.clone(),
            }],
        )
        .unwrap();
        let f = p.into_function();
        assert!(!f.is_native());
        assert!((f.invoke() - 6f64.sqrt()).abs() < 1e-12);
        x.set(12.0);
        assert_eq!(f.invoke(), 6.0);
    }

    #[test]
    fn test_select_and_not() {
        let p = program(
            vec![
                Instr::Const(0.0),
                Instr::Not,
                Instr::Const(0.25),
                Instr::Const(0.75),
                Instr::Select,
            ],
            vec![],
        )
        .unwrap();
        assert_eq!(p.into_function().invoke(), 0.25);
    }

    #[test]
    fn test_complex_comparison_rewraps() {
        let p = Program::<ComplexDomain>::new(
            vec![
                Instr::Const(Complex64::new(1.0, 3.0)),
                Instr::Const(Complex64::new(2.0, -3.0)),
                Instr::Binary(BinaryOp::Lt),
            ],
            vec![],
            Tolerance::default(),
        )
        .unwrap();
        assert_eq!(p.into_function().invoke(), Complex64::new(1.0, 0.0));
    }

    #[test]
    fn test_listing_mentions_references() {
        colored::control::set_override(false);
        let p = program(
            vec![Instr::Load(0), Instr::Neg],
            vec![Reference::Variable {
                label: "V(out)".to_string(),
                source: VariableSource::new(1.0),
            }],
        )
        .unwrap();
        let listing = p.to_string();
        assert!(listing.contains("#0 var V(out)"));
        assert!(listing.contains("load #0 V(out)"));
        assert!(listing.contains("neg"));
    }
}
