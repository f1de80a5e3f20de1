//! Expression compiler.
//!
//! [`Compiler::compile`] performs one recursive descent over an expression tree, emitting
//! postfix instructions through an [`Emitter`]. Every name is resolved during that descent, so
//! unknown functions and variables and argument count mismatches are reported by `compile`
//! and never by the resulting [`CompiledFunction`].
//!
//! Emission rules:
//! - Literals become immediates.
//! - Each distinct variable source or external function is captured once, however often it
//!   is referenced.
//! - `&&`, `||` and `^^` always evaluate both operands.
//! - Ternaries evaluate condition and both branches, then select on the condition.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::derivative::Derivatives;
use crate::domain::{CompilerOptions, NumericDomain};
use crate::errors::{ExpressionError, Result};
use crate::expr::{Expr, FunctionNode, Node, PropertyNode, UnaryOp, VariableNode};
use crate::functions::Builtin;
use crate::opt;
use crate::program::{CompiledFunction, Instr, Program, Reference};
use crate::resolve::{Binding, Resolution};
use crate::types::{ExternalFunction, Tolerance, VariableSource};

/// Compiles expressions for one numeric domain.
#[derive(Debug, Clone)]
pub struct Compiler<D: NumericDomain> {
    resolution: Resolution<D>,
    options: CompilerOptions,
}

impl<D: NumericDomain> Default for Compiler<D> {
    fn default() -> Self {
        Self::new(Resolution::standard())
    }
}

impl<D: NumericDomain> Compiler<D> {
    pub fn new(resolution: Resolution<D>) -> Self {
        Self {
            resolution,
            options: CompilerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CompilerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    pub fn resolution(&self) -> &Resolution<D> {
        &self.resolution
    }

    /// Resolver lists, for appending resolvers before compiling.
    pub fn resolution_mut(&mut self) -> &mut Resolution<D> {
        &mut self.resolution
    }

    /// Lowers `node` into a validated (and, if enabled, constant-folded) program.
    pub fn program(&self, node: &Node) -> Result<Program<D>> {
        let mut emitter = Emitter::new(self);
        emitter.emit(node)?;
        let program = emitter.finish()?;
        if self.options.fold_constants {
            opt::fold_constants(program)
        } else {
            Ok(program)
        }
    }

    /// Compiles `node` into a reusable callable.
    pub fn compile(&self, node: &Node) -> Result<CompiledFunction<D>> {
        let program = self.program(node)?;
        debug!(
            expression = %node,
            domain = D::NAME,
            instructions = program.code().len(),
            references = program.references().len(),
            "compiled expression"
        );
        D::finalize(program, &self.options)
    }

    /// Compiles every entry of a sparse derivative map.
    pub fn compile_derivatives(
        &self,
        derivatives: &Derivatives,
    ) -> Result<Vec<(VariableNode, CompiledFunction<D>)>> {
        derivatives
            .iter()
            .map(|(variable, node)| Ok((variable.clone(), self.compile(node)?)))
            .collect()
    }
}

/// Emission state for one compilation.
///
/// Function resolvers receive the emitter to generate code for the calls they claim.
pub struct Emitter<'a, D: NumericDomain> {
    compiler: &'a Compiler<D>,
    code: Vec<Instr<D::Value>>,
    references: Vec<Reference<D::Value>>,
    captured: HashMap<*const (), usize>,
    variables: HashMap<VariableNode, usize>,
}

impl<'a, D: NumericDomain> Emitter<'a, D> {
    fn new(compiler: &'a Compiler<D>) -> Self {
        Self {
            compiler,
            code: Vec::new(),
            references: Vec::new(),
            captured: HashMap::new(),
            variables: HashMap::new(),
        }
    }

    pub fn tolerance(&self) -> &Tolerance {
        &self.compiler.options.tolerance
    }

    pub fn resolution(&self) -> &'a Resolution<D> {
        &self.compiler.resolution
    }

    /// Number of instructions emitted so far.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Emits code leaving the value of `node` on the stack.
    pub fn emit(&mut self, node: &Node) -> Result<()> {
        match node.expr() {
            Expr::Constant(value) => self.constant(D::from_real(*value)),
            Expr::Variable(variable) => self.variable(variable)?,
            Expr::Property(property) => self.property(property)?,
            Expr::Unary(op, operand) => {
                self.emit(operand)?;
                match op {
                    UnaryOp::Plus => {}
                    UnaryOp::Minus => self.push(Instr::Neg),
                    UnaryOp::Not => self.push(Instr::Not),
                }
            }
            Expr::Binary(op, left, right) => {
                self.emit(left)?;
                self.emit(right)?;
                self.push(Instr::Binary(*op));
            }
            Expr::Ternary(condition, if_true, if_false) => {
                self.emit(condition)?;
                self.emit(if_true)?;
                self.emit(if_false)?;
                self.push(Instr::Select);
            }
            Expr::Function(call) => self.function(call)?,
        }
        Ok(())
    }

    /// Emits every argument, left to right.
    pub fn emit_args(&mut self, args: &[Node]) -> Result<()> {
        for arg in args {
            self.emit(arg)?;
        }
        Ok(())
    }

    /// Emits the arguments of `call` followed by a call of `binding`.
    pub fn emit_call(&mut self, call: &FunctionNode, binding: Binding<D::Value>) -> Result<()> {
        self.emit_args(call.args())?;
        let argc = call.args().len();
        match binding {
            Binding::Builtin(builtin) => self.builtin(builtin, argc),
            Binding::External(function) => self.call(call.name(), function, argc),
        }
        Ok(())
    }

    pub fn push(&mut self, instr: Instr<D::Value>) {
        self.code.push(instr);
    }

    pub fn constant(&mut self, value: D::Value) {
        self.push(Instr::Const(value));
    }

    pub fn builtin(&mut self, builtin: Builtin, argc: usize) {
        self.push(Instr::Builtin(builtin, argc));
    }

    /// Emits a load of a variable source, capturing it on first use.
    pub fn load(&mut self, label: impl Into<String>, source: VariableSource<D::Value>) {
        let index = self.capture(Reference::Variable {
            label: label.into(),
            source,
        });
        self.push(Instr::Load(index));
    }

    /// Emits a call of an external function on the top `argc` stack values.
    pub fn call(&mut self, label: impl Into<String>, function: ExternalFunction<D::Value>, argc: usize) {
        let index = self.capture(Reference::Function {
            label: label.into(),
            function,
        });
        self.push(Instr::Call(index, argc));
    }

    fn capture(&mut self, reference: Reference<D::Value>) -> usize {
        let identity = reference.identity();
        if let Some(index) = self.captured.get(&identity) {
            return *index;
        }
        let index = self.references.len();
        trace!(label = reference.label(), index, "captured reference");
        self.references.push(reference);
        self.captured.insert(identity, index);
        index
    }

    fn variable(&mut self, variable: &VariableNode) -> Result<()> {
        if let Some(index) = self.variables.get(variable) {
            self.push(Instr::Load(*index));
            return Ok(());
        }
        let source = self.resolution().resolve_variable(variable)?;
        self.load(variable.to_string(), source);
        if let Some(Instr::Load(index)) = self.code.last() {
            self.variables.insert(variable.clone(), *index);
        }
        Ok(())
    }

    fn property(&mut self, property: &PropertyNode) -> Result<()> {
        let source = self.resolution().resolve_property(property)?;
        self.load(Node::new(Expr::Property(property.clone())).to_string(), source);
        Ok(())
    }

    fn function(&mut self, call: &FunctionNode) -> Result<()> {
        let resolution = self.resolution();
        for (index, resolver) in resolution.function_resolvers().iter().enumerate() {
            let code = self.code.len();
            let references = self.references.len();
            if resolver.emit(call, self)? {
                trace!(function = call.name(), resolver = index, "function emitted");
                return Ok(());
            }
            self.rollback(code, references);
        }
        Err(ExpressionError::UnrecognizedFunction(call.name().to_string()))
    }

    /// Forgets everything emitted and captured past the given lengths.
    fn rollback(&mut self, code: usize, references: usize) {
        self.code.truncate(code);
        if self.references.len() > references {
            self.references.truncate(references);
            self.captured.retain(|_, index| *index < references);
            self.variables.retain(|_, index| *index < references);
        }
    }

    fn finish(self) -> Result<Program<D>> {
        Program::new(self.code, self.references, self.compiler.options.tolerance)
    }
}

/// Compiles `node` with the standard resolution and default options.
pub fn compile<D: NumericDomain>(node: &Node) -> Result<CompiledFunction<D>> {
    Compiler::<D>::default().compile(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ComplexDomain, RealDomain};
    use crate::resolve::{FunctionTable, VariableTable};
    use num_complex::Complex64;
    use std::rc::Rc;

    fn portable() -> CompilerOptions {
        CompilerOptions {
            native: false,
            ..CompilerOptions::default()
        }
    }

    #[test]
    fn test_constants_are_immediates() {
        let compiler = Compiler::<RealDomain>::default().with_options(CompilerOptions {
            fold_constants: false,
            ..portable()
        });
        let program = compiler.program(&(Node::constant(2.0) * 3.0)).unwrap();
        assert!(program.references().is_empty());
        assert_eq!(program.code()[0], Instr::Const(2.0));
    }

    #[test]
    fn test_references_are_deduplicated() {
        let mut table = VariableTable::<f64>::default();
        table.define(&VariableNode::named("x"), 3.0);
        let alias = table.get(&VariableNode::named("x")).unwrap().clone();
        table.insert(&VariableNode::named("y"), alias);
        let mut functions = FunctionTable::<f64>::default();
        functions.define("f", |args| args.iter().sum());

        let mut compiler = Compiler::<RealDomain>::default().with_options(portable());
        compiler
            .resolution_mut()
            .push_variable(table)
            .push_function(functions);

        let x = Node::named("x");
        let expr = Node::function("f", vec![x.clone(), x.clone()])
            + Node::function("F", vec![Node::named("y")])
            + x;
        let f = compiler.compile(&expr).unwrap();
        assert_eq!(f.program().references().len(), 2);
        assert_eq!(f.invoke(), 6.0 + 3.0 + 3.0);
    }

    #[test]
    fn test_errors_are_eager() {
        let compiler = Compiler::<RealDomain>::default().with_options(portable());
        assert!(matches!(
            compiler.compile(&Node::function("nope", vec![])),
            Err(ExpressionError::UnrecognizedFunction(_))
        ));
        assert!(matches!(
            compiler.compile(&Node::voltage("out")),
            Err(ExpressionError::UnrecognizedVariable { .. })
        ));
        assert!(matches!(
            compiler.compile(&Node::function("atan2", vec![Node::one()])),
            Err(ExpressionError::ArgumentCountMismatch { expected: 2, actual: 1, .. })
        ));
        let pwl = Node::function("pwl", vec![Node::one(), Node::zero(), Node::zero(), Node::one()]);
        assert!(matches!(
            compiler.compile(&pwl),
            Err(ExpressionError::ArgumentCountMismatch { .. })
        ));
    }

    #[test]
    fn test_declined_emission_is_discarded() {
        struct Greedy;
        impl crate::resolve::FunctionResolver<RealDomain> for Greedy {
            fn resolve(&self, _: &FunctionNode) -> Result<Option<Binding<f64>>> {
                Ok(None)
            }

            fn emit(&self, call: &FunctionNode, emitter: &mut Emitter<'_, RealDomain>) -> Result<bool> {
                emitter.emit_args(call.args())?;
                Ok(false)
            }
        }

        let mut compiler = Compiler::<RealDomain>::new(Resolution::empty()).with_options(portable());
        compiler
            .resolution_mut()
            .push_function(Greedy)
            .push_function(crate::resolve::BuiltinFunctions::default());
        let f = compiler
            .compile(&Node::function("max", vec![Node::one(), Node::constant(2.0)]))
            .unwrap();
        assert_eq!(f.invoke(), 2.0);
    }

    #[test]
    fn test_declined_emission_releases_captures() {
        struct Tentative;
        impl crate::resolve::FunctionResolver<RealDomain> for Tentative {
            fn resolve(&self, _: &FunctionNode) -> Result<Option<Binding<f64>>> {
                Ok(None)
            }

            fn emit(&self, call: &FunctionNode, emitter: &mut Emitter<'_, RealDomain>) -> Result<bool> {
                emitter.emit_args(call.args())?;
                emitter.load("scratch", VariableSource::new(7.0));
                emitter.call("scratch", Rc::new(|args: &[f64]| args[0]), 1);
                Ok(false)
            }
        }

        let mut table = VariableTable::<f64>::default();
        let x = table.define(&VariableNode::named("x"), -3.0);
        let mut compiler = Compiler::<RealDomain>::new(Resolution::empty()).with_options(portable());
        compiler
            .resolution_mut()
            .push_function(Tentative)
            .push_function(crate::resolve::BuiltinFunctions::default())
            .push_variable(table);

        let x_node = Node::named("x");
        let f = compiler
            .compile(&(Node::function("abs", vec![x_node.clone()]) + x_node))
            .unwrap();
        let references = f.program().references();
        assert_eq!(references.len(), 1);
        assert_eq!(references[0].label(), "x");
        assert_eq!(f.invoke(), 0.0);
        x.set(2.0);
        assert_eq!(f.invoke(), 4.0);
    }

    #[test]
    fn test_complex_domain() {
        let mut table = VariableTable::<Complex64>::default();
        let s = table.define(&VariableNode::named("s"), Complex64::new(0.0, 1.0));
        let mut compiler = Compiler::<ComplexDomain>::default();
        compiler.resolution_mut().push_variable(table);

        let f = compiler.compile(&(Node::named("s") * Node::named("s"))).unwrap();
        assert!(!f.is_native());
        assert_eq!(f.invoke(), Complex64::new(-1.0, 0.0));
        s.set(Complex64::new(2.0, 0.0));
        assert_eq!(f.invoke(), Complex64::new(4.0, 0.0));

        let g = compiler
            .compile(&Node::gt(Node::named("s"), Node::constant(1.0)))
            .unwrap();
        assert_eq!(g.invoke(), Complex64::new(1.0, 0.0));
    }
}
