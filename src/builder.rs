//! Native compilation of real-domain programs with Cranelift.
//!
//! A [`Program`] is lowered instruction by instruction into a function with signature
//! `extern "C" fn() -> f64`. Captured references are embedded as absolute addresses:
//!
//! - cell-backed variables are read with a direct memory load,
//! - getters, external functions and most built-ins go through the host functions in
//!   `operators::runtime`, with arguments spilled to a stack slot,
//! - `abs`, `sqrt`, `floor`, `ceil`, `square`, comparisons, safe division and the logical
//!   operators are emitted inline.
//!
//! The addresses point into the program's reference table, so the compiled function keeps
//! the program alive for as long as the machine code can run.
//!
//! The main entry points are:
//! - `build_function()` - Compiles a program into a native [`CompiledFunction`]
//! - `clif_listing()` - Renders the Cranelift IR a program lowers to

use std::rc::Rc;
use std::sync::Arc;

use cranelift::prelude::*;
use cranelift_codegen::ir::StackSlot;
use cranelift_codegen::Context;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use isa::TargetIsa;
use tracing::debug;

use crate::domain::RealDomain;
use crate::errors::BuilderError;
use crate::expr::BinaryOp;
use crate::functions::Builtin;
use crate::operators::link::{self, Imports};
use crate::operators::runtime;
use crate::program::{CompiledFunction, Instr, Program, Reference};
use crate::types::{ExternalFunction, Getter, Tolerance, VariableSource};

/// Compiles a real-domain program to machine code.
///
/// # Errors
/// Returns a BuilderError if the host is not supported or Cranelift rejects the function.
pub fn build_function(
    program: Program<RealDomain>,
) -> Result<CompiledFunction<RealDomain>, BuilderError> {
    let program = Rc::new(program);
    let isa = create_isa()?;
    let (mut module, mut ctx) = create_module_and_context(isa)?;
    let imports = Imports::link(&mut module)?;
    build_function_body(&mut ctx, &program, &mut module, &imports)?;
    let entry = compile_and_finalize(&mut module, &mut ctx)?;

    debug!(
        instructions = program.code().len(),
        references = program.references().len(),
        "built native function"
    );

    let code = NativeCode {
        module: Some(module),
        entry,
    };
    Ok(CompiledFunction::native(
        program,
        Box::new(move || code.invoke()),
    ))
}

/// Renders the Cranelift IR generated for `program`, without compiling it.
pub fn clif_listing(program: &Program<RealDomain>) -> Result<String, BuilderError> {
    let isa = create_isa()?;
    let (mut module, mut ctx) = create_module_and_context(isa)?;
    let imports = Imports::link(&mut module)?;
    build_function_body(&mut ctx, program, &mut module, &imports)?;
    Ok(ctx.func.display().to_string())
}

/// Owns the module holding the machine code of one function.
///
/// The entry point is only reachable through `invoke`, so a closure calling it has to capture
/// the whole value and with it the module.
struct NativeCode {
    module: Option<JITModule>,
    entry: extern "C" fn() -> f64,
}

impl NativeCode {
    fn invoke(&self) -> f64 {
        (self.entry)()
    }
}

impl Drop for NativeCode {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // SAFETY: `entry` is only reachable through `self`, which is being dropped.
            unsafe { module.free_memory() };
        }
    }
}

/// Creates an Instruction Set Architecture (ISA) target for code generation.
///
/// # Errors
/// Returns a BuilderError if:
/// - The host machine architecture is not supported
/// - Code generation configuration fails
pub(crate) fn create_isa() -> Result<Arc<dyn TargetIsa>, BuilderError> {
    let mut flag_builder = settings::builder();

    // The JIT places code anywhere in memory and patches absolute addresses.
    for (name, value) in [
        ("use_colocated_libcalls", "false"),
        ("is_pic", "false"),
        ("opt_level", "speed"),
        (
            "enable_verifier",
            if cfg!(debug_assertions) { "true" } else { "false" },
        ),
    ] {
        flag_builder
            .set(name, value)
            .map_err(|e| BuilderError::SettingsError(format!("{name}: {e}")))?;
    }

    let target_triple = target_lexicon::Triple::host();
    let isa_builder = cranelift_native::builder().map_err(|msg| {
        BuilderError::HostMachineNotSupported(format!("{target_triple}: {msg}"))
    })?;

    isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(BuilderError::CodegenError)
}

/// Creates a JIT module with the runtime functions registered, and a context for a function
/// taking no parameters and returning an f64.
///
/// # Errors
/// Returns a BuilderError if `isa` generates position-independent code, which the JIT
/// cannot load.
pub(crate) fn create_module_and_context(
    isa: Arc<dyn TargetIsa>,
) -> Result<(JITModule, Context), BuilderError> {
    if isa.flags().is_pic() {
        return Err(BuilderError::SettingsError(
            "the JIT needs is_pic=false".to_string(),
        ));
    }
    let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
    runtime::register(&mut builder);

    let module = JITModule::new(builder);
    let mut ctx = module.make_context();

    let mut sig = module.make_signature();
    sig.returns.push(AbiParam::new(types::F64));
    ctx.func.signature = sig;

    Ok((module, ctx))
}

/// Lowers every instruction of `program` into the function held by `ctx`.
fn build_function_body(
    ctx: &mut Context,
    program: &Program<RealDomain>,
    module: &mut dyn Module,
    imports: &Imports,
) -> Result<(), BuilderError> {
    let pointer = module.target_config().pointer_type();
    let mut builder_ctx = FunctionBuilderContext::new();
    let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);

    let entry_block = builder.create_block();
    builder.switch_to_block(entry_block);
    builder.seal_block(entry_block);

    let slot_size = (program.max_args().max(1) * std::mem::size_of::<f64>()) as u32;
    let args = builder.create_sized_stack_slot(StackSlotData::new(
        StackSlotKind::ExplicitSlot,
        slot_size,
        3,
    ));

    let mut lowering = Lowering {
        builder,
        module,
        imports,
        pointer,
        args,
        tolerance: *program.tolerance(),
        references: program.references(),
        stack: Vec::with_capacity(program.max_depth()),
    };
    for instr in program.code() {
        let value = lowering.lower(instr)?;
        lowering.stack.push(value);
    }
    let result = lowering.pop()?;

    let mut builder = lowering.builder;
    builder.ins().return_(&[result]);
    builder.finalize();
    Ok(())
}

/// Declares, defines and finalizes the function, returning its entry point.
fn compile_and_finalize(
    module: &mut JITModule,
    ctx: &mut Context,
) -> Result<extern "C" fn() -> f64, BuilderError> {
    let func_id = module
        .declare_function("expression", Linkage::Local, &ctx.func.signature)
        .map_err(|msg| BuilderError::DeclarationError(msg.to_string()))?;

    module
        .define_function(func_id, ctx)
        .map_err(|msg| BuilderError::FunctionError(msg.to_string()))?;

    module.clear_context(ctx);
    module
        .finalize_definitions()
        .map_err(|e| BuilderError::ModuleError(Box::new(e)))?;

    // SAFETY: the function was declared with the signature `() -> f64` in the default
    // calling convention of the host, and the module owning it outlives every call.
    let entry = unsafe {
        std::mem::transmute::<*const u8, extern "C" fn() -> f64>(
            module.get_finalized_function(func_id),
        )
    };
    Ok(entry)
}

struct Lowering<'a> {
    builder: FunctionBuilder<'a>,
    module: &'a mut dyn Module,
    imports: &'a Imports,
    pointer: Type,
    args: StackSlot,
    tolerance: Tolerance,
    references: &'a [Reference<f64>],
    stack: Vec<Value>,
}

impl Lowering<'_> {
    fn lower(&mut self, instr: &Instr<f64>) -> Result<Value, BuilderError> {
        let value = match instr {
            Instr::Const(value) => self.builder.ins().f64const(*value),
            Instr::Load(index) => match self.references.get(*index) {
                Some(Reference::Variable { source, .. }) => self.load(source),
                _ => return Err(invalid(instr)),
            },
            Instr::Neg => {
                let a = self.pop()?;
                self.builder.ins().fneg(a)
            }
            Instr::Not => {
                let a = self.pop()?;
                let truthy = self.truthy(a);
                let zero = self.builder.ins().f64const(0.0);
                let one = self.builder.ins().f64const(1.0);
                self.builder.ins().select(truthy, zero, one)
            }
            Instr::Binary(op) => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.binary(*op, a, b)
            }
            Instr::Select => {
                let if_false = self.pop()?;
                let if_true = self.pop()?;
                let condition = self.pop()?;
                let truthy = self.truthy(condition);
                self.builder.ins().select(truthy, if_true, if_false)
            }
            Instr::Builtin(builtin, argc) => {
                let args = self.pop_n(*argc)?;
                self.builtin(*builtin, &args)
            }
            Instr::Call(index, argc) => {
                let args = self.pop_n(*argc)?;
                match self.references.get(*index) {
                    Some(Reference::Function { function, .. }) => self.external(function, &args),
                    _ => return Err(invalid(instr)),
                }
            }
        };
        Ok(value)
    }

    fn pop(&mut self) -> Result<Value, BuilderError> {
        self.stack
            .pop()
            .ok_or_else(|| BuilderError::FunctionError("operand stack underflow".to_string()))
    }

    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, BuilderError> {
        if self.stack.len() < n {
            return Err(BuilderError::FunctionError(
                "operand stack underflow".to_string(),
            ));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn address(&mut self, ptr: *const u8) -> Value {
        self.builder.ins().iconst(self.pointer, ptr as usize as i64)
    }

    fn load(&mut self, source: &VariableSource<f64>) -> Value {
        match source {
            VariableSource::Cell(cell) => {
                let addr = self.address(cell.as_ptr() as *const u8);
                self.builder.ins().load(types::F64, MemFlags::trusted(), addr, 0)
            }
            VariableSource::Getter(getter) => {
                let addr = self.address(getter as *const Getter<f64> as *const u8);
                self.call(self.imports.get, &[addr])
            }
        }
    }

    fn call(&mut self, func_id: cranelift_module::FuncId, args: &[Value]) -> Value {
        link::call(&mut self.builder, self.module, func_id, args)
    }

    /// Stores `args` in the argument slot and returns its address.
    fn spill(&mut self, args: &[Value]) -> Value {
        for (i, arg) in args.iter().enumerate() {
            let offset = (i * std::mem::size_of::<f64>()) as i32;
            self.builder.ins().stack_store(*arg, self.args, offset);
        }
        self.builder.ins().stack_addr(self.pointer, self.args, 0)
    }

    fn truthy(&mut self, value: Value) -> Value {
        let threshold = self
            .builder
            .ins()
            .f64const(crate::domain::TRUE_THRESHOLD);
        self.builder
            .ins()
            .fcmp(FloatCC::GreaterThan, value, threshold)
    }

    fn boolean(&mut self, condition: Value) -> Value {
        let one = self.builder.ins().f64const(1.0);
        let zero = self.builder.ins().f64const(0.0);
        self.builder.ins().select(condition, one, zero)
    }

    fn approx_eq(&mut self, a: Value, b: Value) -> Value {
        let fb = &mut self.builder;
        let same = fb.ins().fcmp(FloatCC::Equal, a, b);
        let delta = fb.ins().fsub(a, b);
        let delta = fb.ins().fabs(delta);
        let abs_a = fb.ins().fabs(a);
        let abs_b = fb.ins().fabs(b);
        let scale = fb.ins().fmax(abs_a, abs_b);
        let relative = fb.ins().f64const(self.tolerance.relative);
        let absolute = fb.ins().f64const(self.tolerance.absolute);
        let bound = fb.ins().fmul(scale, relative);
        let bound = fb.ins().fmax(bound, absolute);
        let close = fb.ins().fcmp(FloatCC::LessThanOrEqual, delta, bound);
        fb.ins().bor(same, close)
    }

    fn binary(&mut self, op: BinaryOp, a: Value, b: Value) -> Value {
        match op {
            BinaryOp::Add => self.builder.ins().fadd(a, b),
            BinaryOp::Sub => self.builder.ins().fsub(a, b),
            BinaryOp::Mul => self.builder.ins().fmul(a, b),
            BinaryOp::Div => {
                let fudge = self.builder.ins().f64const(self.tolerance.fudge);
                let magnitude = self.builder.ins().fabs(b);
                let small = self
                    .builder
                    .ins()
                    .fcmp(FloatCC::LessThan, magnitude, fudge);
                let signed = self.builder.ins().fcopysign(fudge, b);
                let divisor = self.builder.ins().select(small, signed, b);
                self.builder.ins().fdiv(a, divisor)
            }
            BinaryOp::Mod => {
                let fudge = self.builder.ins().f64const(self.tolerance.fudge);
                self.call(self.imports.modulo, &[a, b, fudge])
            }
            BinaryOp::Pow => self.call(self.imports.pow, &[a, b]),
            BinaryOp::Eq => {
                let eq = self.approx_eq(a, b);
                self.boolean(eq)
            }
            BinaryOp::Ne => {
                let eq = self.approx_eq(a, b);
                let zero = self.builder.ins().f64const(0.0);
                let one = self.builder.ins().f64const(1.0);
                self.builder.ins().select(eq, zero, one)
            }
            BinaryOp::Lt | BinaryOp::Gt | BinaryOp::Le | BinaryOp::Ge => {
                let cc = match op {
                    BinaryOp::Lt => FloatCC::LessThan,
                    BinaryOp::Gt => FloatCC::GreaterThan,
                    BinaryOp::Le => FloatCC::LessThanOrEqual,
                    _ => FloatCC::GreaterThanOrEqual,
                };
                let condition = self.builder.ins().fcmp(cc, a, b);
                self.boolean(condition)
            }
            BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => {
                let x = self.truthy(a);
                let y = self.truthy(b);
                let condition = match op {
                    BinaryOp::And => self.builder.ins().band(x, y),
                    BinaryOp::Or => self.builder.ins().bor(x, y),
                    _ => self.builder.ins().bxor(x, y),
                };
                self.boolean(condition)
            }
        }
    }

    fn builtin(&mut self, builtin: Builtin, args: &[Value]) -> Value {
        match (builtin, args) {
            (Builtin::Abs, [x]) => self.builder.ins().fabs(*x),
            (Builtin::Sqrt, [x]) => self.builder.ins().sqrt(*x),
            (Builtin::Floor, [x]) => self.builder.ins().floor(*x),
            (Builtin::Ceil, [x]) => self.builder.ins().ceil(*x),
            (Builtin::Square, [x]) => self.builder.ins().fmul(*x, *x),
            _ => {
                let addr = self.spill(args);
                let code = self.builder.ins().iconst(types::I32, builtin.code() as i64);
                let argc = self.builder.ins().iconst(self.pointer, args.len() as i64);
                self.call(self.imports.builtin, &[code, addr, argc])
            }
        }
    }

    fn external(&mut self, function: &ExternalFunction<f64>, args: &[Value]) -> Value {
        let addr = self.spill(args);
        let callee = self.address(function as *const ExternalFunction<f64> as *const u8);
        let argc = self.builder.ins().iconst(self.pointer, args.len() as i64);
        self.call(self.imports.call, &[callee, addr, argc])
    }
}

fn invalid(instr: &Instr<f64>) -> BuilderError {
    BuilderError::FunctionError(format!("instruction {instr:?} refers to a missing reference"))
}
