//! Declarations of runtime functions inside a module, and calls to them.

use cranelift::prelude::{AbiParam, FunctionBuilder, InstBuilder, Type, Value};
use cranelift_codegen::ir::types::{F64, I32};
use cranelift_module::{FuncId, Linkage, Module};

use crate::errors::BuilderError;
use crate::operators::runtime;

/// Ids of the runtime functions, declared once per module.
pub(crate) struct Imports {
    pub(crate) pow: FuncId,
    pub(crate) modulo: FuncId,
    pub(crate) builtin: FuncId,
    pub(crate) call: FuncId,
    pub(crate) get: FuncId,
}

impl Imports {
    /// Declares every runtime function in `module`.
    pub(crate) fn link(module: &mut dyn Module) -> Result<Self, BuilderError> {
        let pointer = module.target_config().pointer_type();
        Ok(Self {
            pow: link(module, runtime::POW, &[F64, F64])?,
            modulo: link(module, runtime::MODULO, &[F64, F64, F64])?,
            builtin: link(module, runtime::BUILTIN, &[I32, pointer, pointer])?,
            call: link(module, runtime::CALL, &[pointer, pointer, pointer])?,
            get: link(module, runtime::GET, &[pointer])?,
        })
    }
}

/// Declares an imported function taking `params` and returning an f64.
fn link(module: &mut dyn Module, name: &str, params: &[Type]) -> Result<FuncId, BuilderError> {
    let mut sig = module.make_signature();
    sig.params.extend(params.iter().copied().map(AbiParam::new));
    sig.returns.push(AbiParam::new(F64));

    module
        .declare_function(name, Linkage::Import, &sig)
        .map_err(|e| BuilderError::DeclarationError(e.to_string()))
}

/// Emits a call to a previously linked function and returns its result.
pub(crate) fn call(
    builder: &mut FunctionBuilder,
    module: &mut dyn Module,
    func_id: FuncId,
    args: &[Value],
) -> Value {
    let func = module.declare_func_in_func(func_id, builder.func);
    let call = builder.ins().call(func, args);
    builder.inst_results(call)[0]
}
