//! Host functions called from native code.
//!
//! Native code cannot call Rust closures or generic functions directly. These `extern "C"`
//! entry points bridge the gap: native code passes raw pointers to captured values (owned by
//! the program the code was built from) together with a pointer/length pair for arguments.
//!
//! A panic unwinding out of a callback aborts the process.

use std::slice;

use cranelift_jit::JITBuilder;

use crate::functions::{self, Builtin};
use crate::types::{ExternalFunction, Getter};

pub(crate) const POW: &str = "spice_pow";
pub(crate) const MODULO: &str = "spice_mod";
pub(crate) const BUILTIN: &str = "spice_builtin";
pub(crate) const CALL: &str = "spice_call";
pub(crate) const GET: &str = "spice_get";

/// Makes every runtime entry point resolvable by name.
pub(crate) fn register(builder: &mut JITBuilder) {
    builder.symbol(POW, spice_pow as *const u8);
    builder.symbol(MODULO, spice_mod as *const u8);
    builder.symbol(BUILTIN, spice_builtin as *const u8);
    builder.symbol(CALL, spice_call as *const u8);
    builder.symbol(GET, spice_get as *const u8);
}

extern "C" fn spice_pow(base: f64, exponent: f64) -> f64 {
    base.powf(exponent)
}

extern "C" fn spice_mod(left: f64, right: f64, fudge: f64) -> f64 {
    functions::safe_modulo(left, right, fudge)
}

/// # Safety
/// `args` must point at `argc` initialized values.
unsafe extern "C" fn spice_builtin(code: u32, args: *const f64, argc: usize) -> f64 {
    let args = unsafe { slice::from_raw_parts(args, argc) };
    match Builtin::from_code(code) {
        Some(builtin) => functions::apply_real(builtin, args),
        None => f64::NAN,
    }
}

/// # Safety
/// `function` must point at a live external function and `args` at `argc` initialized values.
unsafe extern "C" fn spice_call(
    function: *const ExternalFunction<f64>,
    args: *const f64,
    argc: usize,
) -> f64 {
    let (function, args) = unsafe { (&*function, slice::from_raw_parts(args, argc)) };
    function(args)
}

/// # Safety
/// `getter` must point at a live getter.
unsafe extern "C" fn spice_get(getter: *const Getter<f64>) -> f64 {
    let getter = unsafe { &*getter };
    getter()
}
