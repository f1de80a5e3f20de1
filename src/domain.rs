//! Numeric domains.
//!
//! Expressions evaluate either to real numbers (DC and transient analyses) or to complex
//! numbers (AC analysis). Both backends are generic over a [`NumericDomain`], which supplies
//! the arithmetic primitives, the boolean threshold convention and the real-part extraction
//! used by comparisons, logic and modulo.

use std::fmt;

use num_complex::Complex64;

use crate::errors::Result;
use crate::expr::BinaryOp;
use crate::functions::{self, Builtin};
use crate::program::{CompiledFunction, Program};
use crate::types::Tolerance;

/// Threshold above which a value counts as true.
pub const TRUE_THRESHOLD: f64 = 0.5;

/// Options that affect how a program is turned into a callable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompilerOptions {
    pub tolerance: Tolerance,
    /// Lower real-domain programs to native code
    pub native: bool,
    /// Fold operations on immediate operands before execution
    pub fold_constants: bool,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            tolerance: Tolerance::default(),
            native: true,
            fold_constants: true,
        }
    }
}

/// A numeric representation expressions can be evaluated in.
pub trait NumericDomain: Sized + 'static {
    type Value: Copy + PartialEq + fmt::Debug + 'static;

    const NAME: &'static str;

    /// Embeds a real number (zero imaginary part).
    fn from_real(value: f64) -> Self::Value;

    /// Extracts the real part. Identity for the real domain.
    fn real(value: Self::Value) -> f64;

    fn add(a: Self::Value, b: Self::Value) -> Self::Value;
    fn sub(a: Self::Value, b: Self::Value) -> Self::Value;
    fn mul(a: Self::Value, b: Self::Value) -> Self::Value;
    fn neg(a: Self::Value) -> Self::Value;

    /// Division that never produces an uncontrolled infinity for tiny denominators.
    fn div(a: Self::Value, b: Self::Value, tolerance: &Tolerance) -> Self::Value;

    fn pow(a: Self::Value, b: Self::Value) -> Self::Value;

    /// Applies a built-in to evaluated arguments; counts must already be checked.
    fn apply(builtin: Builtin, args: &[Self::Value]) -> Self::Value;

    /// Modulo on real parts.
    fn modulo(a: Self::Value, b: Self::Value, tolerance: &Tolerance) -> Self::Value {
        Self::from_real(functions::safe_modulo(
            Self::real(a),
            Self::real(b),
            tolerance.fudge,
        ))
    }

    fn truthy(value: Self::Value) -> bool {
        Self::real(value) > TRUE_THRESHOLD
    }

    fn boolean(value: bool) -> Self::Value {
        Self::from_real(if value { 1.0 } else { 0.0 })
    }

    /// Evaluates a comparison or logical operator on real parts, yielding 1 or 0.
    fn relation(op: BinaryOp, a: Self::Value, b: Self::Value, tolerance: &Tolerance) -> bool {
        let (x, y) = (Self::real(a), Self::real(b));
        match op {
            BinaryOp::Eq => tolerance.approx_eq(x, y),
            BinaryOp::Ne => !tolerance.approx_eq(x, y),
            BinaryOp::Lt => x < y,
            BinaryOp::Gt => x > y,
            BinaryOp::Le => x <= y,
            BinaryOp::Ge => x >= y,
            BinaryOp::And => x > TRUE_THRESHOLD && y > TRUE_THRESHOLD,
            BinaryOp::Or => x > TRUE_THRESHOLD || y > TRUE_THRESHOLD,
            BinaryOp::Xor => (x > TRUE_THRESHOLD) != (y > TRUE_THRESHOLD),
            _ => false,
        }
    }

    /// Evaluates any binary operator.
    fn binary(op: BinaryOp, a: Self::Value, b: Self::Value, tolerance: &Tolerance) -> Self::Value {
        match op {
            BinaryOp::Add => Self::add(a, b),
            BinaryOp::Sub => Self::sub(a, b),
            BinaryOp::Mul => Self::mul(a, b),
            BinaryOp::Div => Self::div(a, b, tolerance),
            BinaryOp::Mod => Self::modulo(a, b, tolerance),
            BinaryOp::Pow => Self::pow(a, b),
            _ => Self::boolean(Self::relation(op, a, b, tolerance)),
        }
    }

    /// Turns a finished program into a callable.
    fn finalize(
        program: Program<Self>,
        options: &CompilerOptions,
    ) -> Result<CompiledFunction<Self>> {
        let _ = options;
        Ok(program.into_function())
    }
}

/// Real numbers, mapped directly onto hardware arithmetic.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealDomain;

impl NumericDomain for RealDomain {
    type Value = f64;

    const NAME: &'static str = "real";

    fn from_real(value: f64) -> f64 {
        value
    }

    fn real(value: f64) -> f64 {
        value
    }

    fn add(a: f64, b: f64) -> f64 {
        a + b
    }

    fn sub(a: f64, b: f64) -> f64 {
        a - b
    }

    fn mul(a: f64, b: f64) -> f64 {
        a * b
    }

    fn neg(a: f64) -> f64 {
        -a
    }

    fn div(a: f64, b: f64, tolerance: &Tolerance) -> f64 {
        functions::safe_divide(a, b, tolerance.fudge)
    }

    fn pow(a: f64, b: f64) -> f64 {
        a.powf(b)
    }

    fn apply(builtin: Builtin, args: &[f64]) -> f64 {
        functions::apply_real(builtin, args)
    }

    fn finalize(program: Program<Self>, options: &CompilerOptions) -> Result<CompiledFunction<Self>> {
        if options.native {
            Ok(crate::builder::build_function(program)?)
        } else {
            Ok(program.into_function())
        }
    }
}

/// Complex numbers for small-signal analysis.
///
/// Relational, logical and modulo operators work on the real part and re-wrap the result
/// with a zero imaginary part.
#[derive(Debug, Clone, Copy, Default)]
pub struct ComplexDomain;

impl ComplexDomain {
    fn real_fn(value: Complex64, f: impl Fn(f64) -> f64) -> Complex64 {
        Complex64::new(f(value.re), 0.0)
    }

    fn select_by_real(args: &[Complex64], pick_max: bool) -> Complex64 {
        let mut best = match args.first() {
            Some(first) => *first,
            None => return Complex64::new(0.0, 0.0),
        };
        for arg in &args[1..] {
            if (pick_max && arg.re > best.re) || (!pick_max && arg.re < best.re) {
                best = *arg;
            }
        }
        best
    }

    fn pwr(x: Complex64, y: Complex64) -> Complex64 {
        if x.re < 0.0 {
            -Self::powc(-x, y)
        } else {
            Self::powc(x, y)
        }
    }

    fn powc(a: Complex64, b: Complex64) -> Complex64 {
        if b.im == 0.0 {
            if b.re.fract() == 0.0 && b.re.abs() < i32::MAX as f64 {
                return a.powi(b.re as i32);
            }
            if a.im == 0.0 && a.re >= 0.0 {
                return Complex64::new(a.re.powf(b.re), 0.0);
            }
            return a.powf(b.re);
        }
        if a.re == 0.0 && a.im == 0.0 {
            return Complex64::new(0.0, 0.0);
        }
        a.powc(b)
    }
}

impl NumericDomain for ComplexDomain {
    type Value = Complex64;

    const NAME: &'static str = "complex";

    fn from_real(value: f64) -> Complex64 {
        Complex64::new(value, 0.0)
    }

    fn real(value: Complex64) -> f64 {
        value.re
    }

    fn add(a: Complex64, b: Complex64) -> Complex64 {
        a + b
    }

    fn sub(a: Complex64, b: Complex64) -> Complex64 {
        a - b
    }

    fn mul(a: Complex64, b: Complex64) -> Complex64 {
        a * b
    }

    fn neg(a: Complex64) -> Complex64 {
        -a
    }

    fn div(a: Complex64, b: Complex64, tolerance: &Tolerance) -> Complex64 {
        if b.norm() < tolerance.fudge {
            a / Complex64::new(tolerance.fudge.copysign(b.re), 0.0)
        } else {
            a / b
        }
    }

    fn pow(a: Complex64, b: Complex64) -> Complex64 {
        Self::powc(a, b)
    }

    fn apply(builtin: Builtin, args: &[Complex64]) -> Complex64 {
        let zero = Complex64::new(0.0, 0.0);
        let arg = |i: usize| args.get(i).copied().unwrap_or(zero);
        match builtin {
            Builtin::Abs => Complex64::new(arg(0).norm(), 0.0),
            Builtin::Sgn => Self::real_fn(arg(0), functions::sgn),
            Builtin::Sqrt => arg(0).sqrt(),
            Builtin::Exp => arg(0).exp(),
            Builtin::Log => arg(0).ln(),
            Builtin::Log10 => arg(0).log10(),
            Builtin::Pow => Self::powc(arg(0), arg(1)),
            Builtin::Pwr => Self::pwr(arg(0), arg(1)),
            Builtin::Square => arg(0) * arg(0),
            Builtin::Sin => arg(0).sin(),
            Builtin::Cos => arg(0).cos(),
            Builtin::Tan => arg(0).tan(),
            Builtin::Asin => arg(0).asin(),
            Builtin::Acos => arg(0).acos(),
            Builtin::Atan => arg(0).atan(),
            Builtin::Atan2 => Complex64::new(arg(0).re.atan2(arg(1).re), 0.0),
            Builtin::Sinh => arg(0).sinh(),
            Builtin::Cosh => arg(0).cosh(),
            Builtin::Tanh => arg(0).tanh(),
            Builtin::Asinh => arg(0).asinh(),
            Builtin::Acosh => arg(0).acosh(),
            Builtin::Atanh => arg(0).atanh(),
            Builtin::Min => Self::select_by_real(args, false),
            Builtin::Max => Self::select_by_real(args, true),
            Builtin::If => {
                if Self::truthy(arg(0)) {
                    arg(1)
                } else {
                    arg(2)
                }
            }
            Builtin::Limit => {
                let (x, a, b) = (arg(0), arg(1), arg(2));
                let (lo, hi) = if a.re <= b.re { (a, b) } else { (b, a) };
                if x.re < lo.re {
                    lo
                } else if x.re > hi.re {
                    hi
                } else {
                    x
                }
            }
            Builtin::Round => Self::real_fn(arg(0), f64::round),
            Builtin::Ceil => Self::real_fn(arg(0), f64::ceil),
            Builtin::Floor => Self::real_fn(arg(0), f64::floor),
            Builtin::Nint => Self::real_fn(arg(0), functions::nint),
            Builtin::Step => Self::real_fn(arg(0), functions::step),
            Builtin::Step2 => Self::real_fn(arg(0), functions::step2),
            Builtin::Ramp => Self::real_fn(arg(0), functions::ramp),
            Builtin::Hypot => (arg(0) * arg(0) + arg(1) * arg(1)).sqrt(),
            Builtin::Db => Complex64::new(functions::db(arg(0).norm()), 0.0),
            Builtin::Random => Complex64::new(functions::random(), 0.0),
            Builtin::Pwl | Builtin::PwlDerivative => {
                let real: Vec<f64> = args.iter().map(|v| v.re).collect();
                Complex64::new(functions::apply_real(builtin, &real), 0.0)
            }
        }
    }
}
