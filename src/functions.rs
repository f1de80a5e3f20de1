//! Built-in function table and real-valued numeric primitives.
//!
//! The same primitives back the interpreter, the stack executor and the runtime helpers
//! linked into native code, so every backend computes identical values.

use std::fmt;

use crate::errors::{ExpressionError, Result};
use crate::names::NameComparison;

/// Number of arguments a built-in accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
    /// `x` followed by at least one `(x, y)` point pair
    Table,
}

macro_rules! builtins {
    ($($variant:ident => { names: [$($name:literal),+], arity: $arity:expr }),* $(,)?) => {
        /// Functions provided by the default registration layer.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Builtin {
            $($variant),*
        }

        impl Builtin {
            /// Every built-in, in declaration order.
            pub const ALL: &'static [Builtin] = &[$(Builtin::$variant),*];

            /// Names the built-in answers to; the first one is canonical.
            pub fn names(&self) -> &'static [&'static str] {
                match self {
                    $(Builtin::$variant => &[$($name),+],)*
                }
            }

            pub fn arity(&self) -> Arity {
                match self {
                    $(Builtin::$variant => $arity,)*
                }
            }
        }
    };
}

builtins! {
    Abs => { names: ["abs"], arity: Arity::Exact(1) },
    Sgn => { names: ["sgn", "sign"], arity: Arity::Exact(1) },
    Sqrt => { names: ["sqrt"], arity: Arity::Exact(1) },
    Exp => { names: ["exp"], arity: Arity::Exact(1) },
    Log => { names: ["log", "ln"], arity: Arity::Exact(1) },
    Log10 => { names: ["log10"], arity: Arity::Exact(1) },
    Pow => { names: ["pow"], arity: Arity::Exact(2) },
    Pwr => { names: ["pwr", "pwrs"], arity: Arity::Exact(2) },
    Square => { names: ["square", "sqr"], arity: Arity::Exact(1) },
    Sin => { names: ["sin"], arity: Arity::Exact(1) },
    Cos => { names: ["cos"], arity: Arity::Exact(1) },
    Tan => { names: ["tan"], arity: Arity::Exact(1) },
    Asin => { names: ["asin", "arcsin"], arity: Arity::Exact(1) },
    Acos => { names: ["acos", "arccos"], arity: Arity::Exact(1) },
    Atan => { names: ["atan", "arctan"], arity: Arity::Exact(1) },
    Atan2 => { names: ["atan2"], arity: Arity::Exact(2) },
    Sinh => { names: ["sinh"], arity: Arity::Exact(1) },
    Cosh => { names: ["cosh"], arity: Arity::Exact(1) },
    Tanh => { names: ["tanh"], arity: Arity::Exact(1) },
    Asinh => { names: ["asinh", "arcsinh"], arity: Arity::Exact(1) },
    Acosh => { names: ["acosh", "arccosh"], arity: Arity::Exact(1) },
    Atanh => { names: ["atanh", "arctanh"], arity: Arity::Exact(1) },
    Min => { names: ["min"], arity: Arity::AtLeast(1) },
    Max => { names: ["max"], arity: Arity::AtLeast(1) },
    If => { names: ["if"], arity: Arity::Exact(3) },
    Limit => { names: ["limit"], arity: Arity::Exact(3) },
    Round => { names: ["round"], arity: Arity::Exact(1) },
    Ceil => { names: ["ceil"], arity: Arity::Exact(1) },
    Floor => { names: ["floor"], arity: Arity::Exact(1) },
    Nint => { names: ["nint"], arity: Arity::Exact(1) },
    Step => { names: ["u", "step"], arity: Arity::Exact(1) },
    Step2 => { names: ["u2"], arity: Arity::Exact(1) },
    Ramp => { names: ["uramp", "ramp"], arity: Arity::Exact(1) },
    Hypot => { names: ["hypot"], arity: Arity::Exact(2) },
    Db => { names: ["db"], arity: Arity::Exact(1) },
    Random => { names: ["random", "rnd"], arity: Arity::Exact(0) },
    Pwl => { names: ["pwl", "table", "tbl"], arity: Arity::Table },
    PwlDerivative => { names: ["dpwl", "dtable", "dtbl"], arity: Arity::Table },
}

impl Builtin {
    /// Looks a built-in up by name.
    pub fn lookup(name: &str, comparison: NameComparison) -> Option<Builtin> {
        let name = comparison.normalize(name);
        Builtin::ALL
            .iter()
            .copied()
            .find(|builtin| builtin.names().iter().any(|n| *n == name.as_ref()))
    }

    pub fn name(&self) -> &'static str {
        self.names()[0]
    }

    /// Checks an argument count against the arity of this built-in.
    pub fn check_arity(&self, actual: usize) -> Result<()> {
        let expected = match self.arity() {
            Arity::Exact(n) if actual != n => n,
            Arity::AtLeast(n) if actual < n => n,
            Arity::Table if actual < 3 => 3,
            Arity::Table if actual % 2 == 0 => actual + 1,
            _ => return Ok(()),
        };
        Err(ExpressionError::ArgumentCountMismatch {
            name: self.name().to_string(),
            expected,
            actual,
        })
    }

    /// Stable numeric code used to dispatch from native code.
    pub fn code(&self) -> u32 {
        Builtin::ALL
            .iter()
            .position(|b| b == self)
            .unwrap_or_default() as u32
    }

    pub fn from_code(code: u32) -> Option<Builtin> {
        Builtin::ALL.get(code as usize).copied()
    }
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Divides, replacing denominators smaller than `fudge` in magnitude by `±fudge`.
pub fn safe_divide(left: f64, right: f64, fudge: f64) -> f64 {
    if right.abs() < fudge {
        left / fudge.copysign(right)
    } else {
        left / right
    }
}

/// Truncated remainder that yields zero for a vanishing divisor.
pub fn safe_modulo(left: f64, right: f64, fudge: f64) -> f64 {
    if right.abs() < fudge {
        0.0
    } else {
        left % right
    }
}

/// SPICE sign function: -1, 0 or 1.
pub fn sgn(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else if x < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Sign-preserving power: `sgn(x) * |x|^y`.
pub fn pwr(x: f64, y: f64) -> f64 {
    sgn(x) * x.abs().powf(y)
}

/// Unit step, 1 for positive arguments.
pub fn step(x: f64) -> f64 {
    if x > 0.0 {
        1.0
    } else {
        0.0
    }
}

/// Saturating ramp between 0 and 1.
pub fn step2(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

/// Ramp: `x` for positive arguments, else 0.
pub fn ramp(x: f64) -> f64 {
    if x > 0.0 {
        x
    } else {
        0.0
    }
}

/// Round half away from zero to the nearest integer.
pub fn nint(x: f64) -> f64 {
    x.round()
}

/// Decibels of a magnitude.
pub fn db(x: f64) -> f64 {
    20.0 * x.abs().log10()
}

/// Clamps `x` between two bounds given in either order.
pub fn limit(x: f64, a: f64, b: f64) -> f64 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    if x < lo {
        lo
    } else if x > hi {
        hi
    } else {
        x
    }
}

/// Uniform random number in `[0, 1)`.
pub fn random() -> f64 {
    rand::random::<f64>()
}

/// Piecewise-linear interpolation through `points = [x0, y0, x1, y1, ...]`.
///
/// The abscissae must be increasing. Outside the table the first/last value is held.
/// With `derivative` set, returns the slope of the active segment instead (zero outside).
pub fn pwl(x: f64, points: &[f64], derivative: bool) -> f64 {
    let n = points.len() / 2;
    if n == 0 {
        return 0.0;
    }
    let px = |i: usize| points[2 * i];
    let py = |i: usize| points[2 * i + 1];
    if x <= px(0) {
        return if derivative { 0.0 } else { py(0) };
    }
    if x >= px(n - 1) {
        return if derivative { 0.0 } else { py(n - 1) };
    }

    // First index whose abscissa is >= x; the active segment ends there.
    let (mut lo, mut hi) = (0, n - 1);
    while hi - lo > 1 {
        let mid = (lo + hi) / 2;
        if px(mid) < x {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let (x0, y0, x1, y1) = (px(lo), py(lo), px(hi), py(hi));
    let slope = if x1 == x0 { 0.0 } else { (y1 - y0) / (x1 - x0) };
    if derivative {
        slope
    } else {
        y0 + slope * (x - x0)
    }
}

/// Applies a real built-in to evaluated arguments.
///
/// Argument counts must already have been checked.
pub fn apply_real(builtin: Builtin, args: &[f64]) -> f64 {
    let arg = |i: usize| args.get(i).copied().unwrap_or_default();
    match builtin {
        Builtin::Abs => arg(0).abs(),
        Builtin::Sgn => sgn(arg(0)),
        Builtin::Sqrt => arg(0).sqrt(),
        Builtin::Exp => arg(0).exp(),
        Builtin::Log => arg(0).ln(),
        Builtin::Log10 => arg(0).log10(),
        Builtin::Pow => arg(0).powf(arg(1)),
        Builtin::Pwr => pwr(arg(0), arg(1)),
        Builtin::Square => arg(0) * arg(0),
        Builtin::Sin => arg(0).sin(),
        Builtin::Cos => arg(0).cos(),
        Builtin::Tan => arg(0).tan(),
        Builtin::Asin => arg(0).asin(),
        Builtin::Acos => arg(0).acos(),
        Builtin::Atan => arg(0).atan(),
        Builtin::Atan2 => arg(0).atan2(arg(1)),
        Builtin::Sinh => arg(0).sinh(),
        Builtin::Cosh => arg(0).cosh(),
        Builtin::Tanh => arg(0).tanh(),
        Builtin::Asinh => arg(0).asinh(),
        Builtin::Acosh => arg(0).acosh(),
        Builtin::Atanh => arg(0).atanh(),
        Builtin::Min => args.iter().copied().fold(f64::INFINITY, f64::min),
        Builtin::Max => args.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Builtin::If => {
            if arg(0) > 0.5 {
                arg(1)
            } else {
                arg(2)
            }
        }
        Builtin::Limit => limit(arg(0), arg(1), arg(2)),
        Builtin::Round => arg(0).round(),
        Builtin::Ceil => arg(0).ceil(),
        Builtin::Floor => arg(0).floor(),
        Builtin::Nint => nint(arg(0)),
        Builtin::Step => step(arg(0)),
        Builtin::Step2 => step2(arg(0)),
        Builtin::Ramp => ramp(arg(0)),
        Builtin::Hypot => arg(0).hypot(arg(1)),
        Builtin::Db => db(arg(0)),
        Builtin::Random => random(),
        Builtin::Pwl => pwl(arg(0), args.get(1..).unwrap_or_default(), false),
        Builtin::PwlDerivative => pwl(arg(0), args.get(1..).unwrap_or_default(), true),
    }
}
