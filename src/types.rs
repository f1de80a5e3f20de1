use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

/// Type alias for an externally supplied function.
///
/// This represents a function that:
/// - Takes the already evaluated arguments of a call, in order
/// - Returns a single value of the numeric domain it was registered for
///
/// Compiled code captures the `Rc` itself, so two calls to the same registered function share
/// one entry in the reference table.
pub type ExternalFunction<V> = Rc<dyn Fn(&[V]) -> V>;

/// Type alias for a getter producing the current value of a variable.
pub type Getter<V> = Rc<dyn Fn() -> V>;

/// Numeric tolerances shared by node equality, the `==`/`!=` operators and safe division.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    /// Relative tolerance for approximate equality
    pub relative: f64,
    /// Absolute tolerance for approximate equality
    pub absolute: f64,
    /// Denominators with a smaller magnitude are replaced by this value (keeping their sign)
    pub fudge: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            relative: 1e-9,
            absolute: 1e-12,
            fudge: 1e-20,
        }
    }
}

impl Tolerance {
    /// Returns true if `a` and `b` are equal within the relative/absolute pair.
    pub fn approx_eq(&self, a: f64, b: f64) -> bool {
        if a == b {
            return true;
        }
        let scale = a.abs().max(b.abs());
        (a - b).abs() <= (scale * self.relative).max(self.absolute)
    }
}

/// A live numeric source captured by resolved variables.
///
/// The circuit layer owns the value and updates it between solver iterations; compiled
/// functions read it on every invocation.
pub enum VariableSource<V> {
    /// A shared cell written by the owner
    Cell(Rc<Cell<V>>),
    /// A getter computing the value on demand
    Getter(Getter<V>),
}

// Cloning shares the allocation, so it must not require `V: Clone`.
impl<V> Clone for VariableSource<V> {
    fn clone(&self) -> Self {
        match self {
            VariableSource::Cell(cell) => VariableSource::Cell(Rc::clone(cell)),
            VariableSource::Getter(getter) => VariableSource::Getter(Rc::clone(getter)),
        }
    }
}

impl<V: Copy + 'static> VariableSource<V> {
    /// Creates a new cell-backed source holding `value`.
    pub fn new(value: V) -> Self {
        VariableSource::Cell(Rc::new(Cell::new(value)))
    }

    /// Wraps a getter.
    pub fn from_fn(f: impl Fn() -> V + 'static) -> Self {
        VariableSource::Getter(Rc::new(f))
    }

    /// Reads the current value.
    pub fn value(&self) -> V {
        match self {
            VariableSource::Cell(cell) => cell.get(),
            VariableSource::Getter(getter) => getter(),
        }
    }

    /// Writes a new value. Getter-backed sources ignore writes and return false.
    pub fn set(&self, value: V) -> bool {
        match self {
            VariableSource::Cell(cell) => {
                cell.set(value);
                true
            }
            VariableSource::Getter(_) => false,
        }
    }

    /// Address identifying the shared allocation behind this source.
    pub fn identity(&self) -> *const () {
        match self {
            VariableSource::Cell(cell) => Rc::as_ptr(cell) as *const (),
            VariableSource::Getter(getter) => Rc::as_ptr(getter) as *const (),
        }
    }

    /// Maps this source into another numeric domain.
    pub fn map<W: Copy + 'static>(&self, f: impl Fn(V) -> W + 'static) -> VariableSource<W> {
        let source = self.clone();
        VariableSource::Getter(Rc::new(move || f(source.value())))
    }
}

impl<V: Copy + fmt::Debug + 'static> fmt::Debug for VariableSource<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableSource::Cell(cell) => write!(f, "Cell({:?})", cell.get()),
            VariableSource::Getter(_) => write!(f, "Getter({:p})", self.identity()),
        }
    }
}
