//! Function and variable resolution.
//!
//! Neither backend knows what a name means. Whenever the interpreter or the compiler meets a
//! function call, a variable or a property, it asks the ordered resolver lists of a
//! [`Resolution`], and the first resolver that claims the request wins. The default layer
//! ([`Resolution::standard`]) registers the built-in math functions and the physical constants;
//! the circuit layer appends resolvers mapping voltages, currents, time and temperature onto
//! live state.
//!
//! Resolvers are written once for the real domain and reused for AC analysis through [`Lift`],
//! which re-wraps every real value with a zero imaginary part.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use num_complex::Complex64;
use tracing::trace;

use crate::compiler::Emitter;
use crate::domain::{ComplexDomain, NumericDomain, RealDomain};
use crate::errors::{ExpressionError, Result};
use crate::expr::{FunctionNode, PropertyNode, Quantity, VariableNode};
use crate::functions::Builtin;
use crate::names::{NameComparison, VariableComparer, VariableKey};
use crate::types::{ExternalFunction, VariableSource};

/// What a function call is bound to.
#[derive(Clone)]
pub enum Binding<V> {
    /// A primitive of the numeric domain
    Builtin(Builtin),
    /// An external function applied to the evaluated arguments
    External(ExternalFunction<V>),
}

impl<V> fmt::Debug for Binding<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Builtin(builtin) => write!(f, "Builtin({builtin})"),
            Binding::External(function) => {
                write!(f, "External({:p})", Rc::as_ptr(function) as *const ())
            }
        }
    }
}

/// Resolves function calls for one numeric domain.
pub trait FunctionResolver<D: NumericDomain> {
    /// Binds `call` to an implementation, or declines with `Ok(None)`.
    ///
    /// Errors (typically an argument count mismatch) abort the whole evaluation or compilation.
    fn resolve(&self, call: &FunctionNode) -> Result<Option<Binding<D::Value>>>;

    /// Emits code for `call`, returning false to decline.
    ///
    /// The default emits the arguments followed by the binding from [`resolve`](Self::resolve).
    /// Resolvers that generate their own instruction sequences override this; anything
    /// emitted before declining is discarded.
    fn emit(&self, call: &FunctionNode, emitter: &mut Emitter<'_, D>) -> Result<bool> {
        match self.resolve(call)? {
            Some(binding) => {
                emitter.emit_call(call, binding)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Resolves variables and property requests for one numeric domain.
pub trait VariableResolver<D: NumericDomain> {
    fn resolve(&self, variable: &VariableNode) -> Option<VariableSource<D::Value>>;

    fn resolve_property(&self, property: &PropertyNode) -> Option<VariableSource<D::Value>> {
        let _ = property;
        None
    }
}

/// Closures mapping a call to an external implementation act as function resolvers.
impl<D, F> FunctionResolver<D> for F
where
    D: NumericDomain,
    F: Fn(&FunctionNode) -> Option<ExternalFunction<D::Value>>,
{
    fn resolve(&self, call: &FunctionNode) -> Result<Option<Binding<D::Value>>> {
        Ok(self(call).map(Binding::External))
    }
}

/// Closures mapping a variable to a source act as variable resolvers.
impl<D, F> VariableResolver<D> for F
where
    D: NumericDomain,
    F: Fn(&VariableNode) -> Option<VariableSource<D::Value>>,
{
    fn resolve(&self, variable: &VariableNode) -> Option<VariableSource<D::Value>> {
        self(variable)
    }
}

/// The built-in function set.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinFunctions {
    comparison: NameComparison,
}

impl BuiltinFunctions {
    pub fn new(comparison: NameComparison) -> Self {
        Self { comparison }
    }

    pub fn with_name_comparison(&self, comparison: NameComparison) -> Self {
        Self::new(comparison)
    }
}

impl<D: NumericDomain> FunctionResolver<D> for BuiltinFunctions {
    fn resolve(&self, call: &FunctionNode) -> Result<Option<Binding<D::Value>>> {
        match Builtin::lookup(call.name(), self.comparison) {
            Some(builtin) => {
                builtin.check_arity(call.args().len())?;
                Ok(Some(Binding::Builtin(builtin)))
            }
            None => Ok(None),
        }
    }
}

struct TableEntry<V> {
    name: String,
    arity: Option<usize>,
    function: ExternalFunction<V>,
}

impl<V> Clone for TableEntry<V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            arity: self.arity,
            function: self.function.clone(),
        }
    }
}

/// External functions by name.
pub struct FunctionTable<V> {
    comparison: NameComparison,
    entries: HashMap<String, TableEntry<V>>,
}

impl<V: Copy + 'static> Default for FunctionTable<V> {
    fn default() -> Self {
        Self::new(NameComparison::default())
    }
}

impl<V> Clone for FunctionTable<V> {
    fn clone(&self) -> Self {
        Self {
            comparison: self.comparison,
            entries: self.entries.clone(),
        }
    }
}

impl<V> fmt::Debug for FunctionTable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.entries.values().map(|e| e.name.as_str()).collect();
        names.sort_unstable();
        f.debug_struct("FunctionTable")
            .field("comparison", &self.comparison)
            .field("functions", &names)
            .finish()
    }
}

impl<V: Copy + 'static> FunctionTable<V> {
    pub fn new(comparison: NameComparison) -> Self {
        Self {
            comparison,
            entries: HashMap::new(),
        }
    }

    /// Registers a function accepting any number of arguments.
    pub fn define(&mut self, name: &str, function: impl Fn(&[V]) -> V + 'static) -> &mut Self {
        self.insert(name, None, Rc::new(function))
    }

    /// Registers a function with a fixed argument count, checked when calls are resolved.
    pub fn define_fixed(
        &mut self,
        name: &str,
        arity: usize,
        function: impl Fn(&[V]) -> V + 'static,
    ) -> &mut Self {
        self.insert(name, Some(arity), Rc::new(function))
    }

    pub fn insert(
        &mut self,
        name: &str,
        arity: Option<usize>,
        function: ExternalFunction<V>,
    ) -> &mut Self {
        let key = self.comparison.normalize(name).into_owned();
        self.entries.insert(
            key,
            TableEntry {
                name: name.to_string(),
                arity,
                function,
            },
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<&ExternalFunction<V>> {
        self.entries
            .get(self.comparison.normalize(name).as_ref())
            .map(|entry| &entry.function)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copies this table under a different name comparison.
    pub fn with_name_comparison(&self, comparison: NameComparison) -> Self {
        let mut table = Self::new(comparison);
        for entry in self.entries.values() {
            table.insert(&entry.name, entry.arity, entry.function.clone());
        }
        table
    }

    fn lookup(&self, call: &FunctionNode) -> Result<Option<ExternalFunction<V>>> {
        let Some(entry) = self.entries.get(self.comparison.normalize(call.name()).as_ref()) else {
            return Ok(None);
        };
        if let Some(expected) = entry.arity {
            if expected != call.args().len() {
                return Err(ExpressionError::ArgumentCountMismatch {
                    name: call.name().to_string(),
                    expected,
                    actual: call.args().len(),
                });
            }
        }
        Ok(Some(entry.function.clone()))
    }
}

impl FunctionTable<f64> {
    /// Lifts every function into the complex domain, operating on real parts.
    pub fn lift(&self) -> FunctionTable<Complex64> {
        let mut table = FunctionTable::new(self.comparison);
        for entry in self.entries.values() {
            table.insert(&entry.name, entry.arity, lift_function(&entry.function));
        }
        table
    }
}

impl<D: NumericDomain> FunctionResolver<D> for FunctionTable<D::Value> {
    fn resolve(&self, call: &FunctionNode) -> Result<Option<Binding<D::Value>>> {
        Ok(self.lookup(call)?.map(Binding::External))
    }
}

fn lift_function(function: &ExternalFunction<f64>) -> ExternalFunction<Complex64> {
    let function = function.clone();
    Rc::new(move |args: &[Complex64]| {
        let real: Vec<f64> = args.iter().map(|arg| arg.re).collect();
        Complex64::new(function(&real), 0.0)
    })
}

/// Live variable sources by name.
pub struct VariableTable<V> {
    comparer: VariableComparer,
    variables: HashMap<VariableKey, (VariableNode, VariableSource<V>)>,
    properties: HashMap<PropertyKey, (PropertyNode, VariableSource<V>)>,
}

type PropertyKey = (String, String, Quantity);

impl<V: Copy + 'static> Default for VariableTable<V> {
    fn default() -> Self {
        Self::new(VariableComparer::default())
    }
}

impl<V: Clone> Clone for VariableTable<V> {
    fn clone(&self) -> Self {
        Self {
            comparer: self.comparer,
            variables: self.variables.clone(),
            properties: self.properties.clone(),
        }
    }
}

impl<V: Copy + fmt::Debug + 'static> fmt::Debug for VariableTable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.variables
                    .values()
                    .map(|(variable, source)| (variable.to_string(), source)),
            )
            .finish()
    }
}

impl<V: Copy + 'static> VariableTable<V> {
    pub fn new(comparer: VariableComparer) -> Self {
        Self {
            comparer,
            variables: HashMap::new(),
            properties: HashMap::new(),
        }
    }

    /// Binds `variable` to an existing source, returning the previous binding.
    pub fn insert(
        &mut self,
        variable: &VariableNode,
        source: VariableSource<V>,
    ) -> Option<VariableSource<V>> {
        self.variables
            .insert(self.comparer.key(variable), (variable.clone(), source))
            .map(|(_, previous)| previous)
    }

    /// Binds `variable` to a fresh cell holding `value` and returns the cell.
    pub fn define(&mut self, variable: &VariableNode, value: V) -> VariableSource<V> {
        let source = VariableSource::new(value);
        self.insert(variable, source.clone());
        source
    }

    pub fn get(&self, variable: &VariableNode) -> Option<&VariableSource<V>> {
        self.variables
            .get(&self.comparer.key(variable))
            .map(|(_, source)| source)
    }

    /// Writes a cell-backed variable. Returns false for unknown or getter-backed variables.
    pub fn set(&self, variable: &VariableNode, value: V) -> bool {
        self.get(variable).is_some_and(|source| source.set(value))
    }

    fn property_key(&self, entity: &str, property: &str, quantity: Quantity) -> PropertyKey {
        let comparison = self.comparer.named;
        (
            comparison.normalize(entity).into_owned(),
            comparison.normalize(property).into_owned(),
            quantity,
        )
    }

    pub fn insert_property(
        &mut self,
        property: &PropertyNode,
        source: VariableSource<V>,
    ) -> Option<VariableSource<V>> {
        let key = self.property_key(property.entity(), property.property(), property.quantity());
        self.properties
            .insert(key, (property.clone(), source))
            .map(|(_, previous)| previous)
    }

    pub fn get_property(&self, property: &PropertyNode) -> Option<&VariableSource<V>> {
        let key = self.property_key(property.entity(), property.property(), property.quantity());
        self.properties.get(&key).map(|(_, source)| source)
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn comparer(&self) -> VariableComparer {
        self.comparer
    }

    /// Copies this table under a different comparer.
    pub fn with_comparer(&self, comparer: VariableComparer) -> Self {
        let mut table = Self::new(comparer);
        for (variable, source) in self.variables.values() {
            table.insert(variable, source.clone());
        }
        for (property, source) in self.properties.values() {
            table.insert_property(property, source.clone());
        }
        table
    }
}

impl VariableTable<f64> {
    /// Lifts every source into the complex domain. The lifted sources follow the originals.
    pub fn lift(&self) -> VariableTable<Complex64> {
        let sources = LiftedSources::default();
        VariableTable {
            comparer: self.comparer,
            variables: self
                .variables
                .iter()
                .map(|(key, (variable, source))| {
                    (key.clone(), (variable.clone(), sources.lift(source)))
                })
                .collect(),
            properties: self
                .properties
                .iter()
                .map(|(key, (property, source))| {
                    (key.clone(), (property.clone(), sources.lift(source)))
                })
                .collect(),
        }
    }
}

impl<D: NumericDomain> VariableResolver<D> for VariableTable<D::Value> {
    fn resolve(&self, variable: &VariableNode) -> Option<VariableSource<D::Value>> {
        self.get(variable).cloned()
    }

    fn resolve_property(&self, property: &PropertyNode) -> Option<VariableSource<D::Value>> {
        self.get_property(property).cloned()
    }
}

/// Boltzmann constant in J/K.
pub const BOLTZMANN: f64 = 1.380649e-23;
/// Planck constant in J*s.
pub const PLANCK: f64 = 6.62607015e-34;
/// Elementary charge in C.
pub const ELEMENTARY_CHARGE: f64 = 1.602176634e-19;
/// 0 degrees Celsius expressed in Kelvin, negated.
pub const KELVIN: f64 = -273.15;

/// Named physical constants available to every expression.
pub fn physical_constants<D: NumericDomain>() -> VariableTable<D::Value> {
    let mut table = VariableTable::default();
    for (name, value) in [
        ("pi", std::f64::consts::PI),
        ("e", std::f64::consts::E),
        ("boltz", BOLTZMANN),
        ("planck", PLANCK),
        ("echarge", ELEMENTARY_CHARGE),
        ("kelvin", KELVIN),
    ] {
        table.define(&VariableNode::named(name), D::from_real(value));
    }
    table
}

/// Adapter running a real-domain resolver in the complex domain.
///
/// Arguments are reduced to their real parts and results come back with a zero imaginary
/// part. Built-in bindings are kept as they are and use the complex primitives. Only
/// [`FunctionResolver::resolve`] of the wrapped resolver is consulted, so custom emission is
/// not carried over.
///
/// A real source is lifted once: resolving it again, under any name, returns the same complex
/// source, so compiled code captures it once.
pub struct Lift<T: ?Sized> {
    resolver: Rc<T>,
    sources: LiftedSources,
}

impl<T> Lift<T> {
    pub fn new(resolver: T) -> Self {
        Self::from_rc(Rc::new(resolver))
    }
}

impl<T: ?Sized> Lift<T> {
    pub fn from_rc(resolver: Rc<T>) -> Self {
        Self::sharing(resolver, LiftedSources::default())
    }

    fn sharing(resolver: Rc<T>, sources: LiftedSources) -> Self {
        Lift { resolver, sources }
    }
}

/// Complex views of real sources, keyed by the identity of the real source.
#[derive(Clone, Default)]
struct LiftedSources(Rc<RefCell<HashMap<*const (), VariableSource<Complex64>>>>);

impl LiftedSources {
    fn lift(&self, source: &VariableSource<f64>) -> VariableSource<Complex64> {
        self.0
            .borrow_mut()
            .entry(source.identity())
            .or_insert_with(|| source.map(|x| Complex64::new(x, 0.0)))
            .clone()
    }
}

impl<T: FunctionResolver<RealDomain> + ?Sized> FunctionResolver<ComplexDomain> for Lift<T> {
    fn resolve(&self, call: &FunctionNode) -> Result<Option<Binding<Complex64>>> {
        Ok(self.resolver.resolve(call)?.map(|binding| match binding {
            Binding::Builtin(builtin) => Binding::Builtin(builtin),
            Binding::External(function) => Binding::External(lift_function(&function)),
        }))
    }
}

impl<T: VariableResolver<RealDomain> + ?Sized> VariableResolver<ComplexDomain> for Lift<T> {
    fn resolve(&self, variable: &VariableNode) -> Option<VariableSource<Complex64>> {
        self.resolver
            .resolve(variable)
            .map(|source| self.sources.lift(&source))
    }

    fn resolve_property(&self, property: &PropertyNode) -> Option<VariableSource<Complex64>> {
        self.resolver
            .resolve_property(property)
            .map(|source| self.sources.lift(&source))
    }
}

/// Ordered resolver lists consulted by the interpreter and the compiler.
pub struct Resolution<D: NumericDomain> {
    functions: Vec<Rc<dyn FunctionResolver<D>>>,
    variables: Vec<Rc<dyn VariableResolver<D>>>,
}

impl<D: NumericDomain> Clone for Resolution<D> {
    fn clone(&self) -> Self {
        Self {
            functions: self.functions.clone(),
            variables: self.variables.clone(),
        }
    }
}

impl<D: NumericDomain> Default for Resolution<D> {
    fn default() -> Self {
        Self::standard()
    }
}

impl<D: NumericDomain> fmt::Debug for Resolution<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolution")
            .field("domain", &D::NAME)
            .field("functions", &self.functions.len())
            .field("variables", &self.variables.len())
            .finish()
    }
}

impl<D: NumericDomain> Resolution<D> {
    /// No resolvers at all.
    pub fn empty() -> Self {
        Self {
            functions: Vec::new(),
            variables: Vec::new(),
        }
    }

    /// Built-in functions and physical constants, with case-insensitive names.
    pub fn standard() -> Self {
        Self::standard_with(NameComparison::IgnoreCase)
    }

    /// Built-in functions and physical constants under the given name comparison.
    pub fn standard_with(comparison: NameComparison) -> Self {
        let mut resolution = Self::empty();
        resolution.push_function(BuiltinFunctions::new(comparison));
        resolution.push_variable(
            physical_constants::<D>().with_comparer(VariableComparer::uniform(comparison)),
        );
        resolution
    }

    /// Appends a function resolver. Earlier resolvers take precedence.
    pub fn push_function(&mut self, resolver: impl FunctionResolver<D> + 'static) -> &mut Self {
        self.functions.push(Rc::new(resolver));
        self
    }

    /// Inserts a function resolver ahead of all others, shadowing them.
    pub fn prepend_function(&mut self, resolver: impl FunctionResolver<D> + 'static) -> &mut Self {
        self.functions.insert(0, Rc::new(resolver));
        self
    }

    /// Appends a variable resolver. Earlier resolvers take precedence.
    pub fn push_variable(&mut self, resolver: impl VariableResolver<D> + 'static) -> &mut Self {
        self.variables.push(Rc::new(resolver));
        self
    }

    pub fn prepend_variable(&mut self, resolver: impl VariableResolver<D> + 'static) -> &mut Self {
        self.variables.insert(0, Rc::new(resolver));
        self
    }

    pub fn with_function(mut self, resolver: impl FunctionResolver<D> + 'static) -> Self {
        self.push_function(resolver);
        self
    }

    pub fn with_variable(mut self, resolver: impl VariableResolver<D> + 'static) -> Self {
        self.push_variable(resolver);
        self
    }

    pub fn function_resolvers(&self) -> &[Rc<dyn FunctionResolver<D>>] {
        &self.functions
    }

    pub fn variable_resolvers(&self) -> &[Rc<dyn VariableResolver<D>>] {
        &self.variables
    }

    /// Binds a call using the first resolver that claims it.
    pub fn resolve_function(&self, call: &FunctionNode) -> Result<Binding<D::Value>> {
        for (index, resolver) in self.functions.iter().enumerate() {
            if let Some(binding) = resolver.resolve(call)? {
                trace!(function = call.name(), resolver = index, "function resolved");
                return Ok(binding);
            }
        }
        Err(ExpressionError::UnrecognizedFunction(call.name().to_string()))
    }

    /// Finds the source of a variable using the first resolver that claims it.
    pub fn resolve_variable(&self, variable: &VariableNode) -> Result<VariableSource<D::Value>> {
        for (index, resolver) in self.variables.iter().enumerate() {
            if let Some(source) = resolver.resolve(variable) {
                trace!(%variable, resolver = index, "variable resolved");
                return Ok(source);
            }
        }
        Err(ExpressionError::UnrecognizedVariable {
            kind: variable.kind(),
            name: variable.name().to_string(),
        })
    }

    pub fn resolve_property(&self, property: &PropertyNode) -> Result<VariableSource<D::Value>> {
        self.variables
            .iter()
            .find_map(|resolver| resolver.resolve_property(property))
            .ok_or_else(|| ExpressionError::UnrecognizedProperty {
                entity: property.entity().to_string(),
                property: property.property().to_string(),
            })
    }
}

impl Resolution<RealDomain> {
    /// The same resolvers, lifted into the complex domain.
    pub fn lift(&self) -> Resolution<ComplexDomain> {
        let mut lifted = Resolution::empty();
        for resolver in &self.functions {
            lifted.push_function(Lift::from_rc(resolver.clone()));
        }
        let sources = LiftedSources::default();
        for resolver in &self.variables {
            lifted.push_variable(Lift::sharing(resolver.clone(), sources.clone()));
        }
        lifted
    }
}
