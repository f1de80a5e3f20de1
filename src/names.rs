//! Name-equality policies.
//!
//! SPICE netlists are usually case-insensitive, but the circuit layer may compare entity
//! names and node names differently. Everything that matches names (variable identity during
//! differentiation, function lookup, variable tables) goes through a [`NameComparison`], so the
//! policy can be swapped without touching the engines.

use std::borrow::Cow;
use std::fmt;

use crate::expr::{VariableKind, VariableNode};

/// How two names are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NameComparison {
    /// Byte-for-byte equality
    Ordinal,
    /// Unicode case-insensitive equality
    #[default]
    IgnoreCase,
}

impl NameComparison {
    /// Returns the canonical form of `name` under this policy.
    pub fn normalize<'a>(&self, name: &'a str) -> Cow<'a, str> {
        match self {
            NameComparison::Ordinal => Cow::Borrowed(name),
            NameComparison::IgnoreCase => {
                if name.chars().any(char::is_uppercase) {
                    Cow::Owned(name.to_lowercase())
                } else {
                    Cow::Borrowed(name)
                }
            }
        }
    }

    pub fn equals(&self, a: &str, b: &str) -> bool {
        match self {
            NameComparison::Ordinal => a == b,
            NameComparison::IgnoreCase => a.to_lowercase() == b.to_lowercase(),
        }
    }
}

/// Per-kind name comparison for variables.
///
/// Node names (voltages) and entity names (branch currents) may follow different rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VariableComparer {
    pub voltage: NameComparison,
    pub current: NameComparison,
    pub named: NameComparison,
}

impl VariableComparer {
    /// Uses the same comparison for every variable kind.
    pub fn uniform(comparison: NameComparison) -> Self {
        Self {
            voltage: comparison,
            current: comparison,
            named: comparison,
        }
    }

    pub fn for_kind(&self, kind: VariableKind) -> NameComparison {
        match kind {
            VariableKind::Voltage => self.voltage,
            VariableKind::Current => self.current,
            VariableKind::Named => self.named,
        }
    }

    /// Builds the normalized identity of a variable.
    pub fn key(&self, variable: &VariableNode) -> VariableKey {
        VariableKey::new(variable.kind(), variable.name(), self.for_kind(variable.kind()))
    }
}

/// Identity of a variable: its kind and its name normalized under a [`NameComparison`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableKey {
    kind: VariableKind,
    name: String,
}

impl VariableKey {
    pub fn new(kind: VariableKind, name: &str, comparison: NameComparison) -> Self {
        Self {
            kind,
            name: comparison.normalize(name).into_owned(),
        }
    }

    pub fn kind(&self) -> VariableKind {
        self.kind
    }

    /// The normalized name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for VariableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            VariableKind::Voltage => write!(f, "V({})", self.name),
            VariableKind::Current => write!(f, "I({})", self.name),
            VariableKind::Named => write!(f, "{}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(NameComparison::IgnoreCase.normalize("OUT"), "out");
        assert_eq!(NameComparison::Ordinal.normalize("OUT"), "OUT");
        assert!(matches!(
            NameComparison::IgnoreCase.normalize("out"),
            Cow::Borrowed(_)
        ));
    }

    #[test]
    fn test_keys_follow_kind_policy() {
        let comparer = VariableComparer {
            voltage: NameComparison::IgnoreCase,
            current: NameComparison::Ordinal,
            named: NameComparison::IgnoreCase,
        };
        assert_eq!(
            comparer.key(&VariableNode::voltage("OUT")),
            comparer.key(&VariableNode::voltage("out"))
        );
        assert_ne!(
            comparer.key(&VariableNode::current("V1")),
            comparer.key(&VariableNode::current("v1"))
        );
        assert_ne!(
            comparer.key(&VariableNode::voltage("a")),
            comparer.key(&VariableNode::current("a"))
        );
    }
}
