//! Lookup of built-in strategies by identifier.

use std::collections::BTreeMap;

use super::error::QtsimError;
use super::parameter::{ParameterSpace, ParameterVector};
use super::strategy::{BuiltinStrategy, Strategy};

#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    entries: BTreeMap<&'static str, BuiltinStrategy>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StrategyRegistry {
    pub fn new() -> Self {
        StrategyRegistry {
            entries: BuiltinStrategy::ALL.iter().map(|s| (s.id(), *s)).collect(),
        }
    }

    /// Strategy with default parameters. Identifiers are case-insensitive.
    pub fn lookup(&self, id: &str) -> Result<Strategy, QtsimError> {
        self.kind(id).map(Strategy::with_defaults)
    }

    /// Strategy bound to `params`, validated against its space.
    pub fn instantiate(&self, id: &str, params: ParameterVector) -> Result<Strategy, QtsimError> {
        Strategy::new(self.kind(id)?, params)
    }

    pub fn default_space(&self, id: &str) -> Result<ParameterSpace, QtsimError> {
        self.kind(id).map(|k| k.parameter_space())
    }

    pub fn kind(&self, id: &str) -> Result<BuiltinStrategy, QtsimError> {
        self.entries
            .get(id.trim().to_ascii_lowercase().as_str())
            .copied()
            .ok_or_else(|| QtsimError::UnknownStrategy { id: id.to_string() })
    }

    /// Identifiers in sorted order.
    pub fn identifiers(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.keys().copied()
    }
}
