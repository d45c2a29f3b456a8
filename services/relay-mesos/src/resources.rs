//! Scalar resource quantities keyed by resource name.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tolerance for float comparisons after repeated subtraction.
const EPSILON: f64 = 1e-9;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResourceParseError {
    #[error("resource '{0}' is not of the form name=quantity")]
    Malformed(String),

    #[error("resource '{name}' has invalid quantity '{value}'")]
    InvalidQuantity { name: String, value: String },

    #[error("resource '{0}' is listed more than once")]
    Duplicate(String),
}

/// A set of named scalar quantities, e.g. `cpus=0.5 mem=256`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources(BTreeMap<String, f64>);

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, quantity: f64) -> Self {
        self.0.insert(name.into(), quantity);
        self
    }

    /// Adds to a quantity, creating it if absent.
    pub fn add(&mut self, name: &str, quantity: f64) {
        *self.0.entry(name.to_string()).or_insert(0.0) += quantity;
    }

    pub fn get(&self, name: &str) -> f64 {
        self.0.get(name).copied().unwrap_or(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// True if every quantity in `required` is available here.
    pub fn covers(&self, required: &Resources) -> bool {
        required
            .iter()
            .all(|(name, quantity)| self.get(name) + EPSILON >= quantity)
    }

    /// Removes `required` from these resources. Callers check `covers` first.
    pub fn subtract(&mut self, required: &Resources) {
        for (name, quantity) in required.iter() {
            let entry = self.0.entry(name.to_string()).or_insert(0.0);
            *entry = (*entry - quantity).max(0.0);
        }
    }

    /// Returns `required` to these resources.
    pub fn restore(&mut self, required: &Resources) {
        for (name, quantity) in required.iter() {
            self.add(name, quantity);
        }
    }

    /// How many copies of `required` fit, capped at `limit`.
    ///
    /// An empty requirement fits `limit` times.
    pub fn fit_count(&self, required: &Resources, limit: u64) -> u64 {
        required
            .iter()
            .filter(|(_, quantity)| *quantity > 0.0)
            .map(|(name, quantity)| {
                let copies = ((self.get(name) + EPSILON) / quantity).floor();
                // Float to int casts saturate.
                copies.max(0.0) as u64
            })
            .fold(limit, u64::min)
    }
}

impl FromStr for Resources {
    type Err = ResourceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut resources = BTreeMap::new();
        for pair in s.split_whitespace() {
            let Some((name, value)) = pair.split_once('=') else {
                return Err(ResourceParseError::Malformed(pair.to_string()));
            };
            if name.is_empty() {
                return Err(ResourceParseError::Malformed(pair.to_string()));
            }
            let quantity = value
                .parse::<f64>()
                .ok()
                .filter(|q| q.is_finite() && *q > 0.0)
                .ok_or_else(|| ResourceParseError::InvalidQuantity {
                    name: name.to_string(),
                    value: value.to_string(),
                })?;
            if resources.insert(name.to_string(), quantity).is_some() {
                return Err(ResourceParseError::Duplicate(name.to_string()));
            }
        }
        Ok(Self(resources))
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, quantity) in self.iter() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{name}={quantity}")?;
            first = false;
        }
        Ok(())
    }
}
