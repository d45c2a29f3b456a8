//! Id parse errors.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// Empty input. The only failure opaque ids can have.
    #[error("id is empty")]
    Empty,

    #[error("id has prefix '{actual}', expected '{expected}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    /// No `_` between prefix and ULID.
    #[error("id has no '_' after its prefix")]
    MissingSeparator,

    #[error("id carries an invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}
