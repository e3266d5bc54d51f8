//! Error definitions
//!
//! This module provides error types for settlekit.

use std::time::Duration;

use thiserror::Error;

/// Main error type for settlekit
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The deadline elapsed with operations still outstanding
    #[error("tracked operations still outstanding after {0:?}")]
    Timeout(Duration),

    /// A registration call named a member the target does not have
    #[error("target has no member named `{0}`")]
    MissingMember(String),

    /// A registration call named a member of the wrong shape
    #[error("member `{name}` is not a {expected}")]
    WrongShape {
        /// The member that was looked up.
        name: String,
        /// The shape the registration call required.
        expected: &'static str,
    },
}

impl Error {
    /// Create a missing-member error.
    #[must_use]
    pub fn missing_member(name: impl Into<String>) -> Self {
        Self::MissingMember(name.into())
    }

    /// Create a wrong-shape error.
    #[must_use]
    pub fn wrong_shape(name: impl Into<String>, expected: &'static str) -> Self {
        Self::WrongShape {
            name: name.into(),
            expected,
        }
    }

    /// Check whether this error is the synthetic deadline error.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
