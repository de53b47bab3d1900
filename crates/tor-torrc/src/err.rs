//! Errors arising while building torrc settings.

use crate::keyword::Keyword;

/// An error encountered while constructing a setting or committing a
/// configuration.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A value was out of range, or otherwise unacceptable for its keyword.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    /// A keyword was given a value of the wrong kind.
    #[error("{keyword} does not accept a value of kind {given:?}")]
    WrongValueKind {
        /// The keyword that rejected the value.
        keyword: Keyword,
        /// What kind of value was offered.
        given: &'static str,
    },
}

impl ConfigError {
    /// Helper: construct an [`ConfigError::IllegalArgument`].
    pub(crate) fn illegal(msg: impl Into<String>) -> Self {
        ConfigError::IllegalArgument(msg.into())
    }
}
