//! Protocol-level errors.

/// A malformed reply or event from the control port.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProtoError {
    /// A reply line did not start with `NNN( |-|+)`.
    #[error("malformed reply line: {0:?}")]
    MalformedLine(String),

    /// A data payload line arrived with no data-bearing line open.
    #[error("data payload outside a data reply")]
    UnexpectedPayload,

    /// An asynchronous event carried no event keyword.
    #[error("asynchronous event with empty content")]
    EmptyEvent,
}
