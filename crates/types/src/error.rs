use thiserror::Error;

/// Errors raised while parsing or constructing core types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypesError {
    /// Stream identifier is not `<node_id>/<suffix>`.
    #[error("invalid stream id: {0}")]
    InvalidStreamId(String),

    /// Job identifier is not a non-negative decimal integer.
    #[error("invalid job id: {0}")]
    InvalidJobId(String),

    /// Profile tag names a profile outside the catalog.
    #[error("unknown video profile: {0}")]
    UnknownProfile(String),

    /// Work order names no profile at all.
    #[error("transcode request has no profiles")]
    EmptyProfiles,
}

/// Result type alias for type construction.
pub type TypesResult<T> = Result<T, TypesError>;
