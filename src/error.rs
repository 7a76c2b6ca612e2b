use thiserror::Error;

/// The seven fatal-or-classified error kinds from the design's error
/// handling section. Most call sites still propagate failures as
/// `anyhow::Error` with `.context(...)` chains; these variants exist so
/// callers that need to distinguish a failure mode (in particular
/// `ForeignReference`, which is caught and discarded rather than
/// propagated) can match on them instead of inspecting strings.
#[derive(Error, Debug)]
pub enum IncryptError {
    #[error("corrupt metadata record: {0}")]
    CorruptMetadata(String),

    #[error("corrupt cipher input: {0}")]
    CorruptCipher(String),

    #[error("reference is not managed by this key")]
    ForeignReference,

    #[error("object graph discovery left {0} object(s) pending: corrupt history or a bug")]
    IncompleteGraph(usize),

    #[error("expected a commit or tag object but found {0:?}")]
    UnexpectedType(git2::ObjectType),

    #[error("transport operation failed: {0}")]
    TransportFailure(String),

    #[error("external key-management tool failed: {0}")]
    KeyToolFailure(String),
}
