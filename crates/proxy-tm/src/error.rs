use crate::transaction::TransactionKey;
use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while forwarding a request or processing its replies.
///
/// Per-branch failures are normally absorbed by the engine and turned into a
/// losing synthetic reply on that branch. Only transaction-level failures (no
/// branch could be created or sent at all) surface to the caller.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// A buffer could not be allocated or serialized.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// The transaction already carries the configured maximum of branches.
    #[error("Too many branches (max {max})")]
    TooManyBranches { max: usize },

    /// The destination could not be resolved or parsed.
    #[error("Bad address: {0}")]
    BadAddress(String),

    /// No local socket matches the destination's address family or protocol.
    #[error("No transport for destination: {0}")]
    NoTransport(String),

    /// The transport failed to send the buffer.
    #[error("Send failure: {0}")]
    SendFailure(String),

    /// The transaction was canceled while forwarding was in progress.
    #[error("Transaction canceled")]
    Canceled,

    /// Internal consistency was violated, e.g. a branch buffer was written twice.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// The resolver cursor of a failed branch has no further candidates.
    #[error("No more destination candidates")]
    NoMoreCandidates,

    /// A branch was vetoed by the branch route hook.
    #[error("Branch {0} dropped by route hook")]
    BranchDropped(usize),

    /// Transaction with the given key already exists.
    #[error("Transaction already exists: {0}")]
    TransactionExists(TransactionKey),

    /// A final reply was already sent upstream.
    #[error("Transaction already completed")]
    AlreadyCompleted,

    /// No transaction matches the message.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// Invalid configuration or logging setup.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Status code and reason phrase sent upstream when this error ends a transaction.
    pub fn reply_code(&self) -> (u16, &'static str) {
        match self {
            Error::OutOfMemory(_) => (500, "Server Internal Error (out of memory)"),
            Error::TooManyBranches { .. } => (500, "Server Internal Error (too many branches)"),
            Error::InvariantViolation(_) => (500, "Server Internal Error"),
            Error::BadAddress(_) => (478, "Unresolvable destination"),
            Error::NoTransport(_) => (503, "Service Unavailable (no transport)"),
            Error::SendFailure(_) | Error::NoMoreCandidates => {
                (503, "Service Unavailable (send failed)")
            }
            Error::Canceled => (487, "Request Terminated"),
            Error::BranchDropped(_) => (500, "Server Internal Error (branch dropped)"),
            Error::TransactionExists(_)
            | Error::AlreadyCompleted
            | Error::TransactionNotFound(_)
            | Error::Config(_) => (500, "Server Internal Error"),
        }
    }

    /// Rank used to keep the most specific error while trying several branches.
    pub fn specificity(&self) -> u8 {
        match self {
            Error::Canceled => 9,
            Error::InvariantViolation(_) => 8,
            Error::OutOfMemory(_) => 7,
            Error::TooManyBranches { .. } => 6,
            Error::NoTransport(_) => 5,
            Error::BadAddress(_) => 4,
            Error::BranchDropped(_) => 3,
            Error::SendFailure(_) => 2,
            Error::NoMoreCandidates => 1,
            _ => 0,
        }
    }

    /// Keeps whichever of `current` and `candidate` is more specific.
    pub(crate) fn most_specific(current: Option<Error>, candidate: Error) -> Error {
        match current {
            Some(existing) if existing.specificity() >= candidate.specificity() => existing,
            _ => candidate,
        }
    }
}

/// Errors reported by a [`Transport`](crate::interfaces::Transport).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("transport closed")]
    Closed,
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::SendFailure(e.to_string())
    }
}

/// Errors reported by a [`Resolver`](crate::interfaces::Resolver).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("cannot resolve {0}")]
    NotFound(String),
    #[error("invalid target {0}")]
    InvalidTarget(String),
}

impl From<ResolveError> for Error {
    fn from(e: ResolveError) -> Self {
        Error::BadAddress(e.to_string())
    }
}

/// Errors reported by a [`MessageBuilder`](crate::interfaces::MessageBuilder).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot build message: {0}")]
pub struct BuildError(pub String);

impl From<BuildError> for Error {
    fn from(e: BuildError) -> Self {
        Error::OutOfMemory(e.0)
    }
}
