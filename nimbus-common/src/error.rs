use std::fmt;

/// The closed set of failure kinds that can cross a core API boundary.
///
/// Every variant carries a human-readable message; variants that originate
/// from a gRPC response additionally carry the upstream `tonic::Code` they
/// were mapped from (see [`NimbusError::from_status`]).
#[derive(Debug, Clone)]
pub enum NimbusError {
    NotFound(String),
    AlreadyExists(String),
    InvalidArgument(String),
    FailedPrecondition(String),
    Unauthenticated(String),
    PermissionDenied(String),
    DeadlineExceeded(String),
    Unavailable(String),
    /// Transient transport/server failure, safe to retry.
    Internal(String),
    /// The remote user code itself failed; carries the server's message verbatim.
    RemoteError(String),
    /// A retryable system failure reported by the invocation engine.
    InternalFailure(String),
    FunctionTimeout(String),
    SandboxTimeout(String),
    QueueEmpty,
    QueueFull(String),
    KeyError(String),
    /// The sandbox handle has been detached and no longer accepts mutating calls.
    SandboxDetached(String),
}

impl NimbusError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// `name` and `rule` identify the offending parameter and the invariant
    /// it broke, per the validation error contract in the spec.
    pub fn invalid_parameter(name: &str, rule: impl fmt::Display) -> Self {
        Self::InvalidArgument(format!("invalid value for `{name}`: {rule}"))
    }

    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            NimbusError::DeadlineExceeded(_)
                | NimbusError::Unavailable(_)
                | NimbusError::Internal(_)
                | NimbusError::InternalFailure(_)
        )
    }

    /// Maps a gRPC status to a core error kind. Status codes not explicitly
    /// called out by the spec fold into `Internal`, matching the
    /// `INTERNAL/UNKNOWN/CANCELLED -> Internal` rule.
    pub fn from_status(status: &tonic::Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            tonic::Code::NotFound => Self::NotFound(message),
            tonic::Code::AlreadyExists => Self::AlreadyExists(message),
            tonic::Code::InvalidArgument => Self::InvalidArgument(message),
            tonic::Code::FailedPrecondition => Self::FailedPrecondition(message),
            tonic::Code::Unauthenticated => Self::Unauthenticated(message),
            tonic::Code::PermissionDenied => Self::PermissionDenied(message),
            tonic::Code::DeadlineExceeded => Self::DeadlineExceeded(message),
            tonic::Code::Unavailable => Self::Unavailable(message),
            _ => Self::Internal(message),
        }
    }
}

impl From<tonic::Status> for NimbusError {
    fn from(status: tonic::Status) -> Self {
        Self::from_status(&status)
    }
}

impl fmt::Display for NimbusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NimbusError::NotFound(m) => write!(f, "not found: {m}"),
            NimbusError::AlreadyExists(m) => write!(f, "already exists: {m}"),
            NimbusError::InvalidArgument(m) => write!(f, "invalid argument: {m}"),
            NimbusError::FailedPrecondition(m) => write!(f, "failed precondition: {m}"),
            NimbusError::Unauthenticated(m) => write!(f, "unauthenticated: {m}"),
            NimbusError::PermissionDenied(m) => write!(f, "permission denied: {m}"),
            NimbusError::DeadlineExceeded(m) => write!(f, "deadline exceeded: {m}"),
            NimbusError::Unavailable(m) => write!(f, "unavailable: {m}"),
            NimbusError::Internal(m) => write!(f, "internal error: {m}"),
            NimbusError::RemoteError(m) => write!(f, "remote function failed: {m}"),
            NimbusError::InternalFailure(m) => write!(f, "internal system failure: {m}"),
            NimbusError::FunctionTimeout(m) => write!(f, "function call timed out: {m}"),
            NimbusError::SandboxTimeout(m) => write!(f, "sandbox operation timed out: {m}"),
            NimbusError::QueueEmpty => write!(f, "queue is empty"),
            NimbusError::QueueFull(m) => write!(f, "queue is full: {m}"),
            NimbusError::KeyError(m) => write!(f, "key error: {m}"),
            NimbusError::SandboxDetached(m) => write!(f, "sandbox is detached: {m}"),
        }
    }
}

impl std::error::Error for NimbusError {}

pub type Result<T> = std::result::Result<T, NimbusError>;
