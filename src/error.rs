use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

/// Errors raised by `memvault`, on either side of the process boundary.
///
/// Every variant carries a bare message so that it can be serialized into an error
/// response by the worker and re-raised unchanged by the [`ProcessManager`](crate::ProcessManager).
#[derive(Error, Debug)]
pub enum SecretError {
    /// Input rejected before any state was touched: a non-buffer or empty plaintext,
    /// an unsupported request type, or malformed request parameters.
    #[error("validation error: {0}")]
    Validation(String),

    /// Protected-memory verification failed, or the protected pool could not satisfy
    /// an allocation.
    #[error("allocation error: {0}")]
    Allocation(String),

    /// Serialization or delivery across the process boundary failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A blocked conversion was attempted on a guarded buffer.
    #[error("security error: {0}")]
    Security(String),

    /// The operation was attempted after shutdown, or in a state that does not allow it.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// An RSA operation failed for a reason other than bad input.
    #[error("cryptographic operation failed: {0}")]
    Crypto(String),

    /// A low-level memory call (`mmap`, `mlock`, `mprotect`, ...) failed.
    #[error("memory system error: {0}")]
    Memcall(#[from] crate::memcall::MemcallError),
}

/// Stable names for each error variant, used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Allocation,
    Transport,
    Security,
    Lifecycle,
    Crypto,
    Memcall,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Allocation => "AllocationError",
            ErrorKind::Transport => "TransportError",
            ErrorKind::Security => "SecurityError",
            ErrorKind::Lifecycle => "LifecycleError",
            ErrorKind::Crypto => "CryptoError",
            ErrorKind::Memcall => "MemcallError",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        let kind = match name {
            "ValidationError" => ErrorKind::Validation,
            "AllocationError" => ErrorKind::Allocation,
            "TransportError" => ErrorKind::Transport,
            "SecurityError" => ErrorKind::Security,
            "LifecycleError" => ErrorKind::Lifecycle,
            "CryptoError" => ErrorKind::Crypto,
            "MemcallError" => ErrorKind::Memcall,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SecretError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SecretError::Validation(_) => ErrorKind::Validation,
            SecretError::Allocation(_) => ErrorKind::Allocation,
            SecretError::Transport(_) => ErrorKind::Transport,
            SecretError::Security(_) => ErrorKind::Security,
            SecretError::Lifecycle(_) => ErrorKind::Lifecycle,
            SecretError::Crypto(_) => ErrorKind::Crypto,
            SecretError::Memcall(_) => ErrorKind::Memcall,
        }
    }

    /// The message without the variant prefix added by `Display`.
    pub fn message(&self) -> String {
        match self {
            SecretError::Validation(m)
            | SecretError::Allocation(m)
            | SecretError::Transport(m)
            | SecretError::Security(m)
            | SecretError::Lifecycle(m)
            | SecretError::Crypto(m) => m.clone(),
            SecretError::Memcall(e) => e.to_string(),
        }
    }

    /// Renders the error and its source chain, one cause per line.
    pub fn stack(&self) -> String {
        let mut out = format!("{}: {}", self.kind(), self.message());
        let mut source = self.source();
        while let Some(cause) = source {
            out.push_str("\n    caused by: ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }

    /// Rebuilds an error received from the other side of the process boundary.
    ///
    /// Unknown kinds, and kinds that wrap a local system error, come back as `Transport`
    /// so the original message is never lost.
    pub fn from_wire(kind: Option<&str>, message: String) -> Self {
        match kind.and_then(ErrorKind::from_wire) {
            Some(ErrorKind::Validation) => SecretError::Validation(message),
            Some(ErrorKind::Allocation) => SecretError::Allocation(message),
            Some(ErrorKind::Security) => SecretError::Security(message),
            Some(ErrorKind::Lifecycle) => SecretError::Lifecycle(message),
            Some(ErrorKind::Crypto) => SecretError::Crypto(message),
            Some(ErrorKind::Transport | ErrorKind::Memcall) | None => {
                SecretError::Transport(message)
            }
        }
    }
}

impl From<std::io::Error> for SecretError {
    fn from(err: std::io::Error) -> Self {
        SecretError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for SecretError {
    fn from(err: serde_json::Error) -> Self {
        SecretError::Transport(format!("malformed message: {}", err))
    }
}

impl From<rsa::Error> for SecretError {
    fn from(err: rsa::Error) -> Self {
        SecretError::Crypto(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SecretError>;
