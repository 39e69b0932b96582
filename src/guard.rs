//! Scoped access to a decrypted secret.
//!
//! A [`GuardedAccessor`] is handed to exactly one consumer callback. It offers byte-level
//! reads and feeding the bytes to digest/MAC primitives, and nothing that would produce a
//! text or structured copy of them. When the callback settles (returns, fails, panics, or
//! its future is dropped) the underlying buffer is zero-filled and deregistered once.
//!
//! Nothing stops a callback from copying the bytes it is shown into storage of its own;
//! the guarantee covers the buffers this crate owns, not copies a consumer makes.

use crate::buffer::PlaintextBuffer;
use crate::error::{Result, SecretError};
use crate::registry::BufferRegistry;
use log::debug;
use parking_lot::Mutex;
use serde::ser::{Error as _, Serialize, Serializer};
use sha2::digest::Update;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use subtle::ConstantTimeEq;

const TEXT_BLOCKED: &str = "guarded secret cannot be converted to text";
const STRUCTURED_BLOCKED: &str =
    "guarded secret cannot be converted to a structured representation";

/// Restricted view of one plaintext buffer, valid for a single callback.
pub struct GuardedAccessor {
    buffer: PlaintextBuffer,
}

impl GuardedAccessor {
    pub(crate) fn new(buffer: PlaintextBuffer) -> Self {
        Self { buffer }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Runs `action` over the secret bytes.
    ///
    /// # Errors
    ///
    /// * `SecretError::Lifecycle` - the accessor outlived its callback and has been wiped
    pub fn with_bytes<F, R>(&self, action: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> R,
    {
        self.buffer.with_bytes(action)
    }

    /// Feeds the secret into a hash or MAC state.
    pub fn update_digest<D: Update>(&self, digest: &mut D) -> Result<()> {
        self.buffer.with_bytes(|bytes| digest.update(bytes))
    }

    /// Constant-time comparison against `expected`.
    pub fn ct_eq(&self, expected: &[u8]) -> Result<bool> {
        self.buffer.with_bytes(|bytes| bytes.ct_eq(expected).into())
    }

    #[cfg(test)]
    pub(crate) fn buffer(&self) -> &PlaintextBuffer {
        &self.buffer
    }
}

impl fmt::Debug for GuardedAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GuardedAccessor([REDACTED])")
    }
}

impl TryFrom<&GuardedAccessor> for String {
    type Error = SecretError;

    fn try_from(_: &GuardedAccessor) -> Result<Self> {
        Err(SecretError::Security(TEXT_BLOCKED.into()))
    }
}

impl TryFrom<&GuardedAccessor> for serde_json::Value {
    type Error = SecretError;

    fn try_from(_: &GuardedAccessor) -> Result<Self> {
        Err(SecretError::Security(STRUCTURED_BLOCKED.into()))
    }
}

impl Serialize for GuardedAccessor {
    fn serialize<S: Serializer>(&self, _: S) -> std::result::Result<S::Ok, S::Error> {
        Err(S::Error::custom(SecretError::Security(STRUCTURED_BLOCKED.into())))
    }
}

/// Sanitizes and deregisters the guarded buffer when the scope ends, however it ends.
struct ScopeCleanup {
    buffer: PlaintextBuffer,
    registry: Arc<Mutex<BufferRegistry>>,
}

impl Drop for ScopeCleanup {
    fn drop(&mut self) {
        if self.registry.lock().release(&self.buffer) {
            debug!("guard: sanitized buffer {}", self.buffer.id());
        }
    }
}

/// Runs an asynchronous consumer over `buffer`, cleaning up once its future settles.
pub(crate) async fn run_guarded<F, Fut, T, E>(
    buffer: PlaintextBuffer,
    registry: Arc<Mutex<BufferRegistry>>,
    callback: F,
) -> std::result::Result<T, E>
where
    F: FnOnce(GuardedAccessor) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let _cleanup = ScopeCleanup {
        buffer: buffer.clone(),
        registry,
    };
    callback(GuardedAccessor::new(buffer)).await
}

/// Runs a synchronous consumer over `buffer`, cleaning up before returning.
pub(crate) fn run_guarded_sync<F, T, E>(
    buffer: PlaintextBuffer,
    registry: Arc<Mutex<BufferRegistry>>,
    callback: F,
) -> std::result::Result<T, E>
where
    F: FnOnce(&GuardedAccessor) -> std::result::Result<T, E>,
{
    let _cleanup = ScopeCleanup {
        buffer: buffer.clone(),
        registry,
    };
    callback(&GuardedAccessor::new(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::time::Duration;

    fn registered(bytes: Vec<u8>) -> (PlaintextBuffer, Arc<Mutex<BufferRegistry>>) {
        let buffer = PlaintextBuffer::from_vec(bytes);
        let registry = Arc::new(Mutex::new(BufferRegistry::new()));
        registry.lock().register(&buffer);
        (buffer, registry)
    }

    fn assert_cleaned(buffer: &PlaintextBuffer, registry: &Arc<Mutex<BufferRegistry>>) {
        assert!(buffer.is_sanitized());
        assert!(buffer.raw_snapshot().iter().all(|&b| b == 0));
        assert!(!registry.lock().contains(buffer));
        assert!(!buffer.sanitize(), "cleanup must have wiped exactly once already");
    }

    #[tokio::test]
    async fn normal_completion_cleans_up() {
        let original: Vec<u8> = (1..=32).collect();
        let (buffer, registry) = registered(original.clone());

        let seen = run_guarded(buffer.clone(), registry.clone(), |secret| async move {
            secret.with_bytes(|b| b.to_vec())
        })
        .await
        .expect("callback");

        assert_eq!(seen, original);
        assert_cleaned(&buffer, &registry);
    }

    #[tokio::test]
    async fn immediate_error_cleans_up() {
        let (buffer, registry) = registered(vec![4; 8]);
        let result: Result<()> = run_guarded(buffer.clone(), registry.clone(), |_secret| async {
            Err(SecretError::Validation("consumer rejected the secret".into()))
        })
        .await;
        assert!(matches!(result, Err(SecretError::Validation(_))));
        assert_cleaned(&buffer, &registry);
    }

    #[tokio::test]
    async fn deferred_rejection_cleans_up() {
        let (buffer, registry) = registered(vec![5; 8]);
        let result: Result<()> = run_guarded(buffer.clone(), registry.clone(), |secret| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(!secret.buffer().is_sanitized(), "still live while the future is pending");
            Err(SecretError::Transport("downstream failed".into()))
        })
        .await;
        assert!(matches!(result, Err(SecretError::Transport(_))));
        assert_cleaned(&buffer, &registry);
    }

    #[tokio::test]
    async fn dropped_future_cleans_up() {
        let (buffer, registry) = registered(vec![6; 8]);
        let pending = run_guarded(buffer.clone(), registry.clone(), |_secret| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, SecretError>(())
        });
        assert!(tokio::time::timeout(Duration::from_millis(10), pending).await.is_err());
        assert_cleaned(&buffer, &registry);
    }

    #[test]
    fn sync_error_and_panic_clean_up() {
        let (buffer, registry) = registered(vec![7; 8]);
        let result: Result<()> = run_guarded_sync(buffer.clone(), registry.clone(), |_| {
            Err(SecretError::Security("nope".into()))
        });
        assert!(result.is_err());
        assert_cleaned(&buffer, &registry);

        let (buffer, registry) = registered(vec![8; 8]);
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let _: Result<()> = run_guarded_sync(buffer.clone(), registry.clone(), |_| {
                panic!("consumer blew up");
            });
        }));
        assert!(outcome.is_err());
        assert_cleaned(&buffer, &registry);
    }

    #[tokio::test]
    async fn escaped_accessor_is_dead() {
        let (buffer, registry) = registered(vec![9; 8]);
        let escaped = run_guarded(buffer, registry, |secret| async move {
            Ok::<_, SecretError>(secret)
        })
        .await
        .expect("callback");
        assert!(matches!(escaped.with_bytes(|b| b.len()), Err(SecretError::Lifecycle(_))));
    }

    #[test]
    fn conversions_are_blocked_for_any_contents() {
        for contents in [
            b"plain ascii".to_vec(),
            vec![0xFF, 0xFE, 0x00],
            vec![0; 32],
            b"{\"a\":1}".to_vec(),
        ] {
            let accessor = GuardedAccessor::new(PlaintextBuffer::from_vec(contents));
            assert!(matches!(String::try_from(&accessor), Err(SecretError::Security(_))));
            assert!(matches!(
                serde_json::Value::try_from(&accessor),
                Err(SecretError::Security(_))
            ));
            let err = serde_json::to_string(&accessor).expect_err("serialization must fail");
            assert!(err.to_string().contains("security error"));
            assert_eq!(format!("{:?}", accessor), "GuardedAccessor([REDACTED])");
        }
    }

    #[test]
    fn crypto_consumption_is_allowed() {
        let accessor = GuardedAccessor::new(PlaintextBuffer::from_vec(b"abc".to_vec()));
        let mut hasher = Sha256::new();
        accessor.update_digest(&mut hasher).expect("digest");
        assert_eq!(hasher.finalize().as_slice(), Sha256::digest(b"abc").as_slice());
        assert!(accessor.ct_eq(b"abc").expect("compare"));
        assert!(!accessor.ct_eq(b"abd").expect("compare"));
    }
}
