use crate::error::{Result, SecretError};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use zeroize::Zeroize;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

struct BufferState {
    id: u64,
    data: Mutex<Vec<u8>>,
    sanitized: AtomicBool,
}

impl Drop for BufferState {
    fn drop(&mut self) {
        self.data.get_mut().zeroize();
    }
}

/// Decrypted secret bytes.
///
/// A `PlaintextBuffer` is a cheap, shareable handle: clones refer to the same storage,
/// which lets a registry keep track of a buffer while a consumer holds it. The bytes are
/// zero-filled exactly once, by whichever holder calls [`sanitize`](Self::sanitize) first,
/// and again when the last handle is dropped.
///
/// There is no `Display`, `Serialize` or `String` conversion, and the `Debug`
/// rendering never shows the contents.
#[derive(Clone)]
pub struct PlaintextBuffer {
    state: Arc<BufferState>,
}

impl PlaintextBuffer {
    /// Takes ownership of `bytes` without copying them.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            state: Arc::new(BufferState {
                id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
                data: Mutex::new(bytes),
                sanitized: AtomicBool::new(false),
            }),
        }
    }

    /// Process-unique identity shared by all clones of this buffer.
    pub fn id(&self) -> u64 {
        self.state.id
    }

    pub fn len(&self) -> usize {
        self.state.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_sanitized(&self) -> bool {
        self.state.sanitized.load(Ordering::SeqCst)
    }

    /// Runs `action` over the bytes.
    ///
    /// # Errors
    ///
    /// * `SecretError::Lifecycle` - the buffer has already been sanitized
    pub fn with_bytes<F, R>(&self, action: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> R,
    {
        let data = self.state.data.lock();
        if self.is_sanitized() {
            return Err(SecretError::Lifecycle(
                "plaintext buffer has already been sanitized".into(),
            ));
        }
        Ok(action(&data))
    }

    /// Zero-fills the bytes. Returns `true` only for the call that performed the wipe.
    pub fn sanitize(&self) -> bool {
        let mut data = self.state.data.lock();
        if self.state.sanitized.swap(true, Ordering::SeqCst) {
            return false;
        }
        // Keep the length so holders observe zeros rather than an empty buffer.
        data.as_mut_slice().zeroize();
        true
    }

    #[cfg(test)]
    pub(crate) fn raw_snapshot(&self) -> Vec<u8> {
        self.state.data.lock().clone()
    }
}

impl fmt::Debug for PlaintextBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PlaintextBuffer([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_wipes_exactly_once() {
        let buffer = PlaintextBuffer::from_vec(vec![1, 2, 3, 4]);
        let other = buffer.clone();

        assert!(buffer.sanitize());
        assert!(!other.sanitize(), "second sanitize must be a no-op");
        assert!(other.is_sanitized());
        assert_eq!(buffer.raw_snapshot(), vec![0, 0, 0, 0]);
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn with_bytes_fails_after_sanitize() {
        let buffer = PlaintextBuffer::from_vec(vec![9; 8]);
        let sum = buffer
            .with_bytes(|b| b.iter().map(|&x| x as u32).sum::<u32>())
            .expect("read");
        assert_eq!(sum, 72);

        buffer.sanitize();
        assert!(matches!(
            buffer.with_bytes(|b| b.len()),
            Err(SecretError::Lifecycle(_))
        ));
    }

    #[test]
    fn clones_share_identity() {
        let buffer = PlaintextBuffer::from_vec(vec![1]);
        let other = PlaintextBuffer::from_vec(vec![1]);
        assert_eq!(buffer.id(), buffer.clone().id());
        assert_ne!(buffer.id(), other.id());
    }

    #[test]
    fn debug_is_redacted() {
        let buffer = PlaintextBuffer::from_vec(b"hunter2".to_vec());
        let rendered = format!("{:?}", buffer);
        assert_eq!(rendered, "PlaintextBuffer([REDACTED])");
    }
}
