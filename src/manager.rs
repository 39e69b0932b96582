use crate::buffer::PlaintextBuffer;
use crate::error::{Result, SecretError};
use crate::pool::{PoolSlot, ProtectedPool};
use crate::registry::BufferRegistry;
use log::{debug, info, warn};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::fmt;
use std::ops::Deref;
use zeroize::Zeroize;

/// Smallest modulus that leaves room for an OAEP-SHA256 payload worth storing.
pub const MIN_KEY_BITS: usize = 1024;

/// Lifecycle of a [`SecretManager`].
///
/// Decryption is transient: a manager in `SecretEncrypted` stays there while plaintext
/// copies are out. `ShutDown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Unset,
    KeyPairGenerated,
    SecretEncrypted,
    ShutDown,
}

struct KeyPair {
    public: RsaPublicKey,
    // PKCS#8 DER of the private key, resident in the protected pool.
    private: PoolSlot,
}

/// Zero-fills the wrapped slice when dropped, on every exit path including unwinding.
struct WipeOnDrop<'a>(&'a mut [u8]);

impl Deref for WipeOnDrop<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.0
    }
}

impl Drop for WipeOnDrop<'_> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

fn oaep() -> Oaep {
    Oaep::new::<Sha256>()
}

/// Owns one key pair and one encrypted secret.
///
/// The private key never leaves the [`ProtectedPool`] except as a short-lived parsed
/// copy during [`decrypt`](Self::decrypt). Every plaintext buffer the manager produces is
/// tracked in its [`BufferRegistry`] until it is released or the manager shuts down.
///
/// # Examples
///
/// ```rust,no_run
/// use memvault::{ProtectedPool, SecretManager};
///
/// let pool = ProtectedPool::acquire(16 * 1024, false).unwrap();
/// let mut manager = SecretManager::new(pool, 2048).unwrap();
/// manager.generate_key_pair().unwrap();
///
/// let mut secret = b"correct horse battery staple".to_vec();
/// manager.encrypt(&mut secret).unwrap();
/// assert!(secret.iter().all(|&b| b == 0));
///
/// let plaintext = manager.decrypt().unwrap();
/// plaintext.with_bytes(|bytes| assert_eq!(bytes.len(), 28)).unwrap();
/// manager.release(&plaintext);
/// manager.shutdown();
/// ```
pub struct SecretManager {
    pool: ProtectedPool,
    key_bits: usize,
    key_pair: Option<KeyPair>,
    encrypted: Option<Vec<u8>>,
    baseline: Option<usize>,
    registry: BufferRegistry,
    shut_down: bool,
}

impl fmt::Debug for SecretManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretManager")
            .field("state", &self.state())
            .field("key_bits", &self.key_bits)
            .field("baseline", &self.baseline)
            .field("live_buffers", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl SecretManager {
    /// Creates a manager that will hold its private key in `pool`.
    ///
    /// # Errors
    ///
    /// * `SecretError::Validation` - `key_bits` is below [`MIN_KEY_BITS`]
    pub fn new(pool: ProtectedPool, key_bits: usize) -> Result<Self> {
        if key_bits < MIN_KEY_BITS {
            return Err(SecretError::Validation(format!(
                "key size must be at least {} bits, got {}",
                MIN_KEY_BITS, key_bits
            )));
        }
        Ok(Self {
            pool,
            key_bits,
            key_pair: None,
            encrypted: None,
            baseline: None,
            registry: BufferRegistry::new(),
            shut_down: false,
        })
    }

    pub fn state(&self) -> ManagerState {
        if self.shut_down {
            ManagerState::ShutDown
        } else if self.encrypted.is_some() {
            ManagerState::SecretEncrypted
        } else if self.key_pair.is_some() {
            ManagerState::KeyPairGenerated
        } else {
            ManagerState::Unset
        }
    }

    /// Whether the protected pool is locked into RAM.
    pub fn is_protected_memory_in_use(&self) -> bool {
        !self.shut_down && self.pool.is_locked()
    }

    /// Number of plaintext buffers handed out and not yet released.
    pub fn live_buffers(&self) -> usize {
        self.registry.len()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.shut_down {
            return Err(SecretError::Lifecycle("secret manager has been shut down".into()));
        }
        Ok(())
    }

    /// Generates the key pair and records the protected-memory allocation baseline.
    ///
    /// The growth of pool usage across key creation is the only evidence that the private
    /// key actually landed in protected memory, so a non-increase is an error.
    ///
    /// # Errors
    ///
    /// * `SecretError::Lifecycle` - shut down, or a key pair already exists
    /// * `SecretError::Allocation` - the pool did not grow, or is exhausted
    /// * `SecretError::Crypto` - key generation or encoding failed
    pub fn generate_key_pair(&mut self) -> Result<()> {
        self.ensure_live()?;
        if self.key_pair.is_some() {
            return Err(SecretError::Lifecycle("key pair has already been generated".into()));
        }

        let before = self.pool.in_use();
        let private_key = RsaPrivateKey::new(&mut OsRng, self.key_bits)?;
        let public = RsaPublicKey::from(&private_key);
        let der = private_key
            .to_pkcs8_der()
            .map_err(|e| SecretError::Crypto(format!("cannot encode private key: {}", e)))?;
        drop(private_key);
        let private = self.pool.store(der.as_bytes())?;
        drop(der);
        let after = self.pool.in_use();

        if after <= before {
            self.pool.release(private);
            return Err(SecretError::Allocation(format!(
                "protected memory usage did not increase during key generation ({} -> {} bytes)",
                before, after
            )));
        }

        self.baseline = Some(after - before);
        self.key_pair = Some(KeyPair { public, private });
        info!(
            "generated {}-bit key pair, protected memory baseline {} bytes",
            self.key_bits,
            after - before
        );
        Ok(())
    }

    /// Checks that the private key is still accounted for in protected memory.
    ///
    /// # Errors
    ///
    /// * `SecretError::Allocation` - no baseline exists yet, or usage fell below it
    /// * `SecretError::Lifecycle` - the manager has been shut down
    pub fn verify_allocation(&self) -> Result<()> {
        self.ensure_live()?;
        let baseline = self.baseline.ok_or_else(|| {
            SecretError::Allocation(
                "no allocation baseline recorded; generate a key pair first".into(),
            )
        })?;
        let current = self.pool.in_use();
        if current < baseline {
            warn!(
                "protected memory usage {} is below baseline {}; key may have been relocated",
                current, baseline
            );
            return Err(SecretError::Allocation(format!(
                "protected memory usage {} bytes is below the {} byte baseline",
                current, baseline
            )));
        }
        debug!("allocation verified: {} bytes in use, baseline {}", current, baseline);
        Ok(())
    }

    /// Encrypts `plaintext` under the public key and stores the ciphertext, replacing
    /// (and wiping) any previous one.
    ///
    /// Only a mutable byte buffer is accepted. Once past validation the buffer is
    /// zero-filled before this returns, whether encryption succeeded or not.
    ///
    /// # Errors
    ///
    /// * `SecretError::Validation` - `plaintext` is empty (nothing is modified)
    /// * `SecretError::Lifecycle` - shut down, or no key pair yet
    /// * `SecretError::Crypto` - the plaintext is too long for the key, or RSA failed
    pub fn encrypt(&mut self, plaintext: &mut [u8]) -> Result<()> {
        if plaintext.is_empty() {
            return Err(SecretError::Validation("plaintext buffer must not be empty".into()));
        }
        let plaintext = WipeOnDrop(plaintext);
        self.ensure_live()?;
        let key_pair = self
            .key_pair
            .as_ref()
            .ok_or_else(|| SecretError::Lifecycle("no key pair has been generated".into()))?;

        let ciphertext = key_pair.public.encrypt(&mut OsRng, oaep(), &plaintext)?;
        if let Some(mut previous) = self.encrypted.replace(ciphertext) {
            previous.zeroize();
            debug!("replaced previously encrypted secret");
        }
        Ok(())
    }

    /// Decrypts the stored secret into a fresh, registered [`PlaintextBuffer`].
    ///
    /// # Errors
    ///
    /// * `SecretError::Lifecycle` - shut down, no key pair, or nothing encrypted yet
    /// * `SecretError::Allocation` - the private key is no longer resident in the pool
    /// * `SecretError::Crypto` - the private key could not be parsed or RSA failed
    pub fn decrypt(&mut self) -> Result<PlaintextBuffer> {
        self.ensure_live()?;
        let key_pair = self
            .key_pair
            .as_ref()
            .ok_or_else(|| SecretError::Lifecycle("no key pair has been generated".into()))?;
        let ciphertext = self
            .encrypted
            .as_ref()
            .ok_or_else(|| SecretError::Lifecycle("no secret has been encrypted".into()))?;

        let der = self.pool.read(&key_pair.private)?;
        let private_key = RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|e| SecretError::Crypto(format!("cannot load private key: {}", e)))?;
        let plaintext = private_key.decrypt(oaep(), ciphertext)?;
        drop(private_key);

        let buffer = PlaintextBuffer::from_vec(plaintext);
        self.registry.register(&buffer);
        debug!("decrypted secret into buffer {}", buffer.id());
        Ok(buffer)
    }

    /// Sanitizes a buffer returned by [`decrypt`](Self::decrypt) and forgets it.
    /// Returns `true` if this call performed the wipe.
    pub fn release(&mut self, buffer: &PlaintextBuffer) -> bool {
        self.registry.release(buffer)
    }

    /// Wipes the ciphertext, every live plaintext buffer and the private key, then
    /// releases protected memory. Idempotent; failures are logged and do not stop the
    /// remaining steps.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if let Some(mut ciphertext) = self.encrypted.take() {
            ciphertext.zeroize();
        }
        let wiped = self.registry.sanitize_all();
        if wiped > 0 {
            info!("sanitized {} outstanding plaintext buffer(s) during shutdown", wiped);
        }
        if let Some(key_pair) = self.key_pair.take() {
            self.pool.release(key_pair.private);
        }
        self.baseline = None;
        if let Err(e) = self.pool.close() {
            warn!("failed to release protected memory during shutdown: {}", e);
        }
        info!("secret manager shut down");
    }
}

impl Drop for SecretManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
