//! # memvault
//!
//! `memvault` keeps a single credential encrypted in protected memory inside an isolated
//! worker process, and lends decrypted copies to callers for exactly one callback at a
//! time.
//!
//! - **Protected memory**: the worker's RSA private key lives in an `mlock`ed,
//!   dump-excluded pool acquired once at start.
//! - **Process isolation**: the worker runs as its own executable (`memvault-worker`);
//!   the supervising side never shares its address space.
//! - **Zeroization**: every plaintext copy, on both sides of the boundary, is zero-filled
//!   once its use ends: after encryption, after a response is flushed, and after a
//!   guarded callback settles, on error paths included.
//!
//! ## Key Components
//!
//! - [`SecretManager`]: key pair, the encrypted secret, and the registry of live
//!   plaintext buffers.
//! - [`Worker`]: serves requests for one `SecretManager` over a newline-delimited JSON
//!   channel.
//! - [`ProcessManager`]: spawns the worker, correlates concurrent requests, and offers
//!   [`with_guarded_secret`](ProcessManager::with_guarded_secret).
//! - [`GuardedAccessor`]: byte-level view of the secret for one callback; text and
//!   structured conversions fail with [`SecretError::Security`].
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use memvault::{ManagerConfig, ProcessManager, SecretError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), SecretError> {
//!     let manager = ProcessManager::spawn(&ManagerConfig::from_env()?)?;
//!     manager.generate_key_pair().await?;
//!     manager.read_in_secret("Password: ").await?;
//!
//!     let matches = manager
//!         .with_guarded_secret_sync(|secret| secret.ct_eq(b"correct horse battery staple"))
//!         .await?;
//!     println!("password matches: {}", matches);
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

mod buffer;
mod config;
mod error;
mod guard;
mod manager;
mod memcall;
mod pool;
mod process;
mod protocol;
mod registry;
pub mod signals;
mod source;
mod transport;
mod worker;

pub use buffer::PlaintextBuffer;
pub use config::{
    ManagerConfig, WorkerConfig, DEFAULT_KEY_BITS, DEFAULT_MAX_FRAME_SIZE, DEFAULT_POOL_CAPACITY,
    DEFAULT_SHUTDOWN_GRACE,
};
pub use error::{ErrorKind, Result, SecretError};
pub use guard::GuardedAccessor;
pub use manager::{ManagerState, SecretManager, MIN_KEY_BITS};
pub use memcall::{disable_core_dumps, MemcallError};
pub use pool::ProtectedPool;
pub use process::ProcessManager;
pub use protocol::{RequestKind, ResponseData};
pub use registry::BufferRegistry;
pub use source::{SecretSource, TerminalSource, MAX_SECRET_LEN};
pub use transport::FdWriter;
pub use worker::Worker;

#[cfg(test)]
use ctor::ctor;

#[cfg(test)]
#[ctor]
fn test_init() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .is_test(true)
        .try_init();
}
