use crate::error::{Result, SecretError};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default RSA modulus size for the worker's key pair.
pub const DEFAULT_KEY_BITS: usize = 2048;
/// Default size of the protected pool; one PKCS#8 RSA-4096 key fits with room to spare.
pub const DEFAULT_POOL_CAPACITY: usize = 16 * 1024;
/// Default upper bound on a single message frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;
/// Default time the worker is given to exit after the termination signal.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub const ENV_KEY_BITS: &str = "MEMVAULT_KEY_BITS";
pub const ENV_POOL_CAPACITY: &str = "MEMVAULT_POOL_CAPACITY";
pub const ENV_STRICT_LOCKING: &str = "MEMVAULT_STRICT_LOCKING";
pub const ENV_MAX_FRAME_SIZE: &str = "MEMVAULT_MAX_FRAME_SIZE";
pub const ENV_WORKER: &str = "MEMVAULT_WORKER";
pub const ENV_SHUTDOWN_GRACE_MS: &str = "MEMVAULT_SHUTDOWN_GRACE_MS";

/// Name of the worker executable looked up next to the current binary.
pub const WORKER_BINARY: &str = "memvault-worker";

fn env_override<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| {
                SecretError::Validation(format!("{} has an invalid value: {:?}", name, raw))
            }),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(env::VarError::NotUnicode(_)) => Err(SecretError::Validation(format!(
            "{} is not valid unicode",
            name
        ))),
    }
}

/// Settings for the isolated worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// RSA modulus size in bits
    pub key_bits: usize,

    /// Bytes of protected memory reserved at start
    pub pool_capacity: usize,

    /// Refuse to start when the pool cannot be locked into RAM
    pub strict_locking: bool,

    /// Largest accepted request frame
    pub max_frame_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            key_bits: DEFAULT_KEY_BITS,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            strict_locking: false,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by any `MEMVAULT_*` variables present in the environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(bits) = env_override(ENV_KEY_BITS)? {
            config.key_bits = bits;
        }
        if let Some(capacity) = env_override(ENV_POOL_CAPACITY)? {
            config.pool_capacity = capacity;
        }
        if let Some(strict) = env_override(ENV_STRICT_LOCKING)? {
            config.strict_locking = strict;
        }
        if let Some(size) = env_override(ENV_MAX_FRAME_SIZE)? {
            config.max_frame_size = size;
        }
        Ok(config)
    }

    pub fn with_key_bits(mut self, bits: usize) -> Self {
        self.key_bits = bits;
        self
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    pub fn with_strict_locking(mut self, strict: bool) -> Self {
        self.strict_locking = strict;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// The environment a spawned worker needs to reproduce this configuration.
    pub fn to_env(&self) -> Vec<(&'static str, String)> {
        vec![
            (ENV_KEY_BITS, self.key_bits.to_string()),
            (ENV_POOL_CAPACITY, self.pool_capacity.to_string()),
            (ENV_STRICT_LOCKING, self.strict_locking.to_string()),
            (ENV_MAX_FRAME_SIZE, self.max_frame_size.to_string()),
        ]
    }
}

/// Settings for the supervising side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Worker executable; `None` resolves `memvault-worker` next to the current binary
    pub worker_path: Option<PathBuf>,

    /// How long to wait for a voluntary exit before killing the worker
    pub shutdown_grace: Duration,

    /// Largest accepted response frame
    pub max_frame_size: usize,

    /// Forwarded to the worker through its environment
    pub worker: WorkerConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            worker_path: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            worker: WorkerConfig::default(),
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_env() -> Result<Self> {
        let mut config = Self {
            worker: WorkerConfig::from_env()?,
            ..Self::default()
        };
        if let Some(path) = env::var_os(ENV_WORKER) {
            config.worker_path = Some(PathBuf::from(path));
        }
        if let Some(ms) = env_override::<u64>(ENV_SHUTDOWN_GRACE_MS)? {
            config.shutdown_grace = Duration::from_millis(ms);
        }
        if let Some(size) = env_override(ENV_MAX_FRAME_SIZE)? {
            config.max_frame_size = size;
        }
        Ok(config)
    }

    pub fn with_worker_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.worker_path = Some(path.into());
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_worker_config(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    /// Resolves the worker executable.
    pub fn resolve_worker_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.worker_path {
            return Ok(path.clone());
        }
        let current = env::current_exe().map_err(|e| {
            SecretError::Validation(format!("cannot locate current executable: {}", e))
        })?;
        let dir = current.parent().ok_or_else(|| {
            SecretError::Validation("current executable has no parent directory".into())
        })?;
        Ok(dir.join(WORKER_BINARY))
    }
}
