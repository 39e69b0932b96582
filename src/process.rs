//! The supervising side of the process boundary.
//!
//! A [`ProcessManager`] owns the channel to one worker. Requests are correlated with
//! their responses by id through a table of pending requests; a background task reads
//! responses and settles whichever request each one names. Any number of requests may
//! be in flight, and they may complete in any order.

use crate::buffer::PlaintextBuffer;
use crate::config::ManagerConfig;
use crate::error::{Result, SecretError};
use crate::guard::{self, GuardedAccessor};
use crate::protocol::{self, Envelope, Outcome, RequestKind, ResponseData};
use crate::registry::BufferRegistry;
use crate::signals::{self, TERMINATION_SIGNALS};
use crate::transport::{Frame, FrameReader, FrameWriter};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Settlement = oneshot::Sender<Result<ResponseData>>;

struct PendingRequest {
    kind: RequestKind,
    settle: Settlement,
}

/// Requests awaiting a response, keyed by correlation id.
#[derive(Default)]
struct PendingTable {
    entries: HashMap<u64, PendingRequest>,
    closed: Option<ClosedBy>,
}

/// Why the table stopped accepting requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClosedBy {
    Shutdown,
    ChannelClosed,
}

impl ClosedBy {
    fn to_error(self) -> SecretError {
        match self {
            ClosedBy::Shutdown => {
                SecretError::Lifecycle("process manager has been shut down".into())
            }
            ClosedBy::ChannelClosed => SecretError::Transport("worker channel closed".into()),
        }
    }
}

impl PendingTable {
    fn insert(&mut self, id: u64, request: PendingRequest) -> Result<()> {
        if let Some(origin) = self.closed {
            return Err(origin.to_error());
        }
        self.entries.insert(id, request);
        Ok(())
    }

    /// Rejects every outstanding request and refuses new ones. Returns how many were rejected.
    fn close(&mut self, origin: ClosedBy) -> usize {
        if self.closed.is_none() {
            self.closed = Some(origin);
        }
        let rejected = self.entries.len();
        for (_, pending) in self.entries.drain() {
            let _ = pending.settle.send(Err(origin.to_error()));
        }
        rejected
    }
}

/// Supervises one worker process and multiplexes requests to it.
///
/// # Examples
///
/// ```rust,no_run
/// use memvault::{ManagerConfig, ProcessManager};
/// use sha2::{Digest, Sha256};
///
/// # async fn run() -> memvault::Result<()> {
/// let manager = ProcessManager::spawn(&ManagerConfig::from_env()?)?;
/// assert!(manager.generate_key_pair().await?);
/// manager.read_in_secret("Password: ").await?;
///
/// let digest = manager
///     .with_guarded_secret(|secret| async move {
///         let mut hasher = Sha256::new();
///         secret.update_digest(&mut hasher)?;
///         Ok::<_, memvault::SecretError>(hasher.finalize())
///     })
///     .await?;
/// # let _ = digest;
/// manager.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct ProcessManager {
    next_id: AtomicU64,
    pending: Arc<Mutex<PendingTable>>,
    registry: Arc<Mutex<BufferRegistry>>,
    writer: tokio::sync::Mutex<FrameWriter<BoxedWriter>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    child: tokio::sync::Mutex<Option<Child>>,
    shutdown_grace: Duration,
    shut_down: AtomicBool,
}

impl ProcessManager {
    /// Starts the worker executable and connects to its standard streams.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// * `SecretError::Transport` - the worker could not be started
    /// * `SecretError::Validation` - the worker path could not be resolved
    pub fn spawn(config: &ManagerConfig) -> Result<Self> {
        let path = config.resolve_worker_path()?;
        let mut child = Command::new(&path)
            .envs(config.worker.to_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SecretError::Transport(format!("cannot start worker {}: {}", path.display(), e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SecretError::Transport("worker stdin is not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SecretError::Transport("worker stdout is not piped".into()))?;
        info!("started worker {} (pid {:?})", path.display(), child.id());

        Ok(Self::with_channel(
            Box::new(stdout),
            Box::new(stdin),
            config,
            Some(child),
        ))
    }

    /// Connects to a worker reachable through an already-established channel, such as
    /// one running in-process over [`tokio::io::duplex`].
    ///
    /// Shutdown closes the channel and waits for it to drain instead of signalling a
    /// process.
    pub fn connect<R, W>(reader: R, writer: W, config: &ManagerConfig) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_channel(Box::new(reader), Box::new(writer), config, None)
    }

    fn with_channel(
        reader: BoxedReader,
        writer: BoxedWriter,
        config: &ManagerConfig,
        child: Option<Child>,
    ) -> Self {
        let pending = Arc::new(Mutex::new(PendingTable::default()));
        let registry = Arc::new(Mutex::new(BufferRegistry::new()));
        let reader_task = tokio::spawn(read_responses(
            FrameReader::new(reader, config.max_frame_size),
            pending.clone(),
            registry.clone(),
        ));
        Self {
            next_id: AtomicU64::new(1),
            pending,
            registry,
            writer: tokio::sync::Mutex::new(FrameWriter::new(writer)),
            reader_task: Mutex::new(Some(reader_task)),
            child: tokio::sync::Mutex::new(child),
            shutdown_grace: config.shutdown_grace,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Number of requests sent and not yet settled.
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().entries.len()
    }

    /// Number of secret copies received from the worker and not yet sanitized.
    pub fn live_buffers(&self) -> usize {
        self.registry.lock().len()
    }

    /// Sends a request of type `kind` and waits for the response bearing its id.
    ///
    /// A byte-buffer result is tracked by this manager until it is passed to
    /// [`release`](Self::release) or the manager shuts down.
    ///
    /// # Errors
    ///
    /// * `SecretError::Validation` - `kind` is not a known request type (nothing is sent),
    ///   or `params` is not an object
    /// * `SecretError::Lifecycle` - the manager has been shut down, before or while waiting
    /// * `SecretError::Transport` - the request could not be delivered, or the channel
    ///   closed before a response arrived
    /// * any error raised by the worker, re-raised with its original kind and message
    pub async fn request(&self, kind: &str, params: Value) -> Result<ResponseData> {
        let kind: RequestKind = kind.parse()?;
        self.send(kind, params).await
    }

    async fn send(&self, kind: RequestKind, params: Value) -> Result<ResponseData> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ClosedBy::Shutdown.to_error());
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = protocol::encode_request(kind, id, &params)?;

        let (settle, settled) = oneshot::channel();
        self.pending.lock().insert(id, PendingRequest { kind, settle })?;
        debug!("sending {} request {}", kind, id);

        let sent = self.writer.lock().await.send(frame).await;
        if let Err(e) = sent {
            self.pending.lock().entries.remove(&id);
            return Err(e);
        }

        match settled.await {
            Ok(result) => result,
            // The table was dropped without settling this entry.
            Err(_) => Err(SecretError::Lifecycle(format!("{} request {} was abandoned", kind, id))),
        }
    }

    /// Generates the worker's key pair. Returns whether the allocation was verified.
    pub async fn generate_key_pair(&self) -> Result<bool> {
        self.send(RequestKind::GenerateKeyPair, Value::Null)
            .await?
            .flag("allocationVerified")
    }

    /// Whether the worker's key material sits in locked memory.
    pub async fn check_protected_memory_enabled(&self) -> Result<bool> {
        self.send(RequestKind::CheckProtectedMemoryEnabled, Value::Null)
            .await?
            .flag("protectedMemoryInUse")
    }

    /// Has the worker capture a secret through its input source and encrypt it.
    pub async fn read_in_secret(&self, prompt: &str) -> Result<()> {
        self.send(RequestKind::ReadInSecret, json!({ "promptString": prompt }))
            .await
            .map(|_| ())
    }

    pub async fn verify_allocation(&self) -> Result<bool> {
        self.send(RequestKind::VerifyAllocation, Value::Null)
            .await?
            .flag("allocationVerified")
    }

    async fn fetch_secret(&self) -> Result<PlaintextBuffer> {
        match self.send(RequestKind::GetDecryptedSecret, Value::Null).await? {
            ResponseData::Bytes(buffer) => Ok(buffer),
            other => Err(SecretError::Transport(format!(
                "expected a byte buffer from getDecryptedSecret, got {:?}",
                other
            ))),
        }
    }

    /// Fetches the decrypted secret and lends it to `callback` through a
    /// [`GuardedAccessor`].
    ///
    /// Once the future returned by `callback` settles, or is dropped, the received copy is
    /// zero-filled and forgotten exactly once, and the callback's result is returned.
    pub async fn with_guarded_secret<F, Fut, T, E>(&self, callback: F) -> std::result::Result<T, E>
    where
        F: FnOnce(GuardedAccessor) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<SecretError>,
    {
        let buffer = self.fetch_secret().await?;
        guard::run_guarded(buffer, self.registry.clone(), callback).await
    }

    /// Like [`with_guarded_secret`](Self::with_guarded_secret) for a callback that does
    /// not suspend.
    pub async fn with_guarded_secret_sync<F, T, E>(&self, callback: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&GuardedAccessor) -> std::result::Result<T, E>,
        E: From<SecretError>,
    {
        let buffer = self.fetch_secret().await?;
        guard::run_guarded_sync(buffer, self.registry.clone(), callback)
    }

    /// Sanitizes and forgets a buffer obtained through [`request`](Self::request).
    pub fn release(&self, buffer: &PlaintextBuffer) -> bool {
        self.registry.lock().release(buffer)
    }

    /// Stops the worker: asks it to exit, waits up to the configured grace period, then
    /// kills it. Every pending request is rejected with `LifecycleError`, and every secret
    /// copy this side still tracks is sanitized. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let rejected = self.pending.lock().close(ClosedBy::Shutdown);
        if rejected > 0 {
            info!("rejected {} pending request(s) on shutdown", rejected);
        }

        let child = self.child.lock().await.take();
        if let Some(pid) = child.as_ref().and_then(Child::id) {
            terminate(pid);
        }
        if let Err(e) = self.writer.lock().await.close().await {
            debug!("worker channel already closed: {}", e);
        }

        match child {
            Some(child) => self.reap(child).await,
            None => self.drain().await,
        }
        if let Some(task) = self.reader_task.lock().take() {
            task.abort();
        }

        let wiped = self.registry.lock().sanitize_all();
        if wiped > 0 {
            info!("sanitized {} outstanding secret copies on shutdown", wiped);
        }
        info!("process manager shut down");
    }

    async fn reap(&self, mut child: Child) {
        match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => info!("worker exited with {}", status),
            Ok(Err(e)) => warn!("failed to wait for worker: {}", e),
            Err(_) => {
                warn!(
                    "worker did not exit within {:?}; killing it",
                    self.shutdown_grace
                );
                if let Err(e) = child.kill().await {
                    error!("failed to kill worker: {}", e);
                }
            }
        }
    }

    async fn drain(&self) {
        let task = self.reader_task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(self.shutdown_grace, &mut task).await.is_err() {
                warn!("worker channel did not close within {:?}", self.shutdown_grace);
                task.abort();
            }
        }
    }

    /// Waits for a termination signal, then shuts down. Returns the signal number.
    ///
    /// # Errors
    ///
    /// * `SecretError::Lifecycle` - the signal handlers could not be registered
    pub async fn shutdown_on_signal(&self) -> Result<i32> {
        let mut listener = signals::listen(&TERMINATION_SIGNALS)?;
        let sig = listener.recv().await;
        info!("signal {} received, shutting down worker", sig);
        self.shutdown().await;
        Ok(sig)
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.get_mut().take() {
            task.abort();
        }
        self.pending.lock().close(ClosedBy::Shutdown);
        self.registry.lock().sanitize_all();
        // An un-reaped child is killed by `kill_on_drop`.
    }
}

fn terminate(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        warn!("worker pid {} is out of range", pid);
        return;
    };
    if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
        debug!(
            "could not signal worker {}: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

/// Settles pending requests from response frames until the channel ends.
async fn read_responses(
    mut reader: FrameReader<BoxedReader>,
    pending: Arc<Mutex<PendingTable>>,
    registry: Arc<Mutex<BufferRegistry>>,
) {
    loop {
        match reader.next_frame().await {
            Ok(Some(frame)) => settle(&frame, &pending, &registry),
            Ok(None) => {
                debug!("worker channel reached end of stream");
                break;
            }
            Err(e) => {
                error!("worker channel failed: {}", e);
                break;
            }
        }
    }
    let rejected = pending.lock().close(ClosedBy::ChannelClosed);
    if rejected > 0 {
        warn!("rejected {} pending request(s): worker channel closed", rejected);
    }
}

fn settle(frame: &Frame, pending: &Mutex<PendingTable>, registry: &Mutex<BufferRegistry>) {
    let envelope = match protocol::decode_envelope(frame) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("discarding malformed response: {}", e);
            return;
        }
    };
    let Some(request) = pending.lock().entries.remove(&envelope.id) else {
        warn!(
            "discarding {} response for unknown request {}",
            envelope.kind, envelope.id
        );
        return;
    };
    let result = resolve(envelope, request.kind);
    if let Ok(ResponseData::Bytes(buffer)) = &result {
        registry.lock().register(buffer);
    }
    if let Err(Ok(ResponseData::Bytes(buffer))) = request.settle.send(result) {
        // Nobody is waiting any more.
        registry.lock().release(&buffer);
    }
}

fn resolve(envelope: Envelope<'_>, expected: RequestKind) -> Result<ResponseData> {
    let outcome = match envelope.outcome() {
        Some((kind, outcome)) if kind == expected.as_str() => Some(outcome),
        _ => None,
    };
    match outcome {
        Some(Outcome::Result) => envelope.decode_data(),
        Some(Outcome::Error) => Err(envelope.into_error()),
        None => Err(SecretError::Transport(format!(
            "response {} has type {:?}, expected a reply to {}",
            envelope.id, envelope.kind, expected
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_request, encode_error, encode_result, ResultPayload};
    use tokio::io::{duplex, DuplexStream};

    /// The worker end of an in-process channel, driven by hand.
    struct FakeWorker {
        requests: FrameReader<DuplexStream>,
        responses: FrameWriter<DuplexStream>,
    }

    impl FakeWorker {
        async fn next_request(&mut self) -> protocol::IncomingRequest {
            let frame = self.requests.next_frame().await.expect("read").expect("request");
            decode_request(&frame).expect("decode")
        }

        async fn reply(&mut self, frame: Frame) {
            self.responses.send(frame).await.expect("reply");
        }
    }

    fn connected() -> (Arc<ProcessManager>, FakeWorker) {
        let (request_tx, request_rx) = duplex(16 * 1024);
        let (response_tx, response_rx) = duplex(16 * 1024);
        let config = ManagerConfig::new().with_shutdown_grace(Duration::from_millis(200));
        let manager = ProcessManager::connect(response_rx, request_tx, &config);
        let worker = FakeWorker {
            requests: FrameReader::new(request_rx, 16 * 1024),
            responses: FrameWriter::new(response_tx),
        };
        (Arc::new(manager), worker)
    }

    async fn wait_for_pending(manager: &ProcessManager, n: usize) {
        for _ in 0..200 {
            if manager.pending_requests() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} pending requests", n);
    }

    #[tokio::test]
    async fn out_of_order_responses_reach_their_own_request() {
        let (manager, mut worker) = connected();

        let first = tokio::spawn({
            let manager = manager.clone();
            async move { manager.request("verifyAllocation", Value::Null).await }
        });
        let second = tokio::spawn({
            let manager = manager.clone();
            async move { manager.request("checkProtectedMemoryEnabled", Value::Null).await }
        });

        let a = worker.next_request().await;
        let b = worker.next_request().await;
        assert_ne!(a.id, b.id);
        wait_for_pending(&manager, 2).await;

        // Answer in reverse arrival order, each echoing its own id.
        for request in [&b, &a] {
            let frame = encode_result(
                &request.kind,
                request.id,
                ResultPayload::Json(json!({ "id": request.id })),
            )
            .expect("encode");
            worker.reply(frame).await;
        }

        let (verify_id, check_id) = if a.kind == "verifyAllocation" {
            (a.id, b.id)
        } else {
            (b.id, a.id)
        };
        for (handle, id) in [(first, verify_id), (second, check_id)] {
            match handle.await.expect("join").expect("response") {
                ResponseData::Json(value) => assert_eq!(value["id"], json!(id)),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(manager.pending_requests(), 0);
    }

    #[tokio::test]
    async fn unknown_types_never_reach_the_worker() {
        let (manager, mut worker) = connected();
        assert!(matches!(
            manager.request("launchMissiles", Value::Null).await,
            Err(SecretError::Validation(_))
        ));
        assert_eq!(manager.pending_requests(), 0);
        let next =
            tokio::time::timeout(Duration::from_millis(20), worker.requests.next_frame()).await;
        assert!(next.is_err(), "nothing may be sent for an unknown type");
    }

    #[tokio::test]
    async fn worker_errors_are_reraised() {
        let (manager, mut worker) = connected();
        let call = tokio::spawn({
            let manager = manager.clone();
            async move { manager.verify_allocation().await }
        });
        let request = worker.next_request().await;
        let frame = encode_error(
            &request.kind,
            request.id,
            &SecretError::Allocation("usage below baseline".into()),
        )
        .expect("encode");
        worker.reply(frame).await;

        let err = call.await.expect("join").expect_err("must fail");
        assert!(matches!(err, SecretError::Allocation(ref m) if m == "usage below baseline"));
    }

    #[tokio::test]
    async fn responses_for_unknown_ids_are_discarded() {
        let (manager, mut worker) = connected();
        let call = tokio::spawn({
            let manager = manager.clone();
            async move { manager.check_protected_memory_enabled().await }
        });
        let request = worker.next_request().await;

        let stray =
            encode_result(&request.kind, request.id + 1000, ResultPayload::None).expect("encode");
        worker.reply(stray).await;
        let real = encode_result(
            &request.kind,
            request.id,
            ResultPayload::Json(json!({ "protectedMemoryInUse": true })),
        )
        .expect("encode");
        worker.reply(real).await;

        assert!(call.await.expect("join").expect("response"));
    }

    #[tokio::test]
    async fn guarded_secret_is_wiped_after_the_callback() {
        let (manager, mut worker) = connected();
        let original: Vec<u8> = (1..=32).collect();

        let serve = tokio::spawn({
            let original = original.clone();
            async move {
                let request = worker.next_request().await;
                let buffer = PlaintextBuffer::from_vec(original);
                let frame = encode_result(&request.kind, request.id, ResultPayload::Buffer(&buffer))
                    .expect("encode");
                worker.reply(frame).await;
                worker
            }
        });

        let (seen, escaped) = manager
            .with_guarded_secret(|secret| async move {
                let seen = secret.with_bytes(|b| b.to_vec())?;
                Ok::<_, SecretError>((seen, secret))
            })
            .await
            .expect("guarded access");
        assert_eq!(seen, original);
        assert!(escaped.buffer().is_sanitized());
        assert!(escaped.buffer().raw_snapshot().iter().all(|&b| b == 0));
        assert_eq!(manager.live_buffers(), 0);
        serve.await.expect("serve");
    }

    #[tokio::test]
    async fn shutdown_rejects_pending_with_lifecycle() {
        let (manager, mut worker) = connected();
        let call = tokio::spawn({
            let manager = manager.clone();
            async move { manager.verify_allocation().await }
        });
        let _request = worker.next_request().await;
        wait_for_pending(&manager, 1).await;

        // Let the fake worker observe the closed channel and hang up.
        let hang_up = tokio::spawn(async move {
            while let Ok(Some(_)) = worker.requests.next_frame().await {}
            drop(worker.responses);
        });
        manager.shutdown().await;
        manager.shutdown().await;

        assert!(matches!(call.await.expect("join"), Err(SecretError::Lifecycle(_))));
        assert!(matches!(
            manager.generate_key_pair().await,
            Err(SecretError::Lifecycle(_))
        ));
        hang_up.await.expect("hang up");
    }

    #[tokio::test]
    async fn closed_channel_rejects_with_transport() {
        let (manager, mut worker) = connected();
        let call = tokio::spawn({
            let manager = manager.clone();
            async move { manager.verify_allocation().await }
        });
        let _request = worker.next_request().await;
        wait_for_pending(&manager, 1).await;
        drop(worker);

        assert!(matches!(call.await.expect("join"), Err(SecretError::Transport(_))));
        assert!(matches!(
            manager.verify_allocation().await,
            Err(SecretError::Transport(_))
        ));
    }
}
