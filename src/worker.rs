//! The isolated side of the process boundary.
//!
//! A [`Worker`] owns the only [`SecretManager`] in its process and serves requests read
//! from a frame channel, one at a time, until it is told to stop or the channel closes.

use crate::buffer::PlaintextBuffer;
use crate::config::WorkerConfig;
use crate::error::{Result, SecretError};
use crate::manager::SecretManager;
use crate::pool::ProtectedPool;
use crate::protocol::{self, IncomingRequest, RequestKind, ResultPayload};
use crate::source::SecretSource;
use crate::transport::{Frame, FrameReader, FrameWriter};
use log::{debug, error, info, warn};
use serde_json::{json, Map, Value};
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite};
use zeroize::Zeroizing;

/// What a handler produced for the manager side.
enum Reply {
    Empty,
    Json(Value),
    Secret(PlaintextBuffer),
}

type Handler<R, W> = fn(&mut Worker<R, W>, &Map<String, Value>) -> Result<Reply>;

pub struct Worker<R, W> {
    manager: SecretManager,
    source: Box<dyn SecretSource>,
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    shutting_down: bool,
}

impl<R, W> Worker<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Acquires the protected pool and sets up a manager serving `reader`/`writer`.
    ///
    /// # Errors
    ///
    /// * `SecretError::Allocation` - the pool could not be mapped, or could not be locked
    ///   while `strict_locking` is set
    /// * `SecretError::Validation` - the configured key size is too small
    pub fn new(
        config: &WorkerConfig,
        source: Box<dyn SecretSource>,
        reader: R,
        writer: W,
    ) -> Result<Self> {
        let pool = ProtectedPool::acquire(config.pool_capacity, config.strict_locking)?;
        let manager = SecretManager::new(pool, config.key_bits)?;
        info!(
            "worker: ready ({}-bit keys, protected memory locked: {})",
            config.key_bits,
            manager.is_protected_memory_in_use()
        );
        Ok(Self {
            manager,
            source,
            reader: FrameReader::new(reader, config.max_frame_size),
            writer: FrameWriter::new(writer),
            shutting_down: false,
        })
    }

    fn handler(kind: RequestKind) -> Handler<R, W> {
        match kind {
            RequestKind::GenerateKeyPair => Self::generate_key_pair,
            RequestKind::CheckProtectedMemoryEnabled => Self::check_protected_memory_enabled,
            RequestKind::ReadInSecret => Self::read_in_secret,
            RequestKind::VerifyAllocation => Self::verify_allocation,
            RequestKind::GetDecryptedSecret => Self::get_decrypted_secret,
        }
    }

    fn generate_key_pair(&mut self, _: &Map<String, Value>) -> Result<Reply> {
        self.manager.generate_key_pair()?;
        self.manager.verify_allocation()?;
        Ok(Reply::Json(json!({ "allocationVerified": true })))
    }

    fn check_protected_memory_enabled(&mut self, _: &Map<String, Value>) -> Result<Reply> {
        Ok(Reply::Json(json!({
            "protectedMemoryInUse": self.manager.is_protected_memory_in_use()
        })))
    }

    fn read_in_secret(&mut self, params: &Map<String, Value>) -> Result<Reply> {
        let prompt = match params.get("promptString") {
            Some(Value::String(prompt)) => prompt,
            Some(_) => return Err(SecretError::Validation("promptString must be a string".into())),
            None => return Err(SecretError::Validation("promptString is required".into())),
        };
        let mut secret = Zeroizing::new(self.source.read_secret(prompt)?);
        self.manager.encrypt(&mut secret)?;
        Ok(Reply::Empty)
    }

    fn verify_allocation(&mut self, _: &Map<String, Value>) -> Result<Reply> {
        self.manager.verify_allocation()?;
        Ok(Reply::Json(json!({ "allocationVerified": true })))
    }

    fn get_decrypted_secret(&mut self, _: &Map<String, Value>) -> Result<Reply> {
        Ok(Reply::Secret(self.manager.decrypt()?))
    }

    fn dispatch(&mut self, request: &IncomingRequest) -> Result<Reply> {
        let kind: RequestKind = request.kind.parse()?;
        if self.shutting_down {
            return Err(SecretError::Lifecycle(format!(
                "worker is shutting down; {} rejected",
                kind
            )));
        }
        Self::handler(kind)(self, &request.params)
    }

    /// Handles one request frame and writes its response.
    ///
    /// Only a failure to deliver the response is returned; request failures travel back
    /// to the manager as `:error` responses.
    pub async fn handle_frame(&mut self, frame: &[u8]) -> Result<()> {
        let request = match protocol::decode_request(frame) {
            Ok(request) => request,
            Err(e) => {
                warn!("worker: discarding malformed request: {}", e);
                return Ok(());
            }
        };
        debug!("worker: {} request {}", request.kind, request.id);

        match self.dispatch(&request) {
            Ok(Reply::Secret(buffer)) => {
                let sent = self.send_secret(&request, &buffer).await;
                // The manager side now holds its own copy; this one is wiped only after
                // the write has been flushed.
                self.manager.release(&buffer);
                sent
            }
            Ok(Reply::Empty) => {
                let frame =
                    protocol::encode_result(&request.kind, request.id, ResultPayload::None)?;
                self.writer.send(frame).await
            }
            Ok(Reply::Json(value)) => {
                let payload = ResultPayload::Json(value);
                let frame = protocol::encode_result(&request.kind, request.id, payload)?;
                self.writer.send(frame).await
            }
            Err(err) => {
                debug!("worker: {} request {} failed: {}", request.kind, request.id, err);
                let frame = protocol::encode_error(&request.kind, request.id, &err)?;
                self.writer.send(frame).await
            }
        }
    }

    async fn send_secret(
        &mut self,
        request: &IncomingRequest,
        buffer: &PlaintextBuffer,
    ) -> Result<()> {
        let payload = ResultPayload::Buffer(buffer);
        let frame: Frame = protocol::encode_result(&request.kind, request.id, payload)?;
        self.writer.send(frame).await
    }

    /// Serves requests until `stop` completes or the request channel ends, then shuts
    /// down.
    ///
    /// # Errors
    ///
    /// * `SecretError::Transport` - the channel failed while reading or replying
    pub async fn run<S>(mut self, stop: S) -> Result<()>
    where
        S: Future<Output = i32>,
    {
        tokio::pin!(stop);
        let outcome = loop {
            tokio::select! {
                sig = &mut stop => {
                    info!("worker: signal {} received", sig);
                    break Ok(());
                }
                frame = self.reader.next_frame() => match frame {
                    Ok(Some(frame)) => {
                        if let Err(e) = self.handle_frame(&frame).await {
                            error!("worker: failed to deliver response: {}", e);
                            break Err(e);
                        }
                    }
                    Ok(None) => {
                        info!("worker: request channel closed");
                        break Ok(());
                    }
                    Err(e) => {
                        error!("worker: request channel failed: {}", e);
                        break Err(e);
                    }
                },
            }
        };
        self.shutdown().await;
        outcome
    }

    /// Stops serving: every later request fails with `LifecycleError`, and all sensitive
    /// state is wiped.
    pub async fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        self.manager.shutdown();
        if let Err(e) = self.writer.close().await {
            debug!("worker: response channel already closed: {}", e);
        }
        info!("worker: shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_envelope, encode_request, Outcome, ResponseData};
    use std::time::Duration;
    use tokio::io::{duplex, DuplexStream};

    struct FixedSource(Vec<u8>);

    impl SecretSource for FixedSource {
        fn read_secret(&mut self, _prompt: &str) -> Result<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    struct Harness {
        worker: Worker<DuplexStream, DuplexStream>,
        requests: FrameWriter<DuplexStream>,
        responses: FrameReader<DuplexStream>,
    }

    fn harness() -> Harness {
        let config = WorkerConfig::new().with_key_bits(1024).with_pool_capacity(8192);
        let (request_tx, request_rx) = duplex(64 * 1024);
        let (response_tx, response_rx) = duplex(64 * 1024);
        let worker = Worker::new(
            &config,
            Box::new(FixedSource(b"open sesame".to_vec())),
            request_rx,
            response_tx,
        )
        .expect("worker");
        Harness {
            worker,
            requests: FrameWriter::new(request_tx),
            responses: FrameReader::new(response_rx, 64 * 1024),
        }
    }

    impl Harness {
        async fn call(&mut self, kind: RequestKind, id: u64, params: Value) -> Frame {
            let frame = encode_request(kind, id, &params).expect("encode");
            self.worker.handle_frame(&frame).await.expect("handle");
            self.responses.next_frame().await.expect("read").expect("response")
        }
    }

    #[tokio::test]
    async fn serves_the_full_lifecycle() {
        let mut h = harness();

        let frame = h.call(RequestKind::GenerateKeyPair, 1, Value::Null).await;
        let envelope = decode_envelope(&frame).expect("envelope");
        assert_eq!(envelope.outcome(), Some(("generateKeyPair", Outcome::Result)));
        assert!(envelope.decode_data().expect("data").flag("allocationVerified").expect("flag"));

        let frame = h
            .call(RequestKind::ReadInSecret, 2, json!({"promptString": "Secret: "}))
            .await;
        assert_eq!(&frame[..], br#"{"type":"readInSecret:result","id":2}"#);

        let frame = h.call(RequestKind::GetDecryptedSecret, 3, Value::Null).await;
        let envelope = decode_envelope(&frame).expect("envelope");
        assert_eq!(envelope.id, 3);
        match envelope.decode_data().expect("data") {
            ResponseData::Bytes(bytes) => assert_eq!(bytes.raw_snapshot(), b"open sesame".to_vec()),
            other => panic!("expected bytes, got {:?}", other),
        }
        assert_eq!(h.worker.manager.live_buffers(), 0, "worker copy must be released after send");
    }

    #[tokio::test]
    async fn secrets_reach_a_descriptor_without_buffering() {
        use crate::transport::FdWriter;
        use std::os::fd::OwnedFd;
        use std::os::unix::net::UnixStream;

        let config = WorkerConfig::new().with_key_bits(1024).with_pool_capacity(8192);
        let (ours, theirs) = UnixStream::pair().expect("socket pair");
        theirs.set_nonblocking(true).expect("nonblocking");
        let theirs = tokio::net::UnixStream::from_std(theirs).expect("register");
        let (_request_tx, request_rx) = duplex(1024);
        let mut worker = Worker::new(
            &config,
            Box::new(FixedSource(vec![200, 201, 202, 203])),
            request_rx,
            FdWriter::from_fd(OwnedFd::from(ours)).expect("writer"),
        )
        .expect("worker");
        let mut responses = FrameReader::new(theirs, 64 * 1024);

        for (id, kind, params) in [
            (1, RequestKind::GenerateKeyPair, Value::Null),
            (2, RequestKind::ReadInSecret, json!({"promptString": "Secret: "})),
            (3, RequestKind::GetDecryptedSecret, Value::Null),
        ] {
            let frame = encode_request(kind, id, &params).expect("encode");
            worker.handle_frame(&frame).await.expect("handle");
        }

        for id in 1..=2 {
            let frame = responses.next_frame().await.expect("read").expect("response");
            assert_eq!(decode_envelope(&frame).expect("envelope").id, id);
        }
        let frame = responses.next_frame().await.expect("read").expect("response");
        match decode_envelope(&frame).expect("envelope").decode_data().expect("data") {
            ResponseData::Bytes(bytes) => {
                assert_eq!(bytes.raw_snapshot(), vec![200, 201, 202, 203])
            }
            other => panic!("expected bytes, got {:?}", other),
        }
        assert_eq!(worker.manager.live_buffers(), 0);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn failures_come_back_as_error_responses() {
        let mut h = harness();

        let frame = h.call(RequestKind::VerifyAllocation, 10, Value::Null).await;
        let envelope = decode_envelope(&frame).expect("envelope");
        assert_eq!(envelope.outcome(), Some(("verifyAllocation", Outcome::Error)));
        assert!(matches!(envelope.into_error(), SecretError::Allocation(_)));

        let frame = h
            .call(RequestKind::ReadInSecret, 11, json!({"promptString": 42}))
            .await;
        let envelope = decode_envelope(&frame).expect("envelope");
        assert!(matches!(envelope.into_error(), SecretError::Validation(_)));
    }

    #[tokio::test]
    async fn unknown_types_are_rejected_by_name() {
        let mut h = harness();
        h.worker
            .handle_frame(br#"{"type":"dumpKeys","id":5}"#)
            .await
            .expect("handle");
        let frame = h.responses.next_frame().await.expect("read").expect("response");
        let envelope = decode_envelope(&frame).expect("envelope");
        assert_eq!(envelope.outcome(), Some(("dumpKeys", Outcome::Error)));
        assert!(matches!(envelope.into_error(), SecretError::Validation(_)));
    }

    #[tokio::test]
    async fn malformed_frames_get_no_response() {
        let mut h = harness();
        h.worker.handle_frame(b"not json").await.expect("handle");
        let next = tokio::time::timeout(Duration::from_millis(20), h.responses.next_frame()).await;
        assert!(next.is_err(), "no response expected");
    }

    #[tokio::test]
    async fn requests_after_shutdown_fail_with_lifecycle() {
        let mut h = harness();
        h.worker.shutting_down = true;
        let request = decode_request_for(RequestKind::CheckProtectedMemoryEnabled);
        assert!(matches!(h.worker.dispatch(&request), Err(SecretError::Lifecycle(_))));
    }

    fn decode_request_for(kind: RequestKind) -> IncomingRequest {
        let frame = encode_request(kind, 1, &Value::Null).expect("encode");
        protocol::decode_request(&frame).expect("decode")
    }

    #[tokio::test]
    async fn run_stops_when_requests_end() {
        let Harness {
            worker,
            requests,
            mut responses,
        } = harness();
        drop(requests);
        worker.run(std::future::pending()).await.expect("run");
        assert!(responses.next_frame().await.expect("read").is_none());
    }

    #[tokio::test]
    async fn run_stops_on_signal() {
        let Harness {
            worker,
            requests: _requests,
            mut responses,
        } = harness();
        worker.run(async { 15 }).await.expect("run");
        assert!(responses.next_frame().await.expect("read").is_none());
    }
}
