//! Newline-delimited framing over a byte stream.
//!
//! Frames may carry plaintext, so neither side relies on growable or library-owned
//! buffers: the reader assembles frames in one fixed-size allocation that it wipes as it
//! goes, and every frame handed out or written is wiped when dropped. The worker writes
//! its responses through [`FdWriter`], which hands each frame to the kernel without an
//! intermediate copy.

use crate::error::{Result, SecretError};
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Interest};
use zeroize::{Zeroize, Zeroizing};

pub type Frame = Zeroizing<Vec<u8>>;

const DELIMITER: u8 = b'\n';

/// Reads frames from `R` into a fixed, zero-on-drop buffer.
pub struct FrameReader<R> {
    inner: R,
    buf: Zeroizing<Vec<u8>>,
    filled: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            // One extra byte for the delimiter of a maximum-size frame.
            buf: Zeroizing::new(vec![0; max_frame_size + 1]),
            filled: 0,
        }
    }

    /// Next complete frame, or `None` on a clean end of stream.
    ///
    /// # Errors
    ///
    /// * `SecretError::Transport` - the stream failed, ended mid-frame, or a frame
    ///   exceeded the configured maximum
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.buf[scanned..self.filled]
                .iter()
                .position(|&b| b == DELIMITER)
                .map(|p| p + scanned)
            {
                return Ok(Some(self.take_frame(pos)));
            }
            scanned = self.filled;

            if self.filled == self.buf.len() {
                self.discard();
                return Err(SecretError::Transport(format!(
                    "frame exceeds {} bytes",
                    self.buf.len() - 1
                )));
            }

            let read = self.inner.read(&mut self.buf[self.filled..]).await?;
            if read == 0 {
                if self.filled == 0 {
                    return Ok(None);
                }
                self.discard();
                return Err(SecretError::Transport("stream ended mid-frame".into()));
            }
            self.filled += read;
        }
    }

    fn take_frame(&mut self, pos: usize) -> Frame {
        let mut frame = Zeroizing::new(Vec::with_capacity(pos));
        frame.extend_from_slice(&self.buf[..pos]);

        let rest = self.filled - (pos + 1);
        self.buf.copy_within(pos + 1..self.filled, 0);
        self.buf[rest..self.filled].zeroize();
        self.filled = rest;
        frame
    }

    fn discard(&mut self) {
        self.buf[..self.filled].zeroize();
        self.filled = 0;
    }
}

/// Writes frames to `W`, flushing after each one.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes `frame` followed by the delimiter and flushes. When this returns `Ok`, the
    /// bytes have left this process; the frame is wiped either way.
    pub async fn send(&mut self, frame: Frame) -> Result<()> {
        if frame.contains(&DELIMITER) {
            return Err(SecretError::Transport("frame contains a raw delimiter".into()));
        }
        self.inner.write_all(&frame).await?;
        self.inner.write_all(&[DELIMITER]).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Unbuffered writer over a file descriptor.
///
/// Every `poll_write` is one `write(2)` from the caller's slice. Pipes and sockets are
/// driven by the reactor; anything else (terminals, regular files, `/dev/null`) is
/// written synchronously.
pub struct FdWriter {
    inner: FdOutput,
}

enum FdOutput {
    Polled(AsyncFd<File>),
    Direct(File),
}

impl FdWriter {
    /// Writer over a duplicate of standard output. Must be called inside a runtime.
    ///
    /// # Errors
    ///
    /// * `SecretError::Transport` - the descriptor could not be duplicated or registered
    pub fn stdout() -> Result<Self> {
        let fd = io::stdout().as_fd().try_clone_to_owned()?;
        Self::from_fd(fd)
    }

    /// Takes ownership of `fd`. Pipes and sockets are switched to non-blocking mode.
    ///
    /// # Errors
    ///
    /// * `SecretError::Transport` - the descriptor could not be inspected or registered
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        let file = File::from(fd);
        let file_type = file.metadata()?.file_type();
        if !(file_type.is_fifo() || file_type.is_socket()) {
            return Ok(Self {
                inner: FdOutput::Direct(file),
            });
        }
        set_nonblocking(&file)?;
        Ok(Self {
            inner: FdOutput::Polled(AsyncFd::with_interest(file, Interest::WRITABLE)?),
        })
    }

    pub fn is_polled(&self) -> bool {
        matches!(self.inner, FdOutput::Polled(_))
    }
}

fn set_nonblocking(file: &File) -> io::Result<()> {
    let fd = file.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl AsyncWrite for FdWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            FdOutput::Direct(file) => Poll::Ready(file.write(buf)),
            FdOutput::Polled(fd) => loop {
                let mut guard = ready!(fd.poll_write_ready(cx))?;
                match guard.try_io(|inner| {
                    let mut file = inner.get_ref();
                    file.write(buf)
                }) {
                    Ok(result) => return Poll::Ready(result),
                    Err(_would_block) => continue,
                }
            },
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
