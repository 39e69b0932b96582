//! Where the worker's secret comes from.

use crate::error::{Result, SecretError};
use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use zeroize::{Zeroize, Zeroizing};

/// Longest secret a source will capture.
pub const MAX_SECRET_LEN: usize = 4096;

const DEFAULT_TERMINAL: &str = "/dev/tty";

/// Captures the plaintext that `readInSecret` encrypts.
///
/// Implementations return the captured bytes in a mutable buffer and keep no other copy;
/// the caller takes over sanitizing it.
pub trait SecretSource: Send {
    fn read_secret(&mut self, prompt: &str) -> Result<Vec<u8>>;
}

/// Reads a line from the controlling terminal with echo disabled.
///
/// The worker's standard streams carry the message channel, so the terminal is opened
/// directly rather than through stdin.
#[derive(Debug, Clone)]
pub struct TerminalSource {
    path: PathBuf,
}

impl Default for TerminalSource {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_TERMINAL),
        }
    }
}

impl TerminalSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads from `path` instead of `/dev/tty`.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Restores the saved terminal attributes when dropped.
struct EchoGuard<'a> {
    terminal: &'a File,
    saved: Option<libc::termios>,
}

impl<'a> EchoGuard<'a> {
    fn disable(terminal: &'a File) -> Self {
        let fd = terminal.as_raw_fd();
        let mut attrs = std::mem::MaybeUninit::<libc::termios>::uninit();
        if unsafe { libc::tcgetattr(fd, attrs.as_mut_ptr()) } != 0 {
            // Not a terminal (a pipe in tests, for instance); nothing to restore.
            debug!("source: input is not a terminal, echo left unchanged");
            return Self { terminal, saved: None };
        }
        let saved = unsafe { attrs.assume_init() };
        let mut silent = saved;
        silent.c_lflag &= !(libc::ECHO | libc::ECHONL);
        if unsafe { libc::tcsetattr(fd, libc::TCSAFLUSH, &silent) } != 0 {
            warn!("source: could not disable terminal echo");
        }
        Self {
            terminal,
            saved: Some(saved),
        }
    }
}

impl Drop for EchoGuard<'_> {
    fn drop(&mut self) {
        if let Some(saved) = &self.saved {
            if unsafe { libc::tcsetattr(self.terminal.as_raw_fd(), libc::TCSAFLUSH, saved) } != 0 {
                warn!("source: could not restore terminal attributes");
            }
        }
    }
}

/// Reads bytes up to a line ending into storage sized once, so it never reallocates.
fn read_line(input: &mut impl Read) -> Result<Vec<u8>> {
    let mut line = Zeroizing::new(Vec::with_capacity(MAX_SECRET_LEN));
    let mut byte = [0_u8; 1];
    loop {
        let read = match input.read(&mut byte) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                byte.zeroize();
                return Err(e.into());
            }
        };
        if read == 0 || byte[0] == b'\n' || byte[0] == b'\r' {
            break;
        }
        if line.len() == MAX_SECRET_LEN {
            byte.zeroize();
            return Err(SecretError::Validation(format!(
                "secret is longer than {} bytes",
                MAX_SECRET_LEN
            )));
        }
        line.push(byte[0]);
    }
    byte.zeroize();
    Ok(std::mem::take(&mut *line))
}

impl SecretSource for TerminalSource {
    fn read_secret(&mut self, prompt: &str) -> Result<Vec<u8>> {
        let mut terminal = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| {
                SecretError::Validation(format!(
                    "no terminal available at {} for secret input: {}",
                    self.path.display(),
                    e
                ))
            })?;
        terminal.write_all(prompt.as_bytes())?;
        terminal.flush()?;

        let secret = {
            let _echo = EchoGuard::disable(&terminal);
            read_line(&mut &terminal)
        };
        // The newline typed by the user was not echoed.
        terminal.write_all(b"\n")?;
        secret
    }
}
