//! Termination-signal handling for both sides of the process boundary.

use crate::error::{Result, SecretError};
use log::{debug, error, info};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use std::thread;
use tokio::sync::watch;

/// Signals that start the graceful-shutdown sequence.
pub const TERMINATION_SIGNALS: [i32; 3] = [SIGINT, SIGTERM, SIGHUP];

/// Receives the first of a set of signals on a background thread.
///
/// While a listener is alive the default action of its signals (terminating the process)
/// is suppressed; the owner is expected to shut down in an orderly way instead. Dropping
/// the listener stops the background thread.
pub struct TerminationListener {
    rx: watch::Receiver<Option<i32>>,
    handle: Handle,
}

/// Starts listening for `signals_to_catch`.
///
/// # Errors
///
/// * `SecretError::Lifecycle` - the signal handlers could not be registered
///
/// # Examples
///
/// ```rust,no_run
/// use memvault::signals::{listen, TERMINATION_SIGNALS};
///
/// # async fn run() -> memvault::Result<()> {
/// let mut listener = listen(&TERMINATION_SIGNALS)?;
/// let signal = listener.recv().await;
/// println!("caught signal {}", signal);
/// # Ok(())
/// # }
/// ```
pub fn listen(signals_to_catch: &[i32]) -> Result<TerminationListener> {
    let mut signals = Signals::new(signals_to_catch).map_err(|e| {
        error!("failed to create signal iterator: {}", e);
        SecretError::Lifecycle(format!("failed to register signal handler: {}", e))
    })?;
    let handle = signals.handle();
    let (tx, rx) = watch::channel(None);

    thread::spawn(move || {
        match signals.forever().next() {
            Some(sig) => {
                info!("caught signal {}, starting shutdown", sig);
                tx.send_replace(Some(sig));
            }
            None => debug!("signal listener closed"),
        }
    });
    info!("registered termination handler for signals {:?}", signals_to_catch);
    Ok(TerminationListener { rx, handle })
}

impl TerminationListener {
    /// Waits for the first caught signal and returns its number.
    ///
    /// Never completes if the listener thread ends without seeing a signal.
    pub async fn recv(&mut self) -> i32 {
        loop {
            if let Some(sig) = *self.rx.borrow_and_update() {
                return sig;
            }
            if self.rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }

    /// The signal caught so far, if any.
    pub fn caught(&self) -> Option<i32> {
        *self.rx.borrow()
    }
}

impl Drop for TerminationListener {
    fn drop(&mut self) {
        self.handle.close();
    }
}
