//! Isolated worker process.
//!
//! Requests arrive on stdin and responses leave on stdout, one JSON object per line.
//! Responses bypass `std`'s stdout buffering so decrypted bytes are never copied out of
//! the wiped frame.
//! Logs go to stderr. Configuration is read from `MEMVAULT_*` environment variables.

use log::{error, warn};
use memvault::signals::{self, TERMINATION_SIGNALS};
use memvault::{disable_core_dumps, FdWriter, TerminalSource, Worker, WorkerConfig};
use std::process::ExitCode;
use std::time::Duration;

// A read parked on stdin would otherwise hold up runtime teardown.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(100);

async fn serve(config: WorkerConfig) -> memvault::Result<()> {
    let mut listener = signals::listen(&TERMINATION_SIGNALS)?;
    let worker = Worker::new(
        &config,
        Box::new(TerminalSource::new()),
        tokio::io::stdin(),
        FdWriter::stdout()?,
    )?;
    worker.run(listener.recv()).await
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    if let Err(e) = disable_core_dumps() {
        warn!("could not disable core dumps: {}", e);
    }

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid worker configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let outcome = runtime.block_on(serve(config));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("worker stopped: {}", e);
            ExitCode::FAILURE
        }
    }
}
