use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use signal_hook::consts::SIGINT;
use signal_hook::consts::SIGTERM;
use signal_hook::iterator::Signals;
use tracing::info;

use crate::error::CliError;

/// Sets `shutdown` on the first SIGINT or SIGTERM.
pub struct SignalHandler {
    _handle: JoinHandle<()>,
}

impl SignalHandler {
    pub fn setup(shutdown: Arc<AtomicBool>) -> Result<Self, CliError> {
        let mut signals =
            Signals::new([SIGINT, SIGTERM]).map_err(|e| CliError::SignalSetup(e.to_string()))?;

        let handle = thread::Builder::new()
            .name("signal-handler".to_string())
            .spawn(move || {
                if let Some(sig) = signals.forever().next() {
                    info!(signal = sig, "Received signal, shutting down");
                    shutdown.store(true, Ordering::SeqCst);
                }
            })
            .map_err(|e| CliError::SignalSetup(format!("failed to spawn signal handler: {}", e)))?;

        Ok(Self { _handle: handle })
    }
}
