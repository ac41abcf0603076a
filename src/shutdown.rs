//! Process signals to cancellation

use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Cancel `cancel` on Ctrl+C (and SIGTERM on unix)
///
/// Must be called from within a tokio runtime.
pub fn install(cancel: &CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = interrupt.recv() => tracing::info!("Interrupt received, shutting down"),
                _ = terminate.recv() => tracing::info!("Terminate received, shutting down"),
                _ = cancel.cancelled() => return,
            }
            cancel.cancel();
        });
    }

    #[cfg(windows)]
    {
        let cancel = cancel.clone();
        ctrlc::set_handler(move || {
            tracing::info!("Ctrl+C received, shutting down");
            cancel.cancel();
        })
        .map_err(|e| crate::Error::Config(format!("cannot install Ctrl+C handler: {}", e)))?;
    }

    Ok(())
}
