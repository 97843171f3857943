use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Listens for SIGINT and SIGTERM and cancels the worker's token.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    cancel_token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new(cancel_token: CancellationToken) -> Self {
        Self { cancel_token }
    }

    pub fn register_handlers(&self) {
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            let ctrl_c = async {
                if let Err(err) = signal::ctrl_c().await {
                    error!(error = %err, "Failed to install SIGINT handler");
                    std::future::pending::<()>().await;
                }
            };

            #[cfg(unix)]
            let terminate = async {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut stream) => {
                        stream.recv().await;
                    }
                    Err(err) => {
                        error!(error = %err, "Failed to install SIGTERM handler");
                        std::future::pending::<()>().await;
                    }
                }
            };

            #[cfg(not(unix))]
            let terminate = std::future::pending::<()>();

            tokio::select! {
                _ = ctrl_c => {
                    info!("Received SIGINT (Ctrl+C), stopping after in-flight writes");
                }
                _ = terminate => {
                    info!("Received SIGTERM, stopping after in-flight writes");
                }
            }

            cancel_token.cancel();
        });
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }
}

/// Exit codes the binary produces itself. Worker outcomes carry their own.
#[derive(Debug, Clone, Copy)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}
