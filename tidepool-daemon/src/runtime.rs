use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::broadcast;

use tidepool_core::LanguageRegistry;
use tidepool_sync::{hub, run_loop, Hub, HubHandle, LogRemoteEdits};

use crate::error::{io_err, DaemonError};
use crate::paths::{bind_address, DEFAULT_HOST, DEFAULT_PORT};
use crate::server::router;

/// What `tidepool serve` runs.
#[derive(Debug, Clone)]
pub struct ServeOptions {
    pub host: String,
    pub port: u16,
    /// Project roots; each needs a `tidepool.json` to become active.
    pub roots: Vec<PathBuf>,
    /// Emit logs as JSON lines instead of human-readable text.
    pub json_logs: bool,
}

impl Default for ServeOptions {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            roots: vec![PathBuf::from(".")],
            json_logs: false,
        }
    }
}

impl ServeOptions {
    pub fn address(&self) -> String {
        bind_address(&self.host, self.port)
    }
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(options: ServeOptions) -> Result<(), DaemonError> {
    init_tracing(options.json_logs);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(options))
}

/// Bind, serve until ctrl-c, then shut the hub down.
pub async fn run(options: ServeOptions) -> Result<(), DaemonError> {
    let listener = bind(&options.address()).await?;
    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let result = serve(listener, options.roots, shutdown_tx.subscribe()).await;
    let _ = shutdown_tx.send(());
    handle_join("signal_handler", signal_handle.await)??;
    result
}

/// Bind the listen socket, turning "address in use" into a clear error.
pub async fn bind(addr: &str) -> Result<TcpListener, DaemonError> {
    TcpListener::bind(addr).await.map_err(|err| {
        if err.kind() == std::io::ErrorKind::AddrInUse {
            DaemonError::AddrInUse {
                addr: addr.to_string(),
            }
        } else {
            io_err(addr, err)
        }
    })
}

/// Run the hub and the HTTP server on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    roots: Vec<PathBuf>,
    shutdown: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let (tx, rx) = hub::channel();
    let hub = Hub::new(
        LanguageRegistry::with_defaults(),
        Arc::new(LogRemoteEdits),
        tx.clone(),
    );
    let hub_thread = tokio::task::spawn_blocking(move || run_loop(hub, rx));
    let handle = HubHandle::new(tx);

    let result = serve_with_hub(listener, roots, &handle, shutdown).await;
    let _ = handle.shutdown();
    handle_join("hub", hub_thread.await)?;
    result
}

async fn serve_with_hub(
    listener: TcpListener,
    roots: Vec<PathBuf>,
    handle: &HubHandle,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    for root in roots {
        handle.add_project(root).await?;
    }
    handle.start()?;

    let local = listener
        .local_addr()
        .map_err(|e| io_err("listener", e))?;
    tracing::info!(address = %local, "tidepool listening");

    let stopper = handle.clone();
    axum::serve(listener, router(handle.clone()))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            // Held long-polls only end once the hub drops their clients.
            let _ = stopper.stop();
        })
        .await
        .map_err(|e| io_err(local.to_string(), e))
}

fn handle_join<T>(
    task: &str,
    result: Result<T, tokio::task::JoinError>,
) -> Result<T, DaemonError> {
    result.map_err(|err| DaemonError::Protocol(format!("{task} task join failure: {err}")))
}

fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        let _ = fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    } else {
        let _ = fmt().with_env_filter(filter).with_target(false).try_init();
    }
}
