use std::future::Future;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use backup_core::DiskCatalog;

use crate::config::CoordinatorConfig;
use crate::control;
use crate::error::{io_err, CoordinatorError};
use crate::launcher::{ProcessLauncher, WorkerLauncher};
use crate::paths::{backup_root, catalog_dir};
use crate::scheduler::{ControlEnvelope, Scheduler};
use crate::worker::{self, WorkerJob};

/// Start the coordinator and block the current thread until it exits.
pub fn start_blocking(config: CoordinatorConfig) -> Result<(), CoordinatorError> {
    init_tracing();
    let launcher = ProcessLauncher::current_exe().map_err(|e| io_err("current-exe", e))?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config, Arc::new(launcher)))
}

/// Run one worker job to completion and return its exit code.
pub fn run_worker_blocking(job: WorkerJob) -> Result<i32, CoordinatorError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    Ok(runtime.block_on(worker::execute(&job)))
}

/// Bind the control port and run until ctrl-c or a fatal error.
pub async fn run(
    config: CoordinatorConfig,
    launcher: Arc<dyn WorkerLauncher>,
) -> Result<(), CoordinatorError> {
    let listener = backup_wire::bind_listener(config.bind, config.listen_backlog)?;
    run_until(config, listener, launcher, async {
        tokio::signal::ctrl_c()
            .await
            .map_err(|err| CoordinatorError::Runtime(format!("ctrl-c handler failed: {err}")))
    })
    .await
}

/// Run on an already bound listener until `stop` resolves.
///
/// Every task broadcasts shutdown when it finishes, so the first one to stop
/// (normally the `stop` future) takes the others down with it.
pub async fn run_until<F>(
    config: CoordinatorConfig,
    listener: TcpListener,
    launcher: Arc<dyn WorkerLauncher>,
    stop: F,
) -> Result<(), CoordinatorError>
where
    F: Future<Output = Result<(), CoordinatorError>> + Send + 'static,
{
    let catalog = DiskCatalog::open_with(catalog_dir(&config.data_root), config.catalog)?;
    let scheduler = Scheduler::new(
        catalog,
        backup_root(&config.data_root),
        launcher,
        config.scheduler_options(),
    )?;

    let local = listener
        .local_addr()
        .map_err(|e| io_err(config.bind.to_string(), e))?;
    tracing::info!(
        addr = %local,
        data_root = %config.data_root.display(),
        "coordinator listening",
    );

    let (request_tx, request_rx) = mpsc::channel::<ControlEnvelope>(16);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let scheduler_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            let result = scheduler.run(request_rx, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let control_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown.subscribe();
        let read_timeout = config.control_read_timeout;
        tokio::spawn(async move {
            let result = control::serve(listener, request_tx, shutdown_rx, read_timeout).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                stopped = stop => {
                    let _ = shutdown.send(());
                    match stopped {
                        Ok(()) => {
                            tracing::info!("stop requested, shutting down coordinator");
                            Ok(())
                        }
                        Err(err) => Err(err),
                    }
                }
            }
        })
    };

    let (scheduler_result, control_result, signal_result) =
        tokio::join!(scheduler_handle, control_handle, signal_handle);

    handle_join("scheduler", scheduler_result)?;
    handle_join("control_server", control_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("coordinator stopped");
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), CoordinatorError>, tokio::task::JoinError>,
) -> Result<(), CoordinatorError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(CoordinatorError::Runtime(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// `RUST_LOG` filtering (default `info`); `LOG_FORMAT=json` for JSON lines.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    let _ = if json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    } else {
        fmt().with_env_filter(filter).with_target(false).try_init()
    };
}
