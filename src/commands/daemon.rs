use anyhow::{Context, Result, bail};
use std::path::Path;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::oneshot;

use kids_guard::clock::SystemClock;
use kids_guard::config::EnginePaths;
use kids_guard::ipc::{ControlClient, ControlServer};
use kids_guard::platform::Platform;
use kids_guard::process::{EnforcementProcess, ProcessCommand};
use kids_guard::store::PrefsStore;

use super::utils::{init_logging, load_config};

/// Run the enforcement process until SIGINT/SIGTERM or a `shutdown` command
pub fn run(
    config_path: Option<&Path>,
    state_dir: Option<&Path>,
    simulated: bool,
    verbose: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    init_logging(verbose, &config.logging)?;

    let paths = EnginePaths::resolve(state_dir)?;
    tracing::info!("Kids Guard v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("State directory: {}", paths.state_dir.display());

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(async {
        let client = ControlClient::new(paths.socket_path());
        if client.is_running().await {
            bail!("Kids Guard is already running (socket {})", paths.socket_path().display());
        }

        // simulated handles must outlive the process
        let (platform, _simulated) = if simulated {
            tracing::warn!(
                "Running against simulated devices; nothing on this machine is enforced"
            );
            let (platform, handles) = Platform::simulated();
            (platform, Some(handles))
        } else {
            (Platform::detect(&config, &paths)?, None)
        };

        let store = PrefsStore::new(&paths.state_dir);
        let process = EnforcementProcess::new(config, platform, store, Arc::new(SystemClock));
        let (handle, commands) = process.control_channel(32);

        let server = ControlServer::bind(&paths.socket_path(), handle.clone())?;
        let (stop_server, server_stopped) = oneshot::channel::<()>();
        let server_task = tokio::spawn(server.serve(async {
            let _ = server_stopped.await;
        }));

        let mut process_task = tokio::spawn(process.run(commands));
        let mut terminate =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted; shutting down");
                handle.send(ProcessCommand::Shutdown).await?;
                (&mut process_task).await?;
            }
            _ = terminate.recv() => {
                tracing::info!("Terminated; shutting down");
                handle.send(ProcessCommand::Shutdown).await?;
                (&mut process_task).await?;
            }
            result = &mut process_task => {
                result.context("Enforcement process panicked")?;
            }
        }

        let _ = stop_server.send(());
        server_task.await.context("Control server panicked")?;

        Ok(())
    })
}
