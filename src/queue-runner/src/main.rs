#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![allow(clippy::missing_errors_doc)]
#![recursion_limit = "256"]

pub mod config;
pub(crate) mod lock_file;
pub mod remote;
pub mod state;
pub mod utils;

use anyhow::Context as _;

use state::State;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

fn start_task_loops(state: &std::sync::Arc<State>) -> Vec<tokio::task::AbortHandle> {
    tracing::info!("queue runner starting task loops");

    vec![
        spawn_config_reloader(state.clone(), state.config.clone(), &state.cli.config_path),
        state.clone().start_machines_monitor_loop(),
        state.clone().start_queue_monitor_loop(),
        state.clone().start_dispatch_loop(),
        state.clone().start_notification_sender_loop(),
        state.clone().start_log_compressor_loop(),
    ]
}

fn spawn_config_reloader(
    state: std::sync::Arc<State>,
    current_config: config::App,
    filepath: &str,
) -> tokio::task::AbortHandle {
    let filepath = filepath.to_owned();
    let task = tokio::spawn(async move {
        loop {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(mut s) => {
                    let _ = s.recv().await;
                    tracing::info!("Reloading...");
                    config::reload(&current_config, &filepath, &state).await;
                }
                Err(e) => {
                    tracing::error!("Failed to create signal listener for SIGHUP: {e}");
                    break;
                }
            }
        }
    });
    task.abort_handle()
}

async fn shutdown(state: &std::sync::Arc<State>, task_abort_handles: Vec<tokio::task::AbortHandle>) {
    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);
    // stop handing out reservations, then let in-flight workers settle
    for h in task_abort_handles {
        h.abort();
    }
    state.drain(std::time::Duration::from_secs(600)).await;
    if let Err(e) = state.clear_busy().await {
        tracing::error!("Failed to clear busy build steps during shutdown: {e}");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _tracing_guard = forge_tracing::init()?;

    let state = State::new().await?;

    let lockfile_path = state.config.get_lockfile();
    let _lock = lock_file::LockFile::acquire(&lockfile_path)
        .context("Another instance is already running.")?;

    // whatever was marked busy when the previous scheduler died is dead now
    utils::retry_db(|| async { state.clear_busy().await })
        .await
        .context("Failed to clear busy build steps at startup")?;

    let task_abort_handles = start_task_loops(&state);
    let _notify = sd_notify::notify(
        false,
        &[
            sd_notify::NotifyState::Status("Running"),
            sd_notify::NotifyState::Ready,
        ],
    );

    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            tracing::info!("Received sigint - shutting down gracefully");
            shutdown(&state, task_abort_handles).await;
        }
        _ = sigterm.recv() => {
            tracing::info!("Received sigterm - shutting down gracefully");
            shutdown(&state, task_abort_handles).await;
        }
    }
    Ok(())
}
