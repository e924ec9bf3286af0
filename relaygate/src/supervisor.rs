//! Worker supervision
//!
//! Forks `min(cpu_count, 4)` peer workers of this same binary, each with a
//! stable `WORKER_ID`, and respawns any that die. Workers bind their own
//! sockets with `SO_REUSEPORT`, so there is nothing to hand down but the
//! environment. The supervisor itself survives its own errors; it only
//! stops on a shutdown signal, returning the last worker's exit code.

use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinSet;

const MAX_WORKERS: usize = 4;
const RESPAWN_DELAY: Duration = Duration::from_millis(500);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub async fn run(_config: &relaygate_core::ProxyConfig) -> i32 {
    let worker_count = num_cpus::get().clamp(1, MAX_WORKERS) as u32;

    let exe = match std::env::current_exe() {
        Ok(exe) => exe,
        Err(e) => {
            tracing::error!("❌ cannot locate own executable: {}", e);
            return 1;
        }
    };

    tracing::info!(worker_count, "supervisor starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut monitors = JoinSet::new();
    for worker_id in 0..worker_count {
        monitors.spawn(monitor_worker(exe.clone(), worker_id, shutdown_rx.clone()));
    }

    // Relay shutdown signals to the monitors.
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received, stopping workers");
        let _ = shutdown_tx.send(true);
    });

    let mut last_code = 0;
    while let Some(result) = monitors.join_next().await {
        match result {
            Ok(code) => last_code = code,
            Err(e) => {
                // A monitor panicking must not take the supervisor down.
                tracing::error!("monitor task failed: {}", e);
                last_code = 1;
            }
        }
    }

    tracing::info!("supervisor exiting");
    last_code
}

/// Keep one worker slot alive: spawn, wait, respawn with the same ID, until
/// shutdown. Returns the worker's final exit code.
async fn monitor_worker(exe: PathBuf, worker_id: u32, mut shutdown: watch::Receiver<bool>) -> i32 {
    loop {
        if *shutdown.borrow() {
            return 0;
        }

        let mut child = match Command::new(&exe)
            .arg("run")
            .env("WORKER_ID", worker_id.to_string())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::error!(worker_id, "failed to spawn worker: {}", e);
                tokio::time::sleep(RESPAWN_DELAY).await;
                continue;
            }
        };

        tracing::info!(worker_id, pid = child.id(), "worker started");

        tokio::select! {
            status = child.wait() => {
                let code = status.ok().and_then(|s| s.code()).unwrap_or(1);
                if *shutdown.borrow() {
                    return code;
                }
                tracing::warn!(worker_id, code, "⚠️ worker exited, respawning");
                tokio::time::sleep(RESPAWN_DELAY).await;
            }
            _ = shutdown.changed() => {
                return stop_worker(worker_id, child).await;
            }
        }
    }
}

/// Graceful stop: SIGTERM first, SIGKILL after the grace period.
async fn stop_worker(worker_id: u32, mut child: tokio::process::Child) -> i32 {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }

    match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
        Ok(status) => status.ok().and_then(|s| s.code()).unwrap_or(0),
        Err(_) => {
            tracing::warn!(worker_id, "worker ignored SIGTERM, killing");
            let _ = child.kill().await;
            1
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
