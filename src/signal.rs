//! External termination signals for interactive runs

use log::{error, info};

/// Wait for the first termination signal (SIGTERM/SIGINT on Unix, Ctrl+C on
/// Windows). If the handlers cannot be installed this never completes, so the
/// caller falls back to its other shutdown triggers.
pub async fn wait_for_kill_signal() {
    if let Err(e) = recv_kill_signal().await {
        error!("Failed to install termination signal handlers: {}", e);
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn recv_kill_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(windows)]
async fn recv_kill_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    Ok(())
}

#[cfg(not(any(unix, windows)))]
async fn recv_kill_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
