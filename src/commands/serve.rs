use std::sync::Arc;
use tokio::io::BufReader;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use workspace_host::{control::ControlServer, HostConfig, WorkspaceHost};

/// Run the host until stdin closes or a termination signal arrives.
pub async fn run_serve(config: HostConfig) -> anyhow::Result<()> {
    let host = Arc::new(WorkspaceHost::open(config).await?);
    tracing::info!(?host, "Starting workspace host");
    host.start().await?;

    let server = ControlServer::new(Arc::clone(&host));
    let mut sigterm = signal(SignalKind::terminate())?;
    let stop_reading = CancellationToken::new();

    let serving = server.serve_until(
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        stop_reading.clone(),
    );
    tokio::pin!(serving);

    let served = tokio::select! {
        result = &mut serving => {
            tracing::info!("Control input closed");
            result
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received interrupt");
            stop_reading.cancel();
            serving.await
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
            stop_reading.cancel();
            serving.await
        }
    };

    // Archive logs even if the control channel failed
    let shutdown = host.shutdown().await;
    served?;
    shutdown?;
    Ok(())
}
