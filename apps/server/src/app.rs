//! Runs the ingest server until shutdown is requested.

use std::future::Future;
use std::sync::Arc;

use dropstream_data_channel::IngestServer;

use crate::config::Config;

/// Serves uploads until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    run_until(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
        tracing::info!("interrupt received, shutting down");
    })
    .await
}

/// Serves uploads until `shutdown` resolves, then aborts open uploads and
/// waits for their sessions to clean up.
pub async fn run_until(
    config: Config,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let server = IngestServer::new(config.server_config());
    let listener = server.bind().await?;

    let mut serving = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.serve(listener).await }
    });

    tokio::select! {
        result = &mut serving => {
            // The accept loop only ends on its own when it fails.
            result??;
            return Ok(());
        }
        () = shutdown => {}
    }

    let in_flight = server.in_flight();
    if in_flight > 0 {
        tracing::info!(in_flight, "aborting uploads in progress");
    }
    server.shutdown();
    serving.await??;
    Ok(())
}
