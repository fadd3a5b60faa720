use anyhow::Result;
use stratum_pipeline::{observability, Pipeline, PipelineConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = PipelineConfig::from_env_or_yaml()?;
    let metrics_handle = observability::init_observability();

    let pipeline = Pipeline::build(&config).await?;
    let listener_task = pipeline.spawn_listener();

    let metrics_bind = config.metrics_bind;
    tokio::spawn(async move {
        if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
            tracing::error!(error = %err, "metrics server exited");
        }
    });

    tracing::info!(metrics_bind = %config.metrics_bind, "pipeline started");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    pipeline.listener.shutdown();
    listener_task.await??;
    Ok(())
}
