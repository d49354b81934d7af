//! 服务主循环：定期对齐机器池并推进输入，收到关闭信号后关闭全部机器
//!
//! 嵌入方提供 Repository 与 BackendFactory；启用 feature `web` 时同时提供 Inspect HTTP 端点。

use std::sync::Arc;

use anyhow::Context;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::advancer::Advancer;
use crate::backend::BackendFactory;
use crate::config::AppConfig;
use crate::core::{MachineError, ShutdownManager};
use crate::machine::MachineManager;
use crate::repository::Repository;

pub async fn run(
    config: AppConfig,
    repository: Arc<dyn Repository>,
    factory: Arc<dyn BackendFactory>,
    shutdown: Arc<ShutdownManager>,
) -> anyhow::Result<()> {
    let manager = Arc::new(MachineManager::new(
        repository.clone(),
        factory,
        config.load_options(),
    ));
    let advancer = config.advancer.enabled.then(|| {
        Advancer::new(
            manager.clone(),
            repository.clone(),
            config.advancer_options(),
        )
    });
    let cancel = shutdown.token();

    #[cfg(feature = "web")]
    let server = serve_http(&config.http.address, manager.clone(), cancel.clone()).await?;
    shutdown.listen_for_signals();

    info!(
        refresh_interval_ms = config.manager.refresh_interval_ms,
        advancer = advancer.is_some(),
        "Rollup machine service started"
    );

    let mut interval = tokio::time::interval(config.refresh_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                match manager.update_machines(&cancel).await {
                    Ok(()) | Err(MachineError::Cancelled) => {}
                    Err(e) => error!("Failed to update machines: {}", e),
                }
                if let Some(advancer) = &advancer {
                    match advancer.step(&cancel).await {
                        Ok(_) | Err(MachineError::Cancelled) => {}
                        Err(e) => error!("Advancer step failed: {}", e),
                    }
                }
            }
        }
    }

    info!(reason = ?shutdown.reason(), "Shutdown requested, closing machines...");
    #[cfg(feature = "web")]
    {
        if let Err(e) = server.await {
            tracing::warn!("HTTP server task failed: {}", e);
        }
    }
    manager
        .close()
        .await
        .context("failed to close machines")?;
    info!("Rollup machine service stopped");
    Ok(())
}

#[cfg(feature = "web")]
async fn serve_http(
    address: &str,
    manager: Arc<MachineManager>,
    cancel: tokio_util::sync::CancellationToken,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(address)
        .await
        .with_context(|| format!("failed to bind {address}"))?;
    info!("Inspect endpoint: http://{}", listener.local_addr()?);

    let app = crate::http::router(manager);
    Ok(tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            error!("HTTP server error: {}", e);
        }
    }))
}
