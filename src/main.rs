use std::sync::Arc;

use futures::future::join_all;
use tracing::{error, info};

use fleetbook::config::Config;
use fleetbook::engine::EngineOptions;
use fleetbook::tenant::TenantManager;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env();
    fleetbook::observability::init(config.metrics_port)?;

    // Ensure data directory exists
    std::fs::create_dir_all(&config.data_dir)?;

    let options = EngineOptions {
        lock_timeout: config.lock_timeout,
        ..EngineOptions::default()
    };
    let tenant_manager = Arc::new(TenantManager::new(
        config.data_dir.clone(),
        config.compact_threshold,
        options,
    ));
    let loaded = tenant_manager.load_existing()?;

    info!("fleetbook started");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  tenants: {}", loaded.len());
    info!("  lock_timeout: {:?}", config.lock_timeout);
    info!("  reconcile_interval: {:?}", config.reconcile_interval);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown on SIGTERM/ctrl-c
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = ctrl_c => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    error!("failed to register SIGTERM handler: {e}");
                    ctrl_c.await.ok();
                }
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    let mut interval = tokio::time::interval(config.reconcile_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                reconcile_tenants(&tenant_manager).await;
            }
            _ = &mut shutdown => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    // One last pass so the WALs end on reconciled state.
    reconcile_tenants(&tenant_manager).await;
    info!("fleetbook stopped");
    Ok(())
}

async fn reconcile_tenants(tenant_manager: &TenantManager) {
    let tenants = tenant_manager.tenants();
    let passes = tenants.iter().map(|(name, engine)| async move {
        let overdue = engine.mark_overdue_installments().await;
        let summary = engine.reconcile_all().await;
        (name, overdue, summary)
    });
    for (name, overdue, summary) in join_all(passes).await {
        match overdue {
            Ok(ids) if !ids.is_empty() => info!("tenant {name}: {} installments overdue", ids.len()),
            Ok(_) => {}
            Err(e) => error!("tenant {name}: marking overdue installments failed: {e}"),
        }
        match summary {
            Ok(s) => tracing::debug!(
                "tenant {name}: checked {} resources and {} customers, corrected {}",
                s.resources_checked,
                s.customers_checked,
                s.corrected()
            ),
            Err(e) => error!("tenant {name}: reconciliation failed: {e}"),
        }
    }
}
