use std::sync::Arc;

use gridrecon::{
    api_router, init_logging, log_app_bind, log_app_start, log_store_opened,
    logging_config_from_env, reconcile_config_from_env, ReconciliationSource, ReconciliationStore,
    SharedStore,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging_cfg = logging_config_from_env();
    init_logging(&logging_cfg)?;
    log_app_start("recon_server", &logging_cfg);

    let config = reconcile_config_from_env()?;
    let store = ReconciliationStore::open(&config.db_path)?
        .with_matching(config.window, config.tie_break)
        .with_validation(config.validation);
    log_store_opened("recon_server", &config.db_path, &config);

    let source: Arc<dyn ReconciliationSource> = Arc::new(SharedStore::new(store));
    let app = api_router(source);
    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let bound_addr = listener.local_addr()?;

    log_app_bind(bound_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
