use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::config::Config;
use crate::registry::Registry;
use crate::router;

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let registry = match Registry::from_config(&config).await {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            tracing::error!("Failed to create flag engine registry: {}", e);
            return;
        }
    };

    serve_registry(registry, &config, listener, shutdown).await
}

/// Serve an already built registry. The registry is started here and shut
/// down once the server has drained.
pub async fn serve_registry<F>(
    registry: Arc<Registry>,
    config: &Config,
    listener: TcpListener,
    shutdown: F,
) where
    F: Future<Output = ()> + Send + 'static,
{
    registry.start().await;
    let app = router::router(registry.clone(), config);

    match listener.local_addr() {
        Ok(addr) => tracing::info!("listening on {:?}", addr),
        Err(e) => tracing::warn!("listening on an unknown address: {}", e),
    }
    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    {
        tracing::error!("server error: {}", e);
    }

    registry.shutdown().await;
}
