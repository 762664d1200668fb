use agentcom_hub::config::{load_static_config, RuntimeConfig};
use agentcom_hub::{api, Hub};
use anyhow::Result;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("starting agentcom hub");

    let static_config = load_static_config()?;
    let runtime_config = RuntimeConfig::from_env();

    let hub = Hub::new(static_config.clone(), runtime_config).await?;
    hub.spawn_background_tasks();

    let router = api::build_router(
        hub.clone(),
        static_config.allowed_origins.clone(),
        static_config.admin_api_key.clone(),
    );

    let addr = format!("{}:{}", static_config.bind_host, static_config.bind_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {}", addr);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    };

    axum::serve(listener, router.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await?;

    hub.shutdown().await;
    Ok(())
}
