use dashscope_adapter::{
    config::Config,
    protocol::DashScopeAdapter,
    server::{router, AppState},
    Result,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志，支持通过环境变量配置，默认info级别
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting DashScope gateway...");

    // 加载配置，路径可以通过 GATEWAY_CONFIG 指定
    let path = std::env::var("GATEWAY_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
    let config = Config::from_file(&path).unwrap_or_else(|e| {
        info!("Failed to load {}: {}, using default config", path, e);
        Config::default()
    });

    let adapter = DashScopeAdapter::from_config(&config)?;
    let app = router(AppState::new(Arc::new(adapter)));

    // 启动服务器
    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
