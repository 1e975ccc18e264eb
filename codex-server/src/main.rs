use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use codex_server::{start, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("codex_server=debug".parse()?))
        .init();

    info!("Codex Naturalis 服务端启动中...");

    let config = ServerConfig::from_env()?;
    let server = start(&config).await?;

    let reason = server.wait_fatal().await;
    error!("会话终止，服务端退出: {}", reason);

    // 给调用式客户端一点时间取走终止通知
    tokio::time::sleep(config.poll_interval() * 4).await;
    server.abort();
    std::process::exit(1);
}
