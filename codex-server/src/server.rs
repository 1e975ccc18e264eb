//! 服务端装配
//!
//! 载入（或新建）会话，绑定两种传输的监听端口，启动各自的接受循环。

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use protocol::{Listener, TcpListener};

use crate::call::CallServer;
use crate::config::ServerConfig;
use crate::delivery::Delivery;
use crate::error::FatalReason;
use crate::orchestrator::Orchestrator;
use crate::poll::PollHub;
use crate::session::Session;
use crate::storage::SnapshotStore;
use crate::stream::{StreamHub, StreamServer};

/// 运行中的服务端
pub struct ServerHandle {
    pub stream_addr: String,
    pub call_addr: String,
    pub orchestrator: Arc<Orchestrator>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// 等待会话终止，返回终止原因
    pub async fn wait_fatal(&self) -> FatalReason {
        let mut signal = self.orchestrator.shutdown_signal();
        loop {
            if let Some(reason) = signal.borrow_and_update().clone() {
                return reason;
            }
            if signal.changed().await.is_err() {
                return FatalReason::transport("server", "shutdown channel closed");
            }
        }
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<Option<FatalReason>> {
        self.orchestrator.shutdown_signal()
    }

    /// 停止接受循环（测试里模拟进程退出）
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

/// 按配置启动服务端
pub async fn start(config: &ServerConfig) -> Result<ServerHandle> {
    let storage = SnapshotStore::new(config.saves_dir.clone())?;
    info!("快照目录: {:?}", storage.saves_directory());

    let session = if config.resume {
        let snapshot = storage
            .load(&config.session_id)
            .with_context(|| format!("载入会话快照失败: {}", config.session_id))?;
        match snapshot {
            Some(snapshot) => {
                info!(
                    "从快照恢复会话 {}（保存于 {}）",
                    snapshot.session_id, snapshot.saved_at
                );
                Session::restore(snapshot)
            }
            None => {
                warn!("会话 {} 没有快照，开始新会话", config.session_id);
                Session::new(config.session_id.clone())
            }
        }
    } else {
        // 新会话不沿用旧快照，避免开局前崩溃后恢复到上一局
        storage
            .delete(&config.session_id)
            .with_context(|| format!("清理旧快照失败: {}", config.session_id))?;
        info!("开始新会话 {}", config.session_id);
        Session::new(config.session_id.clone())
    };

    let stream_hub = Arc::new(StreamHub::new());
    let poll_hub = Arc::new(PollHub::new());
    let deliveries: Vec<Arc<dyn Delivery>> = vec![
        Arc::clone(&stream_hub) as Arc<dyn Delivery>,
        Arc::clone(&poll_hub) as Arc<dyn Delivery>,
    ];
    let orchestrator = Arc::new(Orchestrator::new(
        session,
        deliveries,
        storage,
        config.seed,
    ));

    let stream_listener = TcpListener::bind(&config.stream_addr())
        .await
        .with_context(|| format!("绑定流式端口失败: {}", config.stream_addr()))?;
    let call_listener = TcpListener::bind(&config.call_addr())
        .await
        .with_context(|| format!("绑定调用式端口失败: {}", config.call_addr()))?;
    let stream_addr = stream_listener
        .local_addr()
        .unwrap_or_else(|| config.stream_addr());
    let call_addr = call_listener
        .local_addr()
        .unwrap_or_else(|| config.call_addr());

    let stream_server = StreamServer::new(
        Arc::clone(&orchestrator),
        stream_hub,
        config.heartbeat_interval(),
        config.heartbeat_timeout(),
    );
    let call_server = CallServer::new(
        Arc::clone(&orchestrator),
        poll_hub,
        config.heartbeat_interval(),
        config.heartbeat_timeout(),
    );
    let tasks = vec![
        tokio::spawn(stream_server.serve(stream_listener)),
        tokio::spawn(call_server.serve(call_listener)),
    ];

    // 两种传输都已就绪，才开始接受身份认领
    orchestrator.begin_rejoining().await;
    info!(
        "会话 {} 就绪：流式 {}，调用式 {}",
        config.session_id, stream_addr, call_addr
    );

    Ok(ServerHandle {
        stream_addr,
        call_addr,
        orchestrator,
        tasks,
    })
}
