//! 调用式传输适配器
//!
//! 客户端只能发起调用，不能被推送。状态变化经 `PollHub` 的脏标记由客户端轮询取得；
//! 存活检测是双向的：客户端定时上报心跳，服务端定时回拨客户端的探活地址。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use protocol::{
    CallRequest, CallResponse, Connection, Connector, Listener, ProbeRequest, ProbeResponse,
    ServerMessage, SlotId, TcpConnection, TcpConnector, TcpListener,
};

use crate::delivery::{ClientHandle, TransportKind};
use crate::orchestrator::Orchestrator;
use crate::poll::PollHub;

/// 单条调用式连接的上下文
#[derive(Debug)]
pub struct CallContext {
    pub handle: ClientHandle,
    pub slot: Option<SlotId>,
    pub probe_addr: Option<String>,
}

impl CallContext {
    pub fn new(handle: ClientHandle) -> Self {
        Self {
            handle,
            slot: None,
            probe_addr: None,
        }
    }

    fn owns(&self, slot: SlotId) -> bool {
        self.slot == Some(slot)
    }
}

/// 调用式传输服务
pub struct CallServer {
    orchestrator: Arc<Orchestrator>,
    hub: Arc<PollHub>,
    /// 席位 -> (连接句柄, 探活地址)
    probes: StdMutex<BTreeMap<SlotId, (ClientHandle, String)>>,
    next_conn: AtomicU64,
    heartbeat_interval: Duration,
    heartbeat_timeout: Duration,
}

impl CallServer {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        hub: Arc<PollHub>,
        heartbeat_interval: Duration,
        heartbeat_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            hub,
            probes: StdMutex::new(BTreeMap::new()),
            next_conn: AtomicU64::new(1),
            heartbeat_interval,
            heartbeat_timeout,
        })
    }

    /// 接受循环；同时启动心跳巡检与探活任务
    pub async fn serve(self: Arc<Self>, mut listener: TcpListener) {
        info!("调用式传输监听于 {:?}", listener.local_addr());
        let sweep = tokio::spawn(Arc::clone(&self).sweep_loop());
        let probe = tokio::spawn(Arc::clone(&self).probe_loop());

        let mut shutdown = self.orchestrator.shutdown_signal();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(server.handle_connection(conn));
                    }
                    Err(e) => warn!("接受调用式连接失败: {}", e),
                },
                _ = shutdown.changed() => break,
            }
        }

        // 已建立的连接继续服务，下一次调用会收到终止通知
        sweep.abort();
        probe.abort();
        debug!("调用式传输接受循环退出");
    }

    async fn handle_connection(self: Arc<Self>, mut conn: TcpConnection) {
        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        let mut ctx = CallContext::new(ClientHandle::new(TransportKind::Call, conn_id));
        info!("调用式连接 {} 来自 {:?}", conn_id, conn.peer_addr());

        loop {
            let request: CallRequest = match conn.recv().await {
                Ok(request) => request,
                Err(e) => {
                    info!("调用式连接 {} 读取结束: {}", conn_id, e);
                    self.forget_probe(&ctx);
                    self.orchestrator
                        .connection_lost(ctx.handle, e.to_string())
                        .await;
                    break;
                }
            };

            let response = self.dispatch(&mut ctx, request).await;
            let lost = matches!(response, CallResponse::SessionLost { .. });
            if let Err(e) = conn.send(&response).await {
                warn!("调用式连接 {} 写入失败: {}", conn_id, e);
                self.orchestrator
                    .connection_lost(ctx.handle, e.to_string())
                    .await;
                break;
            }
            if lost {
                let _ = conn.close().await;
                break;
            }
        }
    }

    /// 处理一次调用
    pub async fn dispatch(&self, ctx: &mut CallContext, request: CallRequest) -> CallResponse {
        if let Some(reason) = self.orchestrator.fatal_reason() {
            return CallResponse::SessionLost {
                reason: reason.to_string(),
            };
        }

        match request {
            CallRequest::Hello { probe_addr } => {
                ctx.probe_addr = probe_addr;
                CallResponse::Prompt(self.orchestrator.greet(ctx.handle).await)
            }
            CallRequest::Invoke(msg) => {
                let reply = self.orchestrator.handle(ctx.handle, msg).await;
                if ctx.slot.is_none() {
                    ctx.slot = self.orchestrator.slot_of(ctx.handle).await;
                    self.register_probe(ctx);
                }
                match reply {
                    Some(ServerMessage::SessionLost { reason }) => {
                        CallResponse::SessionLost { reason }
                    }
                    reply => CallResponse::Reply(reply),
                }
            }
            CallRequest::PollGameInfo { slot } => {
                let info = if ctx.owns(slot) {
                    self.hub.poll_game_info(slot)
                } else {
                    None
                };
                CallResponse::GameInfo(info)
            }
            CallRequest::FetchObjectiveChoices { slot } => {
                let choices = if ctx.owns(slot) {
                    self.hub.objective_choices(slot)
                } else {
                    None
                };
                CallResponse::Objectives(choices)
            }
            CallRequest::FetchChat { slot, since } => {
                if ctx.owns(slot) {
                    CallResponse::Chat(self.orchestrator.chat_backlog(slot, since).await)
                } else {
                    CallResponse::Chat(Vec::new())
                }
            }
            CallRequest::FetchMessages { slot } => {
                if ctx.owns(slot) {
                    CallResponse::Messages(self.hub.drain_messages(slot))
                } else {
                    CallResponse::Messages(Vec::new())
                }
            }
            CallRequest::Heartbeat { slot } => {
                if ctx.owns(slot) {
                    self.orchestrator.record_heartbeat(slot).await;
                }
                CallResponse::Ack
            }
        }
    }

    fn register_probe(&self, ctx: &CallContext) {
        if let (Some(slot), Some(addr)) = (ctx.slot, ctx.probe_addr.clone()) {
            debug!("席位 {} 的探活地址 {}", slot, addr);
            self.probes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(slot, (ctx.handle, addr));
        }
    }

    fn forget_probe(&self, ctx: &CallContext) {
        if let Some(slot) = ctx.slot {
            self.probes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&slot);
        }
    }

    /// 定期检查心跳表
    async fn sweep_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        loop {
            ticker.tick().await;
            if self.orchestrator.sweep_heartbeats(self.heartbeat_timeout).await {
                break;
            }
        }
    }

    /// 定期回拨客户端；任何一次失败都按连接断开处理
    async fn probe_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        loop {
            ticker.tick().await;
            if self.orchestrator.fatal_reason().is_some() {
                break;
            }

            let targets: Vec<(SlotId, ClientHandle, String)> = self
                .probes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .map(|(slot, (handle, addr))| (*slot, *handle, addr.clone()))
                .collect();

            for (slot, handle, addr) in targets {
                if let Err(detail) = probe_once(&addr, self.heartbeat_timeout).await {
                    warn!("席位 {} 探活失败: {}", slot, detail);
                    self.orchestrator
                        .connection_lost(handle, format!("probe {}: {}", addr, detail))
                        .await;
                }
            }
        }
    }
}

async fn probe_once(addr: &str, limit: Duration) -> Result<(), String> {
    let attempt = async {
        let mut conn = TcpConnector.connect(addr).await?;
        let pong: ProbeResponse = conn.call(&ProbeRequest::Ping).await?;
        let _ = conn.close().await;
        Ok::<_, protocol::ProtocolError>(pong)
    };
    match timeout(limit, attempt).await {
        Ok(Ok(ProbeResponse::Pong)) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("timed out".to_string()),
    }
}
