//! 流式传输适配器
//!
//! 每条连接一个读任务、一个写任务、一个心跳任务。出站帧一律放进
//! 连接自己的有界队列，由写任务按顺序写出；投递方从不等待套接字。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use protocol::{
    ClientMessage, Connection, FrameWriter, Listener, ProtocolError, ServerMessage, SlotId,
    TcpConnection, TcpListener,
};

use crate::delivery::{ClientHandle, ConnId, Delivery, DeliveryError, DeliveryResult, TransportKind};
use crate::orchestrator::Orchestrator;

/// 每条连接允许积压的出站帧数
const OUTBOUND_CAPACITY: usize = 256;

/// 出站帧
#[derive(Debug)]
enum Outbound {
    Frame(ServerMessage),
    /// 写出后关闭连接
    Close(ServerMessage),
}

type Outbox = mpsc::Sender<Outbound>;

struct Peer {
    slot: Option<SlotId>,
    outbox: Outbox,
}

/// 入队，不等待写任务
fn enqueue(conn: ConnId, outbox: &Outbox, item: Outbound) -> DeliveryResult<()> {
    outbox.try_send(item).map_err(|e| match e {
        TrySendError::Full(_) => DeliveryError::Backlog { conn },
        TrySendError::Closed(_) => DeliveryError::Closed { conn },
    })
}

/// 写任务：依次写出队列中的帧，单帧超过 `write_timeout` 视为连接失效
fn spawn_writer(
    conn: ConnId,
    mut writer: FrameWriter<OwnedWriteHalf>,
    mut inbox: mpsc::Receiver<Outbound>,
    write_timeout: Duration,
) -> JoinHandle<protocol::Result<()>> {
    tokio::spawn(async move {
        while let Some(item) = inbox.recv().await {
            let (msg, last) = match item {
                Outbound::Frame(msg) => (msg, false),
                Outbound::Close(msg) => (msg, true),
            };
            timeout(write_timeout, writer.write_frame(&msg))
                .await
                .map_err(|_| ProtocolError::ConnectionTimeout)??;
            if last {
                break;
            }
        }

        match timeout(write_timeout, writer.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("连接 {} 关闭写端失败: {}", conn, e),
            Err(_) => debug!("连接 {} 关闭写端超时", conn),
        }
        debug!("流式连接 {} 的写任务退出", conn);
        Ok::<(), ProtocolError>(())
    })
}

/// 流式连接表
pub struct StreamHub {
    peers: StdMutex<BTreeMap<ConnId, Peer>>,
    next_conn: AtomicU64,
}

impl StreamHub {
    pub fn new() -> Self {
        Self {
            peers: StdMutex::new(BTreeMap::new()),
            next_conn: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ConnId, Peer>> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 登记新连接的出站队列
    fn register(&self, outbox: Outbox) -> ConnId {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(conn, Peer { slot: None, outbox });
        conn
    }

    pub fn unregister(&self, conn: ConnId) {
        self.lock().remove(&conn);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn outbox_for_conn(&self, conn: ConnId) -> Option<Outbox> {
        self.lock().get(&conn).map(|p| p.outbox.clone())
    }

    fn outbox_for_slot(&self, slot: SlotId) -> Option<(ConnId, Outbox)> {
        self.lock()
            .iter()
            .find(|(_, p)| p.slot == Some(slot))
            .map(|(conn, p)| (*conn, p.outbox.clone()))
    }

    /// 已加入的连接，按席位排序
    fn joined(&self) -> Vec<(SlotId, ConnId, Outbox)> {
        let mut joined: Vec<(SlotId, ConnId, Outbox)> = self
            .lock()
            .iter()
            .filter_map(|(conn, p)| p.slot.map(|slot| (slot, *conn, p.outbox.clone())))
            .collect();
        joined.sort_by_key(|(slot, _, _)| *slot);
        joined
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Delivery for StreamHub {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn bind(&self, slot: SlotId, conn: ConnId) {
        if let Some(peer) = self.lock().get_mut(&conn) {
            peer.slot = Some(slot);
        }
    }

    async fn reply(&self, conn: ConnId, msg: ServerMessage) -> DeliveryResult<bool> {
        if let Some(outbox) = self.outbox_for_conn(conn) {
            enqueue(conn, &outbox, Outbound::Frame(msg))?;
        }
        Ok(true)
    }

    async fn send_to(&self, slot: SlotId, msg: ServerMessage) -> DeliveryResult<()> {
        if let Some((conn, outbox)) = self.outbox_for_slot(slot) {
            enqueue(conn, &outbox, Outbound::Frame(msg))?;
        }
        Ok(())
    }

    async fn publish(&self, msg: ServerMessage) -> DeliveryResult<()> {
        for (_, conn, outbox) in self.joined() {
            enqueue(conn, &outbox, Outbound::Frame(msg.clone()))?;
        }
        Ok(())
    }

    async fn close_all(&self, notice: ServerMessage) {
        let peers = std::mem::take(&mut *self.lock());
        for (conn, peer) in peers {
            if let Err(e) = enqueue(conn, &peer.outbox, Outbound::Close(notice.clone())) {
                debug!("连接 {} 终止通知发送失败: {}", conn, e);
            }
        }
    }
}

/// 流式传输服务
pub struct StreamServer {
    orchestrator: Arc<Orchestrator>,
    hub: Arc<StreamHub>,
    heartbeat_interval: Duration,
    write_timeout: Duration,
}

impl StreamServer {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        hub: Arc<StreamHub>,
        heartbeat_interval: Duration,
        write_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            orchestrator,
            hub,
            heartbeat_interval,
            write_timeout,
        })
    }

    /// 接受循环，会话终止时退出
    pub async fn serve(self: Arc<Self>, mut listener: TcpListener) {
        let mut shutdown = self.orchestrator.shutdown_signal();
        info!("流式传输监听于 {:?}", listener.local_addr());
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => {
                        let server = Arc::clone(&self);
                        tokio::spawn(server.handle_connection(conn));
                    }
                    Err(e) => warn!("接受流式连接失败: {}", e),
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("流式传输接受循环退出");
    }

    async fn handle_connection(self: Arc<Self>, conn: TcpConnection) {
        let peer_addr = conn.peer_addr();
        let (mut reader, writer) = conn.split();
        let (outbox, inbox) = mpsc::channel(OUTBOUND_CAPACITY);
        let conn_id = self.hub.register(outbox.clone());
        let mut writer_task = spawn_writer(conn_id, writer, inbox, self.write_timeout);
        let handle = ClientHandle::new(TransportKind::Stream, conn_id);
        info!("流式连接 {} 来自 {:?}", conn_id, peer_addr);

        let greeting = self.orchestrator.greet(handle).await;
        let refused = matches!(
            greeting,
            ServerMessage::LobbyFull | ServerMessage::SessionLost { .. }
        );
        let greeting = if refused {
            Outbound::Close(greeting)
        } else {
            Outbound::Frame(greeting)
        };
        let queued = enqueue(conn_id, &outbox, greeting);
        if refused || queued.is_err() {
            if let Err(e) = queued {
                debug!("连接 {} 问候发送失败: {}", conn_id, e);
            }
            self.hub.unregister(conn_id);
            self.orchestrator
                .connection_lost(handle, "connection refused at greeting".to_string())
                .await;
            info!("流式连接 {} 已关闭", conn_id);
            return;
        }

        let heartbeat = tokio::spawn(Self::heartbeat_loop(
            Arc::clone(&self.orchestrator),
            handle,
            outbox.clone(),
            self.heartbeat_interval,
        ));

        let mut shutdown = self.orchestrator.shutdown_signal();
        loop {
            let received = tokio::select! {
                received = reader.read_frame::<ClientMessage>() => received,
                finished = &mut writer_task => {
                    let detail = match finished {
                        Ok(Ok(())) => "writer closed".to_string(),
                        Ok(Err(e)) => e.to_string(),
                        Err(e) => e.to_string(),
                    };
                    info!("流式连接 {} 写入结束: {}", conn_id, detail);
                    self.orchestrator.connection_lost(handle, detail).await;
                    break;
                }
                _ = shutdown.changed() => break,
            };
            match received {
                Ok(msg) => {
                    // 回复已由连接表入队；只有会话终止时才会拿到需要补发的消息
                    if let Some(reply) = self.orchestrator.handle(handle, msg).await {
                        if let Err(e) = enqueue(conn_id, &outbox, Outbound::Frame(reply)) {
                            debug!("连接 {} 终止通知补发失败: {}", conn_id, e);
                        }
                    }
                }
                Err(e) => {
                    info!("流式连接 {} 读取结束: {}", conn_id, e);
                    self.orchestrator.connection_lost(handle, e.to_string()).await;
                    break;
                }
            }
        }

        // 写任务在队列排空、所有发送端释放后自行退出
        heartbeat.abort();
        self.hub.unregister(conn_id);
        debug!("流式连接 {} 的读任务退出", conn_id);
    }

    async fn heartbeat_loop(
        orchestrator: Arc<Orchestrator>,
        handle: ClientHandle,
        outbox: Outbox,
        interval: Duration,
    ) {
        let mut shutdown = orchestrator.shutdown_signal();
        let mut ticker = tokio::time::interval(interval);
        // 第一次 tick 立即返回
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match enqueue(handle.conn, &outbox, Outbound::Frame(ServerMessage::Heartbeat)) {
                        Ok(()) => {}
                        Err(e @ DeliveryError::Backlog { .. }) => {
                            orchestrator.connection_lost(handle, e.to_string()).await;
                            break;
                        }
                        // 写任务已退出，由读任务报告
                        Err(_) => break,
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}
