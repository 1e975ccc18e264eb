//! 调用式传输客户端
//!
//! 客户端无法被推送：后台循环按固定间隔上报心跳并拉取广播、定向消息、目标选项和聊天，
//! 拿到什么就转成 `CallEvent` 送进 channel。取不到数据是常态，不是错误。

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use protocol::{
    CallRequest, CallResponse, ChatEntry, ClientMessage, Connection, Connector, GameInfo,
    Listener, ObjectiveChoices, ProbeRequest, ProbeResponse, ProtocolError, Result,
    ServerMessage, SlotId, TcpConnection, TcpConnector, TcpListener,
};

/// 后台循环产生的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    GameInfo(GameInfo),
    Objectives(ObjectiveChoices),
    Chat(ChatEntry),
    /// 定向消息（轮到你、终局排名等）
    Message(ServerMessage),
    /// 服务端不可达或会话已终止；之后不再有事件
    ServerLost { reason: String },
}

/// 在本地监听服务端的探活调用
pub async fn bind_probe_listener(host: &str) -> Result<(TcpListener, String)> {
    let listener = TcpListener::bind(&format!("{}:0", host)).await?;
    let addr = listener
        .local_addr()
        .ok_or_else(|| ProtocolError::UnexpectedResponse("probe listener has no address".into()))?;
    Ok((listener, addr))
}

/// 调用式客户端
pub struct CallClient {
    conn: Arc<Mutex<TcpConnection>>,
    slot: Arc<StdMutex<Option<SlotId>>>,
    /// 最近一次收到服务端探活的时间
    last_probe: Arc<StdMutex<Instant>>,
    probe_addr: String,
    probe_task: JoinHandle<()>,
}

impl CallClient {
    /// 连接服务端并打招呼，返回客户端与问候消息
    pub async fn connect(server_addr: &str, probe_host: &str) -> Result<(Self, ServerMessage)> {
        let (listener, probe_addr) = bind_probe_listener(probe_host).await?;
        let last_probe = Arc::new(StdMutex::new(Instant::now()));
        let probe_task = tokio::spawn(answer_probes(listener, Arc::clone(&last_probe)));

        let mut conn = TcpConnector.connect(server_addr).await?;
        let hello: CallResponse = conn
            .call(&CallRequest::Hello {
                probe_addr: Some(probe_addr.clone()),
            })
            .await?;
        let greeting = match hello {
            CallResponse::Prompt(msg) => msg,
            CallResponse::SessionLost { reason } => ServerMessage::SessionLost { reason },
            other => return Err(unexpected(&other)),
        };

        Ok((
            Self {
                conn: Arc::new(Mutex::new(conn)),
                slot: Arc::new(StdMutex::new(None)),
                last_probe,
                probe_addr,
                probe_task,
            },
            greeting,
        ))
    }

    /// 已加入或已认领的席位
    pub fn slot(&self) -> Option<SlotId> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn probe_addr(&self) -> &str {
        &self.probe_addr
    }

    /// 写操作（加入、选目标、出牌、聊天、认领身份）
    pub async fn invoke(&self, msg: ClientMessage) -> Result<Option<ServerMessage>> {
        let response = request(&self.conn, CallRequest::Invoke(msg)).await?;
        match response {
            CallResponse::Reply(reply) => {
                let joined = match &reply {
                    Some(ServerMessage::Joined { slot }) => Some(*slot),
                    Some(ServerMessage::RejoinData(data)) => Some(data.slot),
                    _ => None,
                };
                if let Some(slot) = joined {
                    *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(slot);
                    // 服务端从此刻开始探活
                    *self.last_probe.lock().unwrap_or_else(PoisonError::into_inner) =
                        Instant::now();
                }
                Ok(reply)
            }
            CallResponse::SessionLost { reason } => Ok(Some(ServerMessage::SessionLost { reason })),
            other => Err(unexpected(&other)),
        }
    }

    /// 启动后台轮询循环
    pub fn spawn_polling(
        &self,
        interval: Duration,
        heartbeat_timeout: Duration,
    ) -> (mpsc::Receiver<CallEvent>, JoinHandle<()>) {
        let (events, rx) = mpsc::channel(64);
        let poller = Poller {
            conn: Arc::clone(&self.conn),
            slot: Arc::clone(&self.slot),
            last_probe: Arc::clone(&self.last_probe),
            events,
            heartbeat_timeout,
            chat_cursor: 0,
            have_objectives: false,
        };
        let task = tokio::spawn(poller.run(interval));
        (rx, task)
    }
}

impl Drop for CallClient {
    fn drop(&mut self) {
        self.probe_task.abort();
    }
}

fn unexpected(response: &CallResponse) -> ProtocolError {
    ProtocolError::UnexpectedResponse(format!("{:?}", response))
}

async fn request(conn: &Mutex<TcpConnection>, req: CallRequest) -> Result<CallResponse> {
    conn.lock().await.call(&req).await
}

/// 应答服务端探活
async fn answer_probes(mut listener: TcpListener, last_probe: Arc<StdMutex<Instant>>) {
    loop {
        let mut conn = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("探活监听失败: {}", e);
                break;
            }
        };
        let last_probe = Arc::clone(&last_probe);
        tokio::spawn(async move {
            while let Ok(ProbeRequest::Ping) = conn.recv::<ProbeRequest>().await {
                *last_probe.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
                if conn.send(&ProbeResponse::Pong).await.is_err() {
                    break;
                }
            }
        });
    }
}

struct Poller {
    conn: Arc<Mutex<TcpConnection>>,
    slot: Arc<StdMutex<Option<SlotId>>>,
    last_probe: Arc<StdMutex<Instant>>,
    events: mpsc::Sender<CallEvent>,
    heartbeat_timeout: Duration,
    chat_cursor: usize,
    have_objectives: bool,
}

/// 一轮轮询的结局
enum Tick {
    Continue,
    Stop(String),
}

impl Poller {
    async fn run(mut self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let reason = match self.tick().await {
                Ok(Tick::Continue) => continue,
                Ok(Tick::Stop(reason)) => reason,
                Err(e) => e.to_string(),
            };
            debug!("调用式客户端停止轮询: {}", reason);
            let _ = self.events.send(CallEvent::ServerLost { reason }).await;
            break;
        }
    }

    async fn emit(&self, event: CallEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    async fn tick(&mut self) -> Result<Tick> {
        let Some(slot) = *self.slot.lock().unwrap_or_else(PoisonError::into_inner) else {
            return Ok(Tick::Continue);
        };

        let since_probe = self
            .last_probe
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed();
        if since_probe > self.heartbeat_timeout {
            return Ok(Tick::Stop(format!(
                "no probe from server for {} ms",
                since_probe.as_millis()
            )));
        }

        match request(&self.conn, CallRequest::Heartbeat { slot }).await? {
            CallResponse::Ack => {}
            CallResponse::SessionLost { reason } => return Ok(Tick::Stop(reason)),
            other => return Err(unexpected(&other)),
        }

        match request(&self.conn, CallRequest::PollGameInfo { slot }).await? {
            CallResponse::GameInfo(Some(info)) => {
                if !self.emit(CallEvent::GameInfo(info)).await {
                    return Ok(Tick::Stop("event receiver dropped".into()));
                }
            }
            CallResponse::GameInfo(None) => {}
            CallResponse::SessionLost { reason } => return Ok(Tick::Stop(reason)),
            other => return Err(unexpected(&other)),
        }

        match request(&self.conn, CallRequest::FetchMessages { slot }).await? {
            CallResponse::Messages(messages) => {
                for msg in messages {
                    if let ServerMessage::SessionLost { reason } = msg {
                        return Ok(Tick::Stop(reason));
                    }
                    if !self.emit(CallEvent::Message(msg)).await {
                        return Ok(Tick::Stop("event receiver dropped".into()));
                    }
                }
            }
            CallResponse::SessionLost { reason } => return Ok(Tick::Stop(reason)),
            other => return Err(unexpected(&other)),
        }

        if !self.have_objectives {
            match request(&self.conn, CallRequest::FetchObjectiveChoices { slot }).await? {
                CallResponse::Objectives(Some(choices)) => {
                    self.have_objectives = true;
                    if !self.emit(CallEvent::Objectives(choices)).await {
                        return Ok(Tick::Stop("event receiver dropped".into()));
                    }
                }
                CallResponse::Objectives(None) => {}
                CallResponse::SessionLost { reason } => return Ok(Tick::Stop(reason)),
                other => return Err(unexpected(&other)),
            }
        }

        let since = self.chat_cursor;
        match request(&self.conn, CallRequest::FetchChat { slot, since }).await? {
            CallResponse::Chat(entries) => {
                for entry in entries {
                    self.chat_cursor = self.chat_cursor.max(entry.index + 1);
                    if !self.emit(CallEvent::Chat(entry)).await {
                        return Ok(Tick::Stop("event receiver dropped".into()));
                    }
                }
            }
            CallResponse::SessionLost { reason } => return Ok(Tick::Stop(reason)),
            other => return Err(unexpected(&other)),
        }

        Ok(Tick::Continue)
    }
}
