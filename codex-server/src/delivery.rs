//! 投递策略
//!
//! 会话编排器只调用 `Delivery`，不关心消息是推送出去还是等客户端来取。
//! 流式传输实现为立即推送，调用式传输实现为脏标记 + 轮询。

use async_trait::async_trait;
use thiserror::Error;

use protocol::{ServerMessage, SlotId};

use crate::error::FatalReason;

/// 连接编号（每个适配器内部唯一）
pub type ConnId = u64;

/// 传输类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Stream,
    Call,
}

/// 客户端连接句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle {
    pub kind: TransportKind,
    pub conn: ConnId,
}

impl ClientHandle {
    pub fn new(kind: TransportKind, conn: ConnId) -> Self {
        Self { kind, conn }
    }
}

/// 投递失败
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// 对端长时间不读取，出站队列已满
    #[error("connection {conn} is not draining its outbound queue")]
    Backlog { conn: ConnId },

    #[error("connection {conn} is closed")]
    Closed { conn: ConnId },
}

impl From<DeliveryError> for FatalReason {
    fn from(err: DeliveryError) -> Self {
        FatalReason::transport("delivery", err)
    }
}

pub type DeliveryResult<T> = std::result::Result<T, DeliveryError>;

/// 投递能力
#[async_trait]
pub trait Delivery: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// 把连接绑定到席位（加入或重连认领成功后）
    fn bind(&self, slot: SlotId, conn: ConnId);

    /// 回复发起请求的连接。返回 false 表示由调用方同步带回
    async fn reply(&self, conn: ConnId, msg: ServerMessage) -> DeliveryResult<bool>;

    /// 定向消息
    async fn send_to(&self, slot: SlotId, msg: ServerMessage) -> DeliveryResult<()>;

    /// 广播给所有已加入的席位
    async fn publish(&self, msg: ServerMessage) -> DeliveryResult<()>;

    /// 发出终止通知并关闭所有连接；不会失败
    async fn close_all(&self, notice: ServerMessage);
}
