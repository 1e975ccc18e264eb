//! 会话级致命错误
//!
//! 任何一项都会让整个会话终止：没有“少一个玩家继续打”的路径。

use thiserror::Error;

use protocol::SlotId;

/// 会话终止原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalReason {
    /// 连接断开、数据损坏、探活调用失败
    #[error("transport failure ({context}): {detail}")]
    TransportFailure { context: String, detail: String },

    /// 快照读写失败
    #[error("snapshot persistence failed: {0}")]
    PersistenceFailure(String),

    /// 心跳超时
    #[error("slot {slot} missed heartbeats for {elapsed_ms} ms")]
    LivenessTimeout { slot: SlotId, elapsed_ms: u64 },
}

impl FatalReason {
    pub fn transport(context: impl Into<String>, detail: impl std::fmt::Display) -> Self {
        FatalReason::TransportFailure {
            context: context.into(),
            detail: detail.to_string(),
        }
    }
}
