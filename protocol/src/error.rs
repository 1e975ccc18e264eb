//! 错误类型定义

use thiserror::Error;

/// 对局规则错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MatchError {
    /// 不是你的回合
    #[error("Not your turn")]
    NotYourTurn,

    /// 对局尚未进入出牌阶段
    #[error("Match is not in progress")]
    NotInProgress,

    /// 对局已结束
    #[error("Match is already over")]
    MatchOver,

    /// 无效的手牌索引
    #[error("Invalid hand index: {index}")]
    InvalidHandIndex { index: usize },

    /// 无效的已部署卡牌索引
    #[error("Invalid deployed card index: {index}")]
    InvalidDeployedIndex { index: usize },

    /// 角不可用（已被覆盖或不可见）
    #[error("Corner {corner:?} is not available on deployed card {index}")]
    CornerUnavailable { index: usize, corner: crate::Corner },

    /// 金卡放置条件未满足
    #[error("Gold card requires {required} {resource:?}, board has {available}")]
    RequirementUnmet {
        resource: crate::Resource,
        required: u8,
        available: u32,
    },

    /// 无效的抽牌位置
    #[error("Invalid draw index: {index}")]
    InvalidDrawIndex { index: usize },

    /// 抽牌位置为空
    #[error("Draw source {index} is empty")]
    EmptyDrawSource { index: usize },

    /// 无效的目标选择
    #[error("Invalid objective choice: {index}")]
    InvalidObjective { index: usize },

    /// 目标已选择
    #[error("Objective already chosen")]
    ObjectiveAlreadyChosen,

    /// 玩家不存在
    #[error("Unknown player slot: {slot}")]
    UnknownSlot { slot: u32 },
}

/// 协议错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误（bincode）
    #[error("Bincode serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// JSON 序列化错误
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// 协议版本不匹配
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u8 },

    /// 帧大小超限
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// 连接超时
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// 连接已关闭
    #[error("Connection closed")]
    ConnectionClosed,

    /// 收到了不符合调用约定的应答
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// 用户名为空
    #[error("Username is empty")]
    UsernameEmpty,

    /// 用户名过长
    #[error("Username too long: {len} chars (max: {max})")]
    UsernameTooLong { len: usize, max: usize },

    /// 对局规则错误
    #[error("Match error: {0}")]
    Match(#[from] MatchError),
}

/// 协议操作结果类型
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// 校验用户名
pub fn validate_username(username: &str) -> Result<()> {
    let trimmed = username.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::UsernameEmpty);
    }
    let len = trimmed.chars().count();
    if len > crate::MAX_USERNAME_LEN {
        return Err(ProtocolError::UsernameTooLong {
            len,
            max: crate::MAX_USERNAME_LEN,
        });
    }
    Ok(())
}
