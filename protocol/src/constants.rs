//! 协议常量定义

use std::time::Duration;

/// 协议版本号
pub const PROTOCOL_VERSION: u8 = 1;

/// 最少玩家数
pub const MIN_PLAYERS: usize = 2;

/// 最多玩家数
pub const MAX_PLAYERS: usize = 4;

/// 用户名最大长度
pub const MAX_USERNAME_LEN: usize = 20;

/// 聊天消息最大长度
pub const MAX_CHAT_LEN: usize = 200;

/// 触发最后一轮的分数阈值
pub const WINNING_SCORE: u32 = 20;

/// 手牌数量
pub const HAND_SIZE: usize = 3;

/// 每个公共牌堆翻开的牌数
pub const MARKET_SIZE: usize = 2;

/// 每位玩家可选的个人目标数
pub const PERSONAL_OBJECTIVE_OPTIONS: usize = 2;

/// 公共目标数
pub const SHARED_OBJECTIVES: usize = 2;

/// 对局真正结束时 `last_change_index` 的哨兵值
pub const MATCH_OVER: i64 = -1;

/// 消息帧最大大小
pub const MAX_FRAME_SIZE: usize = 65536;

/// 心跳间隔（毫秒）
pub const HEARTBEAT_INTERVAL_MS: u64 = 2000;

/// 心跳超时（毫秒）- 超过此时间无心跳则整个会话终止
pub const HEARTBEAT_TIMEOUT_MS: u64 = 10_000;

/// 调用式客户端轮询间隔（毫秒）
pub const POLL_INTERVAL_MS: u64 = 500;

/// 连接超时（秒）
pub const CONNECT_TIMEOUT_SECS: u64 = 5;

/// 心跳间隔 Duration
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(HEARTBEAT_INTERVAL_MS);

/// 心跳超时 Duration
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(HEARTBEAT_TIMEOUT_MS);

/// 轮询间隔 Duration
pub const POLL_INTERVAL: Duration = Duration::from_millis(POLL_INTERVAL_MS);

/// 连接超时 Duration
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(CONNECT_TIMEOUT_SECS);
