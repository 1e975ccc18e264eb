//! 消息类型定义
//!
//! 两种传输共用同一套消息：流式传输直接收发 `ClientMessage`/`ServerMessage`，
//! 调用式传输把它们包在 `CallRequest`/`CallResponse` 里。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::board::PlayerBoard;
use crate::card::{Card, Corner, CornerMask, Objective, Side};
use crate::deck::DeckTops;

/// 玩家席位 ID（0..N-1）
pub type SlotId = u32;

/// 玩家颜色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Color {
    Red,
    Blue,
    Green,
    Yellow,
}

impl Color {
    /// 全部颜色（固定顺序）
    pub const ALL: [Color; 4] = [Color::Red, Color::Blue, Color::Green, Color::Yellow];
}

/// 最近一次版图变化
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardChange {
    pub slot: SlotId,
    pub card: Card,
    pub side: Side,
    pub deployed_index: usize,
    pub corner: Corner,
}

/// 每回合结束后的权威广播
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameInfo {
    /// 当前行动玩家
    pub mover: SlotId,
    /// 按席位排列的累计分数
    pub scores: Vec<u32>,
    pub last_board_change: Option<BoardChange>,
    /// 已完成回合数；对局真正结束时为 `MATCH_OVER`
    pub last_change_index: i64,
    pub deck_tops: DeckTops,
    /// 是否已进入最后一轮
    pub final_lap: bool,
}

/// 终局排名中的一项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankEntry {
    pub slot: SlotId,
    pub username: String,
    pub score: u32,
    /// 满足的目标数（0..=3）
    pub objectives: u8,
}

/// 聊天记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    /// 在会话聊天记录中的序号
    pub index: usize,
    pub from: String,
    /// 私聊接收者；公开消息为 None
    pub to: Option<String>,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

impl ChatEntry {
    /// 该消息对指定用户是否可见
    pub fn visible_to(&self, username: &str) -> bool {
        match &self.to {
            None => true,
            Some(to) => to == username || self.from == username,
        }
    }
}

/// 个人目标选项与公共目标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectiveChoices {
    pub options: Vec<Objective>,
    pub shared: Vec<Objective>,
}

/// 重载后可被认领的身份
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejoinCandidate {
    pub pick: usize,
    pub username: String,
}

/// 重新加入时下发的完整席位数据
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejoinData {
    pub slot: SlotId,
    pub username: String,
    pub color: Color,
    pub hand: Vec<Card>,
    pub board: PlayerBoard,
    pub personal_objective: Option<Objective>,
    pub shared_objectives: Vec<Objective>,
    pub game_info: Option<GameInfo>,
}

/// 客户端发送给服务端的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    // === 大厅 ===
    /// 第一位玩家加入并设定人数
    JoinAsFirst {
        username: String,
        color: Color,
        player_count: usize,
    },
    /// 其余玩家加入
    JoinAsOther { username: String, color: Color },
    /// 第一位玩家仍在设置时重新询问
    StillSettingUp,

    // === 对局 ===
    /// 选择个人目标（选项下标）
    ChooseObjective { objective_index: usize },
    /// 请求出牌（询问是否轮到自己并获取手牌）
    PlayRequest,
    /// 查询某张已部署卡牌上可用的角
    CardCoupleChoice { deployed_index: usize },
    /// 提交回合
    SubmitTurn {
        hand_index: usize,
        /// 背面朝上放置时无需满足金卡条件
        side: Side,
        deployed_index: usize,
        corner: Corner,
        draw_index: usize,
    },

    // === 聊天 ===
    ChatPublic { text: String },
    ChatPrivate { to_username: String, text: String },

    // === 重连 ===
    /// 认领重载前的身份
    Rejoin { pick: usize },

    // === 心跳 ===
    Ping,
}

/// 服务端发送给客户端的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    // === 大厅 ===
    /// 你是第一位玩家，请设定人数
    FirstPlayerPrompt,
    /// 请选择用户名和颜色
    GeneralPlayerPrompt {
        remaining_colors: Vec<Color>,
        taken_names: Vec<String>,
    },
    /// 第一位玩家仍在设置，稍后再试
    StillSettingUp,
    /// 大厅已满
    LobbyFull,
    /// 用户名或颜色冲突
    NameOrColorConflict {
        remaining_colors: Vec<Color>,
        taken_names: Vec<String>,
    },
    /// 加入成功
    Joined { slot: SlotId },

    // === 对局 ===
    /// 个人目标选项
    ObjectiveChoices(ObjectiveChoices),
    /// 目标选择已接受
    ObjectiveAccepted,
    /// 轮到你出牌
    YourTurn { hand: Vec<Card> },
    /// 可用角
    AvailableCorners { deployed_index: usize, corners: CornerMask },
    /// 回合已接受
    TurnAccepted { drawn: Option<Card> },
    /// 对局状态广播
    GameInfo(GameInfo),
    /// 终局排名
    EndOfMatch { ranking: Vec<RankEntry> },

    // === 重连 ===
    /// 请认领一个身份
    RejoinPrompt { available: Vec<RejoinCandidate> },
    /// 认领失败
    RejoinRejected { available: Vec<RejoinCandidate> },
    /// 认领成功后的完整数据
    RejoinData(Box<RejoinData>),

    // === 聊天 ===
    Chat(ChatEntry),

    // === 心跳 ===
    /// 服务端主动探活
    Heartbeat,
    /// 心跳响应
    Pong,

    // === 终止 ===
    /// 会话已终止
    SessionLost { reason: String },
    /// 错误消息
    Error { code: ErrorCode, message: String },
}

/// 错误码定义
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    // === 大厅相关 (1xx) ===
    /// 尚未加入
    NotJoined = 100,
    /// 已经加入
    AlreadyJoined = 101,
    /// 无效人数
    InvalidPlayerCount = 102,
    /// 当前阶段不允许该操作
    WrongPhase = 103,

    // === 对局相关 (2xx) ===
    /// 不是你的回合
    NotYourTurn = 200,
    /// 无效出牌
    InvalidMove = 201,
    /// 无效目标选择
    InvalidObjective = 202,
    /// 对局已结束
    MatchAlreadyOver = 203,

    // === 玩家相关 (3xx) ===
    /// 无效用户名
    InvalidUsername = 300,
    /// 玩家不存在
    PlayerNotFound = 301,
    /// 无效聊天内容
    InvalidChat = 302,

    // === 系统相关 (5xx) ===
    /// 内部错误
    InternalError = 500,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl ServerMessage {
    /// 构造错误消息
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
        }
    }
}
