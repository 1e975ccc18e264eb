//! 调用式传输的请求/应答
//!
//! 一条连接上严格一问一答，服务端从不主动写帧；
//! 状态变化由客户端轮询获得。服务端探活走另一条由服务端发起的连接。

use serde::{Deserialize, Serialize};

use crate::message::{ChatEntry, ClientMessage, GameInfo, ObjectiveChoices, ServerMessage, SlotId};

/// 客户端发起的调用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallRequest {
    /// 打招呼，附带客户端探活地址
    Hello { probe_addr: Option<String> },
    /// 写操作（加入、选目标、出牌、聊天、认领身份……）
    Invoke(ClientMessage),
    /// 拉取最新广播
    PollGameInfo { slot: SlotId },
    /// 拉取个人目标选项
    FetchObjectiveChoices { slot: SlotId },
    /// 拉取聊天记录（序号 >= since）
    FetchChat { slot: SlotId, since: usize },
    /// 取走定向消息
    FetchMessages { slot: SlotId },
    /// 客户端心跳
    Heartbeat { slot: SlotId },
}

/// 服务端应答
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallResponse {
    Prompt(ServerMessage),
    Reply(Option<ServerMessage>),
    /// None 表示暂无更新
    GameInfo(Option<GameInfo>),
    Objectives(Option<ObjectiveChoices>),
    Chat(Vec<ChatEntry>),
    Messages(Vec<ServerMessage>),
    Ack,
    /// 会话已终止，之后的调用都会得到这个应答
    SessionLost { reason: String },
}

/// 服务端对客户端的探活调用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeRequest {
    Ping,
}

/// 探活应答
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeResponse {
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_serialize() {
        let request = CallRequest::FetchChat { slot: 2, since: 5 };
        let bytes = bincode::serialize(&request).unwrap();
        let decoded: CallRequest = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, request);

        let response = CallResponse::GameInfo(None);
        let bytes = bincode::serialize(&response).unwrap();
        let decoded: CallResponse = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, response);
    }
}
