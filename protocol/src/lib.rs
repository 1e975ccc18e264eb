//! Codex Naturalis 共享协议库
//!
//! 包含:
//! - 卡牌、版图、牌堆等核心数据结构
//! - 流式传输消息 (ClientMessage, ServerMessage)
//! - 调用式传输请求/应答 (CallRequest, CallResponse, ProbeRequest)
//! - 传输层抽象 (Connector, Connection, Listener traits)
//! - 帧编解码 (FrameReader, FrameWriter)

mod board;
mod call;
mod card;
mod constants;
mod deck;
mod error;
mod message;
mod transport;

pub use board::{DeployedCard, PlayerBoard};
pub use call::{CallRequest, CallResponse, ProbeRequest, ProbeResponse};
pub use card::{Card, CardId, CardKind, Corner, CornerMask, Objective, Resource, Side};
pub use constants::*;
pub use deck::{Catalog, Deck, DeckTops, DrawPile, DrawSource};
pub use error::{validate_username, MatchError, ProtocolError, Result};
pub use message::{
    BoardChange, ChatEntry, ClientMessage, Color, ErrorCode, GameInfo, ObjectiveChoices,
    RankEntry, RejoinCandidate, RejoinData, ServerMessage, SlotId,
};
pub use transport::{
    Connection, Connector, FrameReader, FrameWriter, Listener, TcpConnection, TcpConnector,
    TcpListener,
};
