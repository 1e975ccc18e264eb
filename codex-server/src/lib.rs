//! Codex Naturalis 会话服务端
//!
//! 包含:
//! - 会话编排（大厅、开局、回合、终局、重连）
//! - 对局状态与快照存储
//! - 流式传输与调用式传输两种适配器
//! - 调用式客户端的后台轮询

pub mod call;
pub mod call_client;
pub mod config;
pub mod delivery;
pub mod error;
pub mod game;
pub mod orchestrator;
pub mod player;
pub mod poll;
pub mod reconnect;
pub mod server;
pub mod session;
pub mod storage;
pub mod stream;

pub use call::CallServer;
pub use call_client::{CallClient, CallEvent};
pub use config::ServerConfig;
pub use error::FatalReason;
pub use game::Match;
pub use orchestrator::Orchestrator;
pub use player::{PlayerRecord, PlayerRegistry};
pub use reconnect::{ClaimOutcome, ReconnectionRegistry};
pub use server::{start, ServerHandle};
pub use session::{Session, SessionPhase, SessionSnapshot};
pub use storage::SnapshotStore;
pub use stream::{StreamHub, StreamServer};
