//! 会话状态
//!
//! 大厅、对局、心跳表、聊天记录都是这一个对象的字段，由编排器持锁访问。

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use protocol::{ChatEntry, GameInfo, RankEntry, SlotId};

use crate::delivery::ClientHandle;
use crate::game::Match;
use crate::player::{PlayerRecord, PlayerRegistry};
use crate::reconnect::ReconnectionRegistry;

/// 会话阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    LobbyAccepting,
    Setup,
    ObjectiveSelection,
    InProgress,
    FinalLap,
    Ended,
    /// 已从快照载入，等待适配器就绪
    Reloading,
    /// 等待全部玩家认领身份
    Rejoining,
}

/// 心跳表
#[derive(Debug, Default)]
pub struct HeartbeatTable {
    last_seen: HashMap<SlotId, Instant>,
}

impl HeartbeatTable {
    pub fn record(&mut self, slot: SlotId, now: Instant) {
        self.last_seen.insert(slot, now);
    }

    /// 找出最久未响应且超时的席位
    pub fn stale(&self, now: Instant, timeout: Duration) -> Option<(SlotId, Duration)> {
        self.last_seen
            .iter()
            .map(|(slot, seen)| (*slot, now.saturating_duration_since(*seen)))
            .filter(|(_, elapsed)| *elapsed > timeout)
            .max_by_key(|(_, elapsed)| *elapsed)
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }
}

/// 聊天记录
#[derive(Debug, Clone, Default)]
pub struct ChatLog {
    entries: Vec<ChatEntry>,
}

impl ChatLog {
    pub fn from_entries(entries: Vec<ChatEntry>) -> Self {
        Self { entries }
    }

    pub fn push(&mut self, from: &str, to: Option<&str>, text: &str) -> ChatEntry {
        let entry = ChatEntry {
            index: self.entries.len(),
            from: from.to_string(),
            to: to.map(str::to_string),
            text: text.to_string(),
            sent_at: Utc::now(),
        };
        self.entries.push(entry.clone());
        entry
    }

    /// 序号 >= since 且对该用户可见的记录
    pub fn visible_since(&self, username: &str, since: usize) -> Vec<ChatEntry> {
        self.entries
            .iter()
            .skip(since)
            .filter(|e| e.visible_to(username))
            .cloned()
            .collect()
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }
}

/// 会话
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub phase: SessionPhase,
    pub accepting: bool,
    /// 已认领"第一位玩家"的连接（尚未提交人数）
    pub first_handle: Option<ClientHandle>,
    /// 预期人数 N
    pub expected_players: Option<usize>,
    pub players: PlayerRegistry,
    pub objectives_chosen: BTreeSet<SlotId>,
    pub reconnect: Option<ReconnectionRegistry>,
    pub stopping: bool,
    /// 终局排名，最多计算一次
    pub ranking: Option<Arc<Vec<RankEntry>>>,
    pub game: Option<Match>,
    pub last_info: Option<GameInfo>,
    pub chat: ChatLog,
    pub heartbeats: HeartbeatTable,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            phase: SessionPhase::LobbyAccepting,
            accepting: true,
            first_handle: None,
            expected_players: None,
            players: PlayerRegistry::new(),
            objectives_chosen: BTreeSet::new(),
            reconnect: None,
            stopping: false,
            ranking: None,
            game: None,
            last_info: None,
            chat: ChatLog::default(),
            heartbeats: HeartbeatTable::default(),
        }
    }

    /// 从快照重建；全部席位未绑定，等待认领
    pub fn restore(snapshot: SessionSnapshot) -> Self {
        let players = PlayerRegistry::from_records(&snapshot.players);
        let identities = players.iter().map(|p| p.username.clone()).collect();
        Self {
            id: snapshot.session_id,
            phase: SessionPhase::Reloading,
            accepting: false,
            first_handle: None,
            expected_players: Some(snapshot.expected_players),
            players,
            objectives_chosen: snapshot.objectives_chosen.into_iter().collect(),
            reconnect: Some(ReconnectionRegistry::new(identities)),
            stopping: false,
            ranking: None,
            game: Some(snapshot.game),
            last_info: snapshot.last_info,
            chat: ChatLog::from_entries(snapshot.chat),
            heartbeats: HeartbeatTable::default(),
        }
    }

    /// 已加入的玩家数
    pub fn connected_count(&self) -> usize {
        self.players.len()
    }

    pub fn is_full(&self) -> bool {
        self.expected_players
            .is_some_and(|n| self.connected_count() >= n)
    }

    /// 对局所处的阶段（开局之后）
    pub fn match_phase(&self) -> SessionPhase {
        match &self.game {
            Some(game) if game.is_over() => SessionPhase::Ended,
            Some(game) if game.is_final_lap_armed() => SessionPhase::FinalLap,
            Some(_) if self.objectives_chosen.len() < self.players.len() => {
                SessionPhase::ObjectiveSelection
            }
            Some(_) => SessionPhase::InProgress,
            None => SessionPhase::Setup,
        }
    }

    /// 生成快照；开局前没有可保存的内容
    pub fn snapshot(&self) -> Option<SessionSnapshot> {
        let game = self.game.clone()?;
        Some(SessionSnapshot {
            session_id: self.id.clone(),
            saved_at: Utc::now(),
            expected_players: self.expected_players?,
            players: self.players.records(),
            objectives_chosen: self.objectives_chosen.iter().copied().collect(),
            game,
            last_info: self.last_info.clone(),
            chat: self.chat.entries().to_vec(),
        })
    }
}

/// 会话快照（会话 + 对局的完整序列化）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub saved_at: DateTime<Utc>,
    pub expected_players: usize,
    pub players: Vec<PlayerRecord>,
    pub objectives_chosen: Vec<SlotId>,
    pub game: Match,
    pub last_info: Option<GameInfo>,
    pub chat: Vec<ChatEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::TransportKind;
    use protocol::{Catalog, Color};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_heartbeat_stale() {
        let base = Instant::now();
        let mut table = HeartbeatTable::default();
        table.record(0, base);
        table.record(1, base + Duration::from_secs(4));

        let now = base + Duration::from_secs(10);
        assert_eq!(table.stale(now, Duration::from_secs(10)), None);
        assert_eq!(
            table.stale(now, Duration::from_secs(8)),
            Some((0, Duration::from_secs(10)))
        );
    }

    #[test]
    fn test_chat_visibility() {
        let mut chat = ChatLog::default();
        chat.push("alice", None, "hi all");
        chat.push("alice", Some("bob"), "psst");
        chat.push("carol", None, "hello");

        let bob: Vec<usize> = chat.visible_since("bob", 0).iter().map(|e| e.index).collect();
        assert_eq!(bob, vec![0, 1, 2]);
        let carol: Vec<usize> = chat.visible_since("carol", 0).iter().map(|e| e.index).collect();
        assert_eq!(carol, vec![0, 2]);
        assert_eq!(chat.visible_since("bob", 2).len(), 1);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut session = Session::new("table-1");
        assert!(session.snapshot().is_none());

        session.expected_players = Some(2);
        session
            .players
            .admit("alice", Color::Red, ClientHandle::new(TransportKind::Stream, 1));
        session
            .players
            .admit("bob", Color::Blue, ClientHandle::new(TransportKind::Call, 1));
        session.game = Some(Match::deal(2, Catalog::standard(), &mut StdRng::seed_from_u64(1)));
        session.objectives_chosen.extend([0, 1]);
        session.chat.push("bob", None, "gl");

        let snapshot = session.snapshot().unwrap();
        let restored = Session::restore(snapshot.clone());
        assert_eq!(restored.phase, SessionPhase::Reloading);
        assert!(!restored.accepting);
        assert_eq!(restored.players.records(), snapshot.players);
        assert!(restored.players.iter().all(|p| p.binding.is_none()));
        assert_eq!(restored.game, session.game);
        assert_eq!(restored.chat.entries().len(), 1);
        assert_eq!(restored.reconnect.as_ref().map(|r| r.available().len()), Some(2));
        assert_eq!(restored.match_phase(), SessionPhase::InProgress);
    }
}
