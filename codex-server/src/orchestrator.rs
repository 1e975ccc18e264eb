//! 会话编排
//!
//! 唯一决定"何时开局、何时重开、何时结束"的组件，也是唯一向两种传输扇出广播的组件。
//! 所有会改变会话的操作都在同一把会话锁下完成，包括致命错误的处理。

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use protocol::{
    validate_username, Catalog, ChatEntry, ClientMessage, Color, Corner, ErrorCode, MatchError,
    RankEntry, RejoinData, ServerMessage, Side, SlotId, MAX_CHAT_LEN, MAX_PLAYERS, MIN_PLAYERS,
};

use crate::delivery::{ClientHandle, Delivery, DeliveryError, TransportKind};
use crate::error::FatalReason;
use crate::game::{rank, Match};
use crate::reconnect::ClaimOutcome;
use crate::session::{Session, SessionPhase};
use crate::storage::SnapshotStore;

/// 待发送的消息（按产生顺序投递）
enum Envelope {
    To(SlotId, ServerMessage),
    All(ServerMessage),
}

struct PendingMessages {
    envelopes: Vec<Envelope>,
}

impl PendingMessages {
    fn new() -> Self {
        Self {
            envelopes: Vec::new(),
        }
    }

    fn send(&mut self, slot: SlotId, msg: ServerMessage) {
        self.envelopes.push(Envelope::To(slot, msg));
    }

    fn broadcast(&mut self, msg: ServerMessage) {
        self.envelopes.push(Envelope::All(msg));
    }

    async fn flush(self, deliveries: &[Arc<dyn Delivery>]) -> Result<(), DeliveryError> {
        for envelope in self.envelopes {
            match envelope {
                Envelope::To(slot, msg) => {
                    for delivery in deliveries {
                        delivery.send_to(slot, msg.clone()).await?;
                    }
                }
                Envelope::All(msg) => {
                    for delivery in deliveries {
                        delivery.publish(msg.clone()).await?;
                    }
                }
            }
        }
        Ok(())
    }
}

type Handled = Result<Option<ServerMessage>, FatalReason>;

/// 会话编排器
pub struct Orchestrator {
    session: Mutex<Session>,
    deliveries: Vec<Arc<dyn Delivery>>,
    storage: SnapshotStore,
    catalog: Catalog,
    seed: Option<u64>,
    shutdown: watch::Sender<Option<FatalReason>>,
}

impl Orchestrator {
    pub fn new(
        session: Session,
        deliveries: Vec<Arc<dyn Delivery>>,
        storage: SnapshotStore,
        seed: Option<u64>,
    ) -> Self {
        let (shutdown, _) = watch::channel(None);
        Self {
            session: Mutex::new(session),
            deliveries,
            storage,
            catalog: Catalog::standard(),
            seed,
            shutdown,
        }
    }

    /// 致命错误信号；值变为 Some 时会话已终止
    pub fn shutdown_signal(&self) -> watch::Receiver<Option<FatalReason>> {
        self.shutdown.subscribe()
    }

    pub fn fatal_reason(&self) -> Option<FatalReason> {
        self.shutdown.borrow().clone()
    }

    pub async fn is_stopping(&self) -> bool {
        self.session.lock().await.stopping
    }

    pub async fn phase(&self) -> SessionPhase {
        self.session.lock().await.phase
    }

    pub async fn slot_of(&self, handle: ClientHandle) -> Option<SlotId> {
        self.session.lock().await.players.slot_for(handle)
    }

    /// 已加入的玩家数
    pub async fn connected_count(&self) -> usize {
        self.session.lock().await.connected_count()
    }

    fn lost_notice(&self) -> ServerMessage {
        ServerMessage::SessionLost {
            reason: self
                .fatal_reason()
                .map(|r| r.to_string())
                .unwrap_or_else(|| "session stopped".to_string()),
        }
    }

    // ========================================================================
    // 大厅
    // ========================================================================

    /// 新连接的问候
    pub async fn greet(&self, handle: ClientHandle) -> ServerMessage {
        let mut session = self.session.lock().await;
        self.greet_locked(&mut session, handle)
    }

    fn greet_locked(&self, s: &mut Session, handle: ClientHandle) -> ServerMessage {
        if s.stopping {
            return self.lost_notice();
        }
        if matches!(s.phase, SessionPhase::Reloading | SessionPhase::Rejoining) {
            let available = s
                .reconnect
                .as_ref()
                .map(|r| r.available())
                .unwrap_or_default();
            return ServerMessage::RejoinPrompt { available };
        }
        if !s.accepting {
            return ServerMessage::LobbyFull;
        }
        match (s.first_handle, s.expected_players) {
            (None, None) => {
                s.first_handle = Some(handle);
                debug!("连接 {:?} 成为第一位玩家", handle);
                ServerMessage::FirstPlayerPrompt
            }
            (Some(first), None) if first == handle => ServerMessage::FirstPlayerPrompt,
            (_, None) => ServerMessage::StillSettingUp,
            (_, Some(_)) if s.is_full() => ServerMessage::LobbyFull,
            (_, Some(_)) => ServerMessage::GeneralPlayerPrompt {
                remaining_colors: s.players.remaining_colors(),
                taken_names: s.players.taken_names(),
            },
        }
    }

    /// 处理客户端消息；返回值是需要由调用方同步带回的回复
    pub async fn handle(&self, handle: ClientHandle, msg: ClientMessage) -> Option<ServerMessage> {
        let mut session = self.session.lock().await;
        if session.stopping {
            return Some(self.lost_notice());
        }

        let mut pending = PendingMessages::new();
        let s = &mut *session;
        let result = match msg {
            ClientMessage::JoinAsFirst {
                username,
                color,
                player_count,
            } => self.handle_join_first(s, &mut pending, handle, &username, color, player_count),
            ClientMessage::JoinAsOther { username, color } => {
                self.handle_join_other(s, &mut pending, handle, &username, color)
            }
            ClientMessage::StillSettingUp => Ok(Some(self.greet_locked(s, handle))),
            ClientMessage::ChooseObjective { objective_index } => {
                self.handle_choose_objective(s, &mut pending, handle, objective_index)
            }
            ClientMessage::PlayRequest => Ok(Some(Self::handle_play_request(s, handle))),
            ClientMessage::CardCoupleChoice { deployed_index } => {
                Ok(Some(Self::handle_card_couple(s, handle, deployed_index)))
            }
            ClientMessage::SubmitTurn {
                hand_index,
                side,
                deployed_index,
                corner,
                draw_index,
            } => self.handle_submit_turn(
                s,
                &mut pending,
                handle,
                hand_index,
                side,
                deployed_index,
                corner,
                draw_index,
            ),
            ClientMessage::ChatPublic { text } => {
                Ok(Self::handle_chat(s, &mut pending, handle, None, &text))
            }
            ClientMessage::ChatPrivate { to_username, text } => Ok(Self::handle_chat(
                s,
                &mut pending,
                handle,
                Some(&to_username),
                &text,
            )),
            ClientMessage::Rejoin { pick } => Ok(self.handle_rejoin(s, &mut pending, handle, pick)),
            ClientMessage::Ping => Ok(Some(ServerMessage::Pong)),
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(reason) => {
                self.fatal_locked(&mut session, reason).await;
                return Some(self.lost_notice());
            }
        };

        // 先回复请求方，再投递其余消息
        let reply = match reply {
            Some(msg) => match self.deliver_reply(handle, msg).await {
                Ok(reply) => reply,
                Err(e) if session.players.slot_for(handle).is_some() => {
                    self.fatal_locked(&mut session, e.into()).await;
                    return None;
                }
                Err(e) => {
                    debug!("回复未加入的连接失败: {}", e);
                    None
                }
            },
            None => None,
        };

        if let Err(e) = pending.flush(&self.deliveries).await {
            self.fatal_locked(&mut session, e.into()).await;
            return None;
        }

        reply
    }

    async fn deliver_reply(
        &self,
        handle: ClientHandle,
        msg: ServerMessage,
    ) -> Result<Option<ServerMessage>, DeliveryError> {
        match self.delivery_for(handle.kind) {
            Some(delivery) => {
                if delivery.reply(handle.conn, msg.clone()).await? {
                    Ok(None)
                } else {
                    Ok(Some(msg))
                }
            }
            None => Ok(Some(msg)),
        }
    }

    fn delivery_for(&self, kind: TransportKind) -> Option<&Arc<dyn Delivery>> {
        self.deliveries.iter().find(|d| d.kind() == kind)
    }

    fn bind_slot(&self, s: &mut Session, slot: SlotId, handle: ClientHandle) {
        if let Some(delivery) = self.delivery_for(handle.kind) {
            delivery.bind(slot, handle.conn);
        }
        if handle.kind == TransportKind::Call {
            s.heartbeats.record(slot, Instant::now());
        }
    }

    fn handle_join_first(
        &self,
        s: &mut Session,
        pending: &mut PendingMessages,
        handle: ClientHandle,
        username: &str,
        color: Color,
        player_count: usize,
    ) -> Handled {
        if s.players.slot_for(handle).is_some() {
            return Ok(Some(ServerMessage::error(ErrorCode::AlreadyJoined, "已经加入")));
        }
        if !s.accepting || s.expected_players.is_some() || s.first_handle != Some(handle) {
            return Ok(Some(ServerMessage::error(
                ErrorCode::WrongPhase,
                "只有第一位玩家可以设定人数",
            )));
        }
        if !(MIN_PLAYERS..=MAX_PLAYERS).contains(&player_count) {
            return Ok(Some(ServerMessage::error(
                ErrorCode::InvalidPlayerCount,
                format!("人数必须在 {} 到 {} 之间", MIN_PLAYERS, MAX_PLAYERS),
            )));
        }
        if let Err(e) = validate_username(username) {
            return Ok(Some(ServerMessage::error(ErrorCode::InvalidUsername, e.to_string())));
        }

        s.expected_players = Some(player_count);
        let slot = s.players.admit(username, color, handle);
        self.bind_slot(s, slot, handle);
        info!(
            "玩家 {} 以席位 {} 创建对局，人数 {}",
            username.trim(),
            slot,
            player_count
        );

        self.try_start_match(s, pending);
        Ok(Some(ServerMessage::Joined { slot }))
    }

    fn handle_join_other(
        &self,
        s: &mut Session,
        pending: &mut PendingMessages,
        handle: ClientHandle,
        username: &str,
        color: Color,
    ) -> Handled {
        if s.players.slot_for(handle).is_some() {
            return Ok(Some(ServerMessage::error(ErrorCode::AlreadyJoined, "已经加入")));
        }
        if s.expected_players.is_none() && s.accepting {
            return Ok(Some(ServerMessage::StillSettingUp));
        }
        if !s.accepting || s.is_full() {
            return Ok(Some(ServerMessage::LobbyFull));
        }
        if let Err(e) = validate_username(username) {
            return Ok(Some(ServerMessage::error(ErrorCode::InvalidUsername, e.to_string())));
        }
        if let Err(conflict) = s.players.check_available(username, color) {
            debug!("加入冲突: {:?}", conflict);
            return Ok(Some(ServerMessage::NameOrColorConflict {
                remaining_colors: s.players.remaining_colors(),
                taken_names: s.players.taken_names(),
            }));
        }

        let slot = s.players.admit(username, color, handle);
        self.bind_slot(s, slot, handle);
        info!(
            "玩家 {} 加入席位 {} ({}/{})",
            username.trim(),
            slot,
            s.connected_count(),
            s.expected_players.unwrap_or_default()
        );

        self.try_start_match(s, pending);
        Ok(Some(ServerMessage::Joined { slot }))
    }

    // ========================================================================
    // 开局 / 重开
    // ========================================================================

    /// 人数到齐时开局：发牌、随机先手、下发目标选项并做首次广播
    fn try_start_match(&self, s: &mut Session, pending: &mut PendingMessages) {
        let Some(expected) = s.expected_players else {
            return;
        };
        if !s.accepting || s.connected_count() != expected {
            return;
        }

        s.accepting = false;
        s.phase = SessionPhase::Setup;
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let game = Match::deal(expected, self.catalog.clone(), &mut rng);
        info!("{} 名玩家到齐，开局，先手席位 {}", expected, game.current_mover());

        for slot in 0..expected as SlotId {
            if let Ok(choices) = game.objective_choices(slot) {
                pending.send(slot, ServerMessage::ObjectiveChoices(choices));
            }
        }
        let info = game.game_info();
        s.last_info = Some(info.clone());
        s.game = Some(game);
        s.phase = SessionPhase::ObjectiveSelection;
        pending.broadcast(ServerMessage::GameInfo(info));
    }

    /// 全部身份认领后重开
    fn try_restart_match(&self, s: &mut Session, pending: &mut PendingMessages) {
        if !s.reconnect.as_ref().is_some_and(|r| r.is_complete()) {
            return;
        }
        s.reconnect = None;
        s.phase = s.match_phase();
        info!("全部玩家已重新加入，会话 {} 继续，阶段 {:?}", s.id, s.phase);

        let Some(game) = s.game.as_ref() else {
            return;
        };
        let info = s.last_info.clone().unwrap_or_else(|| game.game_info());
        pending.broadcast(ServerMessage::GameInfo(info));

        match s.phase {
            SessionPhase::ObjectiveSelection => {
                for slot in 0..game.player_count() as SlotId {
                    if s.objectives_chosen.contains(&slot) {
                        continue;
                    }
                    if let Ok(choices) = game.objective_choices(slot) {
                        pending.send(slot, ServerMessage::ObjectiveChoices(choices));
                    }
                }
            }
            SessionPhase::Ended => {
                let ranking = Self::compute_ranking(s);
                pending.broadcast(ServerMessage::EndOfMatch {
                    ranking: ranking.as_ref().clone(),
                });
            }
            _ => Self::prompt_mover(s, pending),
        }
    }

    fn prompt_mover(s: &Session, pending: &mut PendingMessages) {
        if let Some(game) = s.game.as_ref() {
            let mover = game.current_mover();
            if let Ok(player) = game.player(mover) {
                pending.send(
                    mover,
                    ServerMessage::YourTurn {
                        hand: player.hand.clone(),
                    },
                );
            }
        }
    }

    // ========================================================================
    // 对局
    // ========================================================================

    fn handle_choose_objective(
        &self,
        s: &mut Session,
        pending: &mut PendingMessages,
        handle: ClientHandle,
        objective_index: usize,
    ) -> Handled {
        let Some(slot) = s.players.slot_for(handle) else {
            return Ok(Some(ServerMessage::error(ErrorCode::NotJoined, "尚未加入")));
        };
        if s.phase != SessionPhase::ObjectiveSelection {
            return Ok(Some(ServerMessage::error(ErrorCode::WrongPhase, "当前不能选择目标")));
        }
        let Some(game) = s.game.as_mut() else {
            return Ok(Some(ServerMessage::error(ErrorCode::WrongPhase, "对局尚未开始")));
        };
        if let Err(e) = game.choose_objective(slot, objective_index) {
            return Ok(Some(ServerMessage::error(ErrorCode::InvalidObjective, e.to_string())));
        }
        s.objectives_chosen.insert(slot);
        debug!(
            "席位 {} 已选择目标 ({}/{})",
            slot,
            s.objectives_chosen.len(),
            s.players.len()
        );

        if s.game.as_ref().is_some_and(Match::all_objectives_chosen) {
            info!("目标选择完成，进入出牌阶段");
            s.phase = SessionPhase::InProgress;
            self.on_turn_completed(s, pending)?;
        }
        Ok(Some(ServerMessage::ObjectiveAccepted))
    }

    fn handle_play_request(s: &Session, handle: ClientHandle) -> ServerMessage {
        let slot = match Self::playing_slot(s, handle) {
            Ok(slot) => slot,
            Err(msg) => return msg,
        };
        let Some(game) = s.game.as_ref() else {
            return ServerMessage::error(ErrorCode::WrongPhase, "对局尚未开始");
        };
        if game.current_mover() != slot {
            return ServerMessage::error(ErrorCode::NotYourTurn, "不是你的回合");
        }
        match game.player(slot) {
            Ok(player) => ServerMessage::YourTurn {
                hand: player.hand.clone(),
            },
            Err(e) => ServerMessage::error(ErrorCode::InternalError, e.to_string()),
        }
    }

    fn handle_card_couple(s: &Session, handle: ClientHandle, deployed_index: usize) -> ServerMessage {
        let slot = match Self::playing_slot(s, handle) {
            Ok(slot) => slot,
            Err(msg) => return msg,
        };
        let Some(game) = s.game.as_ref() else {
            return ServerMessage::error(ErrorCode::WrongPhase, "对局尚未开始");
        };
        match game.compute_available_placements(slot, deployed_index) {
            Ok(corners) => ServerMessage::AvailableCorners {
                deployed_index,
                corners,
            },
            Err(e) => ServerMessage::error(ErrorCode::InvalidMove, e.to_string()),
        }
    }

    /// 出牌阶段内已加入的席位
    fn playing_slot(s: &Session, handle: ClientHandle) -> Result<SlotId, ServerMessage> {
        let Some(slot) = s.players.slot_for(handle) else {
            return Err(ServerMessage::error(ErrorCode::NotJoined, "尚未加入"));
        };
        match s.phase {
            SessionPhase::InProgress | SessionPhase::FinalLap => Ok(slot),
            SessionPhase::Ended => Err(ServerMessage::error(
                ErrorCode::MatchAlreadyOver,
                "对局已结束",
            )),
            _ => Err(ServerMessage::error(ErrorCode::WrongPhase, "对局尚未进入出牌阶段")),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_submit_turn(
        &self,
        s: &mut Session,
        pending: &mut PendingMessages,
        handle: ClientHandle,
        hand_index: usize,
        side: Side,
        deployed_index: usize,
        corner: Corner,
        draw_index: usize,
    ) -> Handled {
        let slot = match Self::playing_slot(s, handle) {
            Ok(slot) => slot,
            Err(msg) => return Ok(Some(msg)),
        };
        let Some(game) = s.game.as_mut() else {
            return Ok(Some(ServerMessage::error(ErrorCode::WrongPhase, "对局尚未开始")));
        };

        let outcome = match game.apply_turn(
            slot,
            hand_index,
            side,
            deployed_index,
            corner,
            draw_index,
        ) {
            Ok(outcome) => outcome,
            Err(MatchError::NotYourTurn) => {
                warn!("席位 {} 在非自己回合提交出牌", slot);
                return Ok(Some(ServerMessage::error(ErrorCode::NotYourTurn, "不是你的回合")));
            }
            Err(MatchError::MatchOver) => {
                return Ok(Some(ServerMessage::error(
                    ErrorCode::MatchAlreadyOver,
                    "对局已结束",
                )));
            }
            Err(e) => {
                return Ok(Some(ServerMessage::error(ErrorCode::InvalidMove, e.to_string())));
            }
        };

        info!(
            "席位 {} 完成回合，得分 {:?}",
            slot,
            game.current_scores()
        );
        if outcome.final_lap_armed {
            info!("席位 {} 触发最后一轮", slot);
        }

        self.on_turn_completed(s, pending)?;
        Ok(Some(ServerMessage::TurnAccepted {
            drawn: outcome.drawn,
        }))
    }

    /// 回合结束：重算广播、持久化、扇出；对局真正结束时计算并缓存排名（仅一次）
    fn on_turn_completed(&self, s: &mut Session, pending: &mut PendingMessages) -> Result<(), FatalReason> {
        let Some(game) = s.game.as_ref() else {
            return Ok(());
        };
        let info = game.game_info();
        let over = game.is_over();
        s.last_info = Some(info.clone());
        s.phase = s.match_phase();
        pending.broadcast(ServerMessage::GameInfo(info));

        self.persist(s)?;

        if over {
            if s.ranking.is_none() {
                let ranking = Self::compute_ranking(s);
                info!("对局结束，排名: {:?}", ranking);
                pending.broadcast(ServerMessage::EndOfMatch {
                    ranking: ranking.as_ref().clone(),
                });
            }
        } else {
            Self::prompt_mover(s, pending);
        }
        Ok(())
    }

    fn persist(&self, s: &Session) -> Result<(), FatalReason> {
        let Some(snapshot) = s.snapshot() else {
            return Ok(());
        };
        self.storage
            .save(&snapshot)
            .map_err(|e| FatalReason::PersistenceFailure(format!("{:#}", e)))
    }

    /// 终局排名；已计算过则返回缓存
    fn compute_ranking(s: &mut Session) -> Arc<Vec<RankEntry>> {
        if let Some(ranking) = &s.ranking {
            return Arc::clone(ranking);
        }
        let standings = s
            .game
            .as_ref()
            .map(Match::final_standings)
            .unwrap_or_default();
        let usernames: Vec<String> = s.players.iter().map(|p| p.username.clone()).collect();
        let ranking = Arc::new(rank(&standings, &usernames));
        s.ranking = Some(Arc::clone(&ranking));
        ranking
    }

    /// 缓存的终局排名
    pub async fn ranking(&self) -> Option<Arc<Vec<RankEntry>>> {
        self.session.lock().await.ranking.clone()
    }

    // ========================================================================
    // 聊天
    // ========================================================================

    fn handle_chat(
        s: &mut Session,
        pending: &mut PendingMessages,
        handle: ClientHandle,
        to: Option<&str>,
        text: &str,
    ) -> Option<ServerMessage> {
        let Some(slot) = s.players.slot_for(handle) else {
            return Some(ServerMessage::error(ErrorCode::NotJoined, "尚未加入"));
        };
        let text = text.trim();
        if text.is_empty() || text.chars().count() > MAX_CHAT_LEN {
            return Some(ServerMessage::error(
                ErrorCode::InvalidChat,
                format!("聊天内容必须为 1 到 {} 个字符", MAX_CHAT_LEN),
            ));
        }
        let from = s.players.get(slot).map(|p| p.username.clone()).unwrap_or_default();

        match to {
            None => {
                let entry = s.chat.push(&from, None, text);
                pending.broadcast(ServerMessage::Chat(entry));
            }
            Some(to) => {
                let Some(recipient) = s.players.find_by_username(to) else {
                    return Some(ServerMessage::error(
                        ErrorCode::PlayerNotFound,
                        format!("玩家不存在: {}", to),
                    ));
                };
                let (recipient_slot, recipient_name) = (recipient.id, recipient.username.clone());
                let entry = s.chat.push(&from, Some(&recipient_name), text);
                pending.send(recipient_slot, ServerMessage::Chat(entry.clone()));
                if recipient_slot != slot {
                    pending.send(slot, ServerMessage::Chat(entry));
                }
            }
        }
        None
    }

    /// 调用式客户端拉取聊天记录
    pub async fn chat_backlog(&self, slot: SlotId, since: usize) -> Vec<ChatEntry> {
        let session = self.session.lock().await;
        match session.players.get(slot) {
            Some(player) => session.chat.visible_since(&player.username, since),
            None => Vec::new(),
        }
    }

    // ========================================================================
    // 重连
    // ========================================================================

    /// 适配器就绪后开始接受身份认领
    pub async fn begin_rejoining(&self) {
        let mut session = self.session.lock().await;
        if session.phase == SessionPhase::Reloading {
            session.phase = SessionPhase::Rejoining;
            info!("会话 {} 等待玩家重新加入", session.id);
        }
    }

    fn handle_rejoin(
        &self,
        s: &mut Session,
        pending: &mut PendingMessages,
        handle: ClientHandle,
        pick: usize,
    ) -> Option<ServerMessage> {
        if !matches!(s.phase, SessionPhase::Reloading | SessionPhase::Rejoining) {
            return Some(ServerMessage::error(ErrorCode::WrongPhase, "当前不需要重新加入"));
        }
        if s.players.slot_for(handle).is_some() {
            return Some(ServerMessage::error(ErrorCode::AlreadyJoined, "已经加入"));
        }
        let Some(registry) = s.reconnect.as_mut() else {
            return Some(ServerMessage::error(ErrorCode::WrongPhase, "当前不需要重新加入"));
        };

        let (slot, username) = match registry.claim(pick) {
            ClaimOutcome::Claimed { slot, username } => (slot, username),
            ClaimOutcome::Rejected { available } => {
                debug!("身份 {} 认领失败", pick);
                return Some(ServerMessage::RejoinRejected { available });
            }
        };
        s.players.rebind(slot, handle);
        self.bind_slot(s, slot, handle);
        info!(
            "{} 重新认领席位 {} ({}/{})",
            username,
            slot,
            s.reconnect.as_ref().map(|r| r.rejoined_count()).unwrap_or_default(),
            s.players.len()
        );

        let data = match (s.game.as_ref(), s.players.get(slot)) {
            (Some(game), Some(player)) => game.player(slot).ok().map(|state| RejoinData {
                slot,
                username,
                color: player.color,
                hand: state.hand.clone(),
                board: state.board.clone(),
                personal_objective: state.objective,
                shared_objectives: game.shared_objectives().to_vec(),
                game_info: s.last_info.clone(),
            }),
            _ => None,
        };
        self.try_restart_match(s, pending);
        data.map(|d| ServerMessage::RejoinData(Box::new(d)))
    }

    // ========================================================================
    // 存活检测与致命错误
    // ========================================================================

    /// 记录调用式客户端心跳
    pub async fn record_heartbeat(&self, slot: SlotId) {
        let mut session = self.session.lock().await;
        if session.players.get(slot).is_some() {
            session.heartbeats.record(slot, Instant::now());
        }
    }

    /// 心跳巡检；发现超时则终止会话，返回是否已终止
    pub async fn sweep_heartbeats(&self, timeout: Duration) -> bool {
        let mut session = self.session.lock().await;
        if session.stopping {
            return true;
        }
        if session.phase == SessionPhase::Ended {
            return false;
        }
        if let Some((slot, elapsed)) = session.heartbeats.stale(Instant::now(), timeout) {
            let reason = FatalReason::LivenessTimeout {
                slot,
                elapsed_ms: elapsed.as_millis() as u64,
            };
            self.fatal_locked(&mut session, reason).await;
            return true;
        }
        false
    }

    /// 连接断开。已加入的席位断开即终止会话
    pub async fn connection_lost(&self, handle: ClientHandle, detail: String) {
        let mut session = self.session.lock().await;
        if session.stopping {
            return;
        }
        if session.first_handle == Some(handle) && session.expected_players.is_none() {
            session.first_handle = None;
            debug!("第一位玩家在设定人数前断开，空出第一席");
            return;
        }
        let Some(slot) = session.players.slot_for(handle) else {
            debug!("未加入的连接 {:?} 断开", handle);
            return;
        };
        if session.phase == SessionPhase::Ended {
            info!("对局已结束，席位 {} 离开", slot);
            return;
        }
        let reason = FatalReason::transport(format!("slot {}", slot), detail);
        self.fatal_locked(&mut session, reason).await;
    }

    /// 终止会话
    pub async fn fatal(&self, reason: FatalReason) {
        let mut session = self.session.lock().await;
        self.fatal_locked(&mut session, reason).await;
    }

    async fn fatal_locked(&self, s: &mut MutexGuard<'_, Session>, reason: FatalReason) {
        if s.stopping {
            return;
        }
        s.stopping = true;
        error!("会话 {} 终止: {}", s.id, reason);

        let notice = ServerMessage::SessionLost {
            reason: reason.to_string(),
        };
        for delivery in &self.deliveries {
            delivery.close_all(notice.clone()).await;
        }
        self.shutdown.send_replace(Some(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{ConnId, DeliveryResult};
    use crate::poll::PollHub;
    use async_trait::async_trait;
    use protocol::MATCH_OVER;
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    /// 记录所有投递的流式传输替身
    #[derive(Default)]
    struct RecordingDelivery {
        bound: StdMutex<Vec<(SlotId, ConnId)>>,
        sent: StdMutex<Vec<(Option<SlotId>, ServerMessage)>>,
        replies: StdMutex<Vec<(ConnId, ServerMessage)>>,
        closed: StdMutex<Option<ServerMessage>>,
    }

    impl RecordingDelivery {
        fn sent_to(&self, slot: SlotId) -> Vec<ServerMessage> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(to, _)| to.is_none() || *to == Some(slot))
                .map(|(_, msg)| msg.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Delivery for RecordingDelivery {
        fn kind(&self) -> TransportKind {
            TransportKind::Stream
        }

        fn bind(&self, slot: SlotId, conn: ConnId) {
            self.bound.lock().unwrap().push((slot, conn));
        }

        async fn reply(&self, conn: ConnId, msg: ServerMessage) -> DeliveryResult<bool> {
            self.replies.lock().unwrap().push((conn, msg));
            Ok(true)
        }

        async fn send_to(&self, slot: SlotId, msg: ServerMessage) -> DeliveryResult<()> {
            if self.bound.lock().unwrap().iter().any(|(s, _)| *s == slot) {
                self.sent.lock().unwrap().push((Some(slot), msg));
            }
            Ok(())
        }

        async fn publish(&self, msg: ServerMessage) -> DeliveryResult<()> {
            self.sent.lock().unwrap().push((None, msg));
            Ok(())
        }

        async fn close_all(&self, notice: ServerMessage) {
            *self.closed.lock().unwrap() = Some(notice);
        }
    }

    struct Fixture {
        orchestrator: Orchestrator,
        stream: Arc<RecordingDelivery>,
        poll: Arc<PollHub>,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let storage = SnapshotStore::at(dir.path()).unwrap();
        fixture_with(Session::new("test"), storage, dir)
    }

    fn fixture_with(session: Session, storage: SnapshotStore, dir: TempDir) -> Fixture {
        let stream = Arc::new(RecordingDelivery::default());
        let poll = Arc::new(PollHub::new());
        let deliveries: Vec<Arc<dyn Delivery>> = vec![stream.clone(), poll.clone()];
        Fixture {
            orchestrator: Orchestrator::new(session, deliveries, storage, Some(11)),
            stream,
            poll,
            _dir: dir,
        }
    }

    fn stream(conn: ConnId) -> ClientHandle {
        ClientHandle::new(TransportKind::Stream, conn)
    }

    fn call(conn: ConnId) -> ClientHandle {
        ClientHandle::new(TransportKind::Call, conn)
    }

    /// 以 n 个连接加入（前一半流式，后一半调用式）
    async fn fill_lobby(f: &Fixture, n: usize) -> Vec<ClientHandle> {
        let handles: Vec<ClientHandle> = (0..n as u64)
            .map(|i| if i % 2 == 0 { stream(i) } else { call(i) })
            .collect();

        assert_eq!(
            f.orchestrator.greet(handles[0]).await,
            ServerMessage::FirstPlayerPrompt
        );
        let reply = f
            .orchestrator
            .handle(
                handles[0],
                ClientMessage::JoinAsFirst {
                    username: "p0".into(),
                    color: Color::ALL[0],
                    player_count: n,
                },
            )
            .await;
        assert_eq!(reply, None);
        assert_eq!(
            f.stream.replies.lock().unwrap().last(),
            Some(&(0, ServerMessage::Joined { slot: 0 }))
        );

        for (i, handle) in handles.iter().enumerate().skip(1) {
            assert!(matches!(
                f.orchestrator.greet(*handle).await,
                ServerMessage::GeneralPlayerPrompt { .. }
            ));
            let reply = f
                .orchestrator
                .handle(
                    *handle,
                    ClientMessage::JoinAsOther {
                        username: format!("p{}", i),
                        color: Color::ALL[i],
                    },
                )
                .await;
            // 调用式连接的回复同步带回
            let expected = match handle.kind {
                TransportKind::Call => Some(ServerMessage::Joined { slot: i as SlotId }),
                TransportKind::Stream => None,
            };
            assert_eq!(reply, expected);
        }
        handles
    }

    async fn choose_all_objectives(f: &Fixture, handles: &[ClientHandle]) {
        for handle in handles {
            f.orchestrator
                .handle(*handle, ClientMessage::ChooseObjective { objective_index: 0 })
                .await;
        }
    }

    #[tokio::test]
    async fn test_match_starts_exactly_at_n() {
        for n in MIN_PLAYERS..=MAX_PLAYERS {
            let f = fixture();
            let handles = fill_lobby(&f, n).await;
            assert_eq!(f.orchestrator.connected_count().await, n);
            assert_eq!(f.orchestrator.phase().await, SessionPhase::ObjectiveSelection);

            // 第 N+1 个连接无法加入
            let extra = call(99);
            assert_eq!(f.orchestrator.greet(extra).await, ServerMessage::LobbyFull);
            let reply = f
                .orchestrator
                .handle(
                    extra,
                    ClientMessage::JoinAsOther {
                        username: "late".into(),
                        color: Color::Yellow,
                    },
                )
                .await;
            assert_eq!(reply, Some(ServerMessage::LobbyFull));
            assert_eq!(f.orchestrator.connected_count().await, n);

            for (slot, handle) in handles.iter().enumerate() {
                assert_eq!(f.orchestrator.slot_of(*handle).await, Some(slot as SlotId));
            }
        }
    }

    #[tokio::test]
    async fn test_match_does_not_start_early() {
        let f = fixture();
        f.orchestrator.greet(stream(0)).await;
        f.orchestrator
            .handle(
                stream(0),
                ClientMessage::JoinAsFirst {
                    username: "alice".into(),
                    color: Color::Red,
                    player_count: 3,
                },
            )
            .await;
        f.orchestrator
            .handle(
                stream(1),
                ClientMessage::JoinAsOther {
                    username: "bob".into(),
                    color: Color::Blue,
                },
            )
            .await;
        assert_eq!(f.orchestrator.phase().await, SessionPhase::LobbyAccepting);
        assert_eq!(f.orchestrator.connected_count().await, 2);
    }

    #[tokio::test]
    async fn test_lobby_prompts_and_conflicts() {
        let f = fixture();
        assert_eq!(f.orchestrator.greet(stream(0)).await, ServerMessage::FirstPlayerPrompt);
        assert_eq!(f.orchestrator.greet(stream(1)).await, ServerMessage::StillSettingUp);
        assert_eq!(
            f.orchestrator.handle(stream(1), ClientMessage::StillSettingUp).await,
            None,
        );
        assert_eq!(
            f.stream.replies.lock().unwrap().last(),
            Some(&(1, ServerMessage::StillSettingUp))
        );

        // 非第一位玩家不能设定人数
        f.orchestrator
            .handle(
                stream(1),
                ClientMessage::JoinAsFirst {
                    username: "x".into(),
                    color: Color::Red,
                    player_count: 2,
                },
            )
            .await;
        assert!(matches!(
            f.stream.replies.lock().unwrap().last(),
            Some((1, ServerMessage::Error { code: ErrorCode::WrongPhase, .. }))
        ));

        f.orchestrator
            .handle(
                stream(0),
                ClientMessage::JoinAsFirst {
                    username: "alice".into(),
                    color: Color::Red,
                    player_count: 3,
                },
            )
            .await;
        f.orchestrator
            .handle(
                stream(1),
                ClientMessage::JoinAsOther {
                    username: "Alice".into(),
                    color: Color::Blue,
                },
            )
            .await;
        assert_eq!(
            f.stream.replies.lock().unwrap().last(),
            Some(&(
                1,
                ServerMessage::NameOrColorConflict {
                    remaining_colors: vec![Color::Blue, Color::Green, Color::Yellow],
                    taken_names: vec!["alice".into()],
                }
            ))
        );
        assert_eq!(f.orchestrator.connected_count().await, 1);
    }

    #[tokio::test]
    async fn test_invalid_player_count() {
        let f = fixture();
        f.orchestrator.greet(stream(0)).await;
        f.orchestrator
            .handle(
                stream(0),
                ClientMessage::JoinAsFirst {
                    username: "alice".into(),
                    color: Color::Red,
                    player_count: 5,
                },
            )
            .await;
        assert!(matches!(
            f.stream.replies.lock().unwrap().last(),
            Some((0, ServerMessage::Error { code: ErrorCode::InvalidPlayerCount, .. }))
        ));
        assert_eq!(f.orchestrator.connected_count().await, 0);
    }

    #[tokio::test]
    async fn test_first_seat_released_on_disconnect() {
        let f = fixture();
        f.orchestrator.greet(stream(0)).await;
        f.orchestrator.connection_lost(stream(0), "eof".into()).await;
        assert!(!f.orchestrator.is_stopping().await);
        assert_eq!(f.orchestrator.greet(stream(1)).await, ServerMessage::FirstPlayerPrompt);
    }

    #[tokio::test]
    async fn test_dirty_flag_delivery_after_turn() {
        let f = fixture();
        let handles = fill_lobby(&f, 2).await;
        // 调用式席位 1 先取走开局广播
        assert!(f.poll.poll_game_info(1).is_some());
        choose_all_objectives(&f, &handles).await;
        assert!(f.poll.poll_game_info(1).is_some());
        assert_eq!(f.poll.poll_game_info(1), None);

        let mover = {
            let session = f.orchestrator.session.lock().await;
            session.game.as_ref().unwrap().current_mover()
        };
        f.orchestrator
            .handle(
                handles[mover as usize],
                ClientMessage::SubmitTurn {
                    hand_index: 0,
                    side: Side::Front,
                    deployed_index: 0,
                    corner: Corner::TopLeft,
                    draw_index: 0,
                },
            )
            .await;

        let info = f.poll.poll_game_info(1).expect("new broadcast");
        assert_eq!(info.last_change_index, 1);
        assert_eq!(f.poll.poll_game_info(1), None);
        assert!(f
            .stream
            .sent_to(0)
            .iter()
            .any(|m| matches!(m, ServerMessage::GameInfo(i) if i.last_change_index == 1)));
    }

    #[tokio::test]
    async fn test_out_of_turn_rejected() {
        let f = fixture();
        let handles = fill_lobby(&f, 2).await;
        choose_all_objectives(&f, &handles).await;

        let (mover, before) = {
            let session = f.orchestrator.session.lock().await;
            let game = session.game.as_ref().unwrap();
            (game.current_mover(), game.clone())
        };
        let idle = handles[(mover as usize + 1) % 2];
        let submit = ClientMessage::SubmitTurn {
            hand_index: 0,
            side: Side::Front,
            deployed_index: 0,
            corner: Corner::TopLeft,
            draw_index: 0,
        };

        let reply = f.orchestrator.handle(idle, submit.clone()).await;
        let rejected = match idle.kind {
            TransportKind::Call => reply,
            TransportKind::Stream => f.stream.replies.lock().unwrap().last().map(|(_, m)| m.clone()),
        };
        assert!(matches!(
            rejected,
            Some(ServerMessage::Error { code: ErrorCode::NotYourTurn, .. })
        ));
        let session = f.orchestrator.session.lock().await;
        assert_eq!(session.game.as_ref(), Some(&before));
    }

    #[tokio::test]
    async fn test_objective_phase_persists_snapshot() {
        let f = fixture();
        let handles = fill_lobby(&f, 3).await;
        assert!(f.orchestrator.storage.load("test").unwrap().is_none());
        choose_all_objectives(&f, &handles).await;
        assert_eq!(f.orchestrator.phase().await, SessionPhase::InProgress);

        let snapshot = f.orchestrator.storage.load("test").unwrap().unwrap();
        assert_eq!(snapshot.players.len(), 3);
        assert_eq!(snapshot.objectives_chosen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_ranking_computed_once() {
        let f = fixture();
        let handles = fill_lobby(&f, 2).await;
        choose_all_objectives(&f, &handles).await;
        {
            let mut session = f.orchestrator.session.lock().await;
            let game = session.game.as_mut().unwrap();
            game.set_mover(0);
            game.set_score(0, protocol::WINNING_SCORE);
        }

        // 0 触发最后一轮，1 与 0 各再走一回合后结束
        let mut turns = 0;
        while f.orchestrator.phase().await != SessionPhase::Ended {
            let mover = {
                let session = f.orchestrator.session.lock().await;
                session.game.as_ref().unwrap().current_mover()
            };
            let mut accepted = false;
            'search: for corner in Corner::ALL {
                for deployed_index in 0..8 {
                    for hand_index in 0..3 {
                        let before = f.orchestrator.session.lock().await.game.clone();
                        f.orchestrator
                            .handle(
                                handles[mover as usize],
                                ClientMessage::SubmitTurn {
                                    hand_index,
                                    side: Side::Front,
                                    deployed_index,
                                    corner,
                                    draw_index: 0,
                                },
                            )
                            .await;
                        if f.orchestrator.session.lock().await.game != before {
                            accepted = true;
                            break 'search;
                        }
                    }
                }
            }
            assert!(accepted);
            turns += 1;
        }
        assert_eq!(turns, 3);

        let first = f.orchestrator.ranking().await.unwrap();
        let second = f.orchestrator.ranking().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            f.stream
                .sent_to(0)
                .iter()
                .filter(|m| matches!(m, ServerMessage::EndOfMatch { .. }))
                .count(),
            1
        );
        let session = f.orchestrator.session.lock().await;
        assert_eq!(session.game.as_ref().unwrap().last_change_index(), MATCH_OVER);
    }

    #[tokio::test]
    async fn test_rejoin_cycle() {
        let dir = TempDir::new().unwrap();
        let storage = SnapshotStore::at(dir.path()).unwrap();
        let snapshot = {
            let f = fixture_with(Session::new("test"), storage.clone(), TempDir::new().unwrap());
            let handles = fill_lobby(&f, 2).await;
            choose_all_objectives(&f, &handles).await;
            storage.load("test").unwrap().unwrap()
        };

        let f = fixture_with(Session::restore(snapshot), storage, dir);
        f.orchestrator.begin_rejoining().await;
        assert!(matches!(
            f.orchestrator.greet(stream(10)).await,
            ServerMessage::RejoinPrompt { available } if available.len() == 2
        ));

        f.orchestrator.handle(stream(10), ClientMessage::Rejoin { pick: 1 }).await;
        assert!(matches!(
            f.stream.replies.lock().unwrap().last(),
            Some((10, ServerMessage::RejoinData(d))) if d.slot == 1 && d.username == "p1"
        ));

        let reply = f.orchestrator.handle(call(11), ClientMessage::Rejoin { pick: 1 }).await;
        assert!(matches!(
            reply,
            Some(ServerMessage::RejoinRejected { available }) if available.len() == 1
        ));
        assert_eq!(f.orchestrator.phase().await, SessionPhase::Rejoining);

        f.orchestrator.handle(call(11), ClientMessage::Rejoin { pick: 0 }).await;
        assert_eq!(f.orchestrator.phase().await, SessionPhase::InProgress);
        assert_eq!(f.orchestrator.slot_of(call(11)).await, Some(0));
        assert!(f.poll.poll_game_info(0).is_some());
    }

    #[tokio::test]
    async fn test_persistence_failure_is_fatal() {
        let dir = TempDir::new().unwrap();
        let saves = dir.path().join("saves");
        let storage = SnapshotStore::at(&saves).unwrap();
        std::fs::remove_dir_all(&saves).unwrap();

        let f = fixture_with(Session::new("test"), storage, dir);
        let mut signal = f.orchestrator.shutdown_signal();
        let handles = fill_lobby(&f, 2).await;
        choose_all_objectives(&f, &handles).await;

        assert!(f.orchestrator.is_stopping().await);
        signal.changed().await.unwrap();
        assert!(matches!(
            *signal.borrow(),
            Some(FatalReason::PersistenceFailure(_))
        ));
        assert!(matches!(
            *f.stream.closed.lock().unwrap(),
            Some(ServerMessage::SessionLost { .. })
        ));
        assert!(f.poll.closed_reason().is_some());

        // 终止后任何请求都得到终止通知
        let reply = f.orchestrator.handle(handles[1], ClientMessage::Ping).await;
        assert!(matches!(reply, Some(ServerMessage::SessionLost { .. })));
    }

    #[tokio::test]
    async fn test_bound_disconnect_is_fatal_once() {
        let f = fixture();
        let handles = fill_lobby(&f, 3).await;
        f.orchestrator.connection_lost(handles[0], "reset".into()).await;
        assert!(f.orchestrator.is_stopping().await);
        let first = f.orchestrator.fatal_reason();
        assert!(matches!(first, Some(FatalReason::TransportFailure { .. })));

        f.orchestrator
            .fatal(FatalReason::PersistenceFailure("later".into()))
            .await;
        assert_eq!(f.orchestrator.fatal_reason(), first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_sweep() {
        let f = fixture();
        let handles = fill_lobby(&f, 2).await;
        assert_eq!(handles[1].kind, TransportKind::Call);

        tokio::time::advance(Duration::from_secs(5)).await;
        f.orchestrator.record_heartbeat(1).await;
        assert!(!f.orchestrator.sweep_heartbeats(Duration::from_secs(10)).await);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(f.orchestrator.sweep_heartbeats(Duration::from_secs(10)).await);
        assert!(matches!(
            f.orchestrator.fatal_reason(),
            Some(FatalReason::LivenessTimeout { slot: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_private_chat() {
        let f = fixture();
        let handles = fill_lobby(&f, 3).await;
        f.orchestrator
            .handle(
                handles[0],
                ClientMessage::ChatPrivate {
                    to_username: "p2".into(),
                    text: "hi".into(),
                },
            )
            .await;
        f.orchestrator
            .handle(
                handles[0],
                ClientMessage::ChatPrivate {
                    to_username: "nobody".into(),
                    text: "hi".into(),
                },
            )
            .await;
        assert!(matches!(
            f.stream.replies.lock().unwrap().last(),
            Some((0, ServerMessage::Error { code: ErrorCode::PlayerNotFound, .. }))
        ));

        assert!(f
            .stream
            .sent_to(2)
            .iter()
            .any(|m| matches!(m, ServerMessage::Chat(e) if e.text == "hi")));
        assert_eq!(f.orchestrator.chat_backlog(1, 0).await.len(), 0);
        assert_eq!(f.orchestrator.chat_backlog(2, 0).await.len(), 1);
    }
}
