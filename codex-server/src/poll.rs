//! 调用式传输的拉取投递
//!
//! 这一侧无法推送，只能等客户端来问。每个席位一个脏标记：
//! 广播发生时全部复位为"未送达"，席位下一次轮询取走后置为"已送达"；
//! 只有全部送达后，排队中的下一条广播才会替换当前广播。

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use protocol::{GameInfo, ObjectiveChoices, ServerMessage, SlotId};

use crate::delivery::{ConnId, Delivery, DeliveryResult, TransportKind};

/// 脏标记表：true 表示当前广播已送达该席位
#[derive(Debug, Default)]
pub struct DirtyFlagTable {
    flags: BTreeMap<SlotId, bool>,
}

impl DirtyFlagTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记席位；`delivered` 为其初始状态
    pub fn register(&mut self, slot: SlotId, delivered: bool) {
        self.flags.insert(slot, delivered);
    }

    /// 新广播：全部置为未送达
    pub fn reset_all(&mut self) {
        for delivered in self.flags.values_mut() {
            *delivered = false;
        }
    }

    /// 取走：未送达时置为已送达并返回 true
    pub fn take(&mut self, slot: SlotId) -> bool {
        match self.flags.get_mut(&slot) {
            Some(delivered) if !*delivered => {
                *delivered = true;
                true
            }
            _ => false,
        }
    }

    pub fn all_delivered(&self) -> bool {
        self.flags.values().all(|d| *d)
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

#[derive(Debug, Default)]
struct PollState {
    flags: DirtyFlagTable,
    current: Option<GameInfo>,
    queued: VecDeque<GameInfo>,
    outboxes: BTreeMap<SlotId, Vec<ServerMessage>>,
    objective_choices: BTreeMap<SlotId, ObjectiveChoices>,
    closed: Option<String>,
}

impl PollState {
    /// 当前广播全部送达后，换上排队的下一条
    fn promote(&mut self) {
        if self.flags.all_delivered() {
            if let Some(next) = self.queued.pop_front() {
                self.current = Some(next);
                self.flags.reset_all();
            }
        }
    }
}

/// 调用式传输的投递中心
#[derive(Debug, Default)]
pub struct PollHub {
    state: Mutex<PollState>,
}

impl PollHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PollState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 取最新广播；已取过则返回 None
    pub fn poll_game_info(&self, slot: SlotId) -> Option<GameInfo> {
        let mut state = self.lock();
        state.promote();
        if !state.flags.take(slot) {
            return None;
        }
        let info = state.current.clone();
        state.promote();
        info
    }

    /// 取走并清空席位的待收消息
    pub fn drain_messages(&self, slot: SlotId) -> Vec<ServerMessage> {
        self.lock()
            .outboxes
            .get_mut(&slot)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    pub fn objective_choices(&self, slot: SlotId) -> Option<ObjectiveChoices> {
        self.lock().objective_choices.get(&slot).cloned()
    }

    /// 会话已终止时的原因
    pub fn closed_reason(&self) -> Option<String> {
        self.lock().closed.clone()
    }
}

#[async_trait]
impl Delivery for PollHub {
    fn kind(&self) -> TransportKind {
        TransportKind::Call
    }

    fn bind(&self, slot: SlotId, _conn: ConnId) {
        let mut state = self.lock();
        // 晚绑定的席位也能拿到当前广播
        let has_current = state.current.is_some();
        state.flags.register(slot, !has_current);
        state.outboxes.entry(slot).or_default();
        debug!("调用式席位 {} 已绑定", slot);
    }

    async fn reply(&self, _conn: ConnId, _msg: ServerMessage) -> DeliveryResult<bool> {
        Ok(false)
    }

    async fn send_to(&self, slot: SlotId, msg: ServerMessage) -> DeliveryResult<()> {
        let mut state = self.lock();
        if !state.outboxes.contains_key(&slot) {
            return Ok(());
        }
        match msg {
            ServerMessage::ObjectiveChoices(choices) => {
                state.objective_choices.insert(slot, choices);
            }
            // 聊天走 FetchChat 积压记录
            ServerMessage::Chat(_) => {}
            ServerMessage::GameInfo(_) => {}
            other => {
                if let Some(outbox) = state.outboxes.get_mut(&slot) {
                    outbox.push(other);
                }
            }
        }
        Ok(())
    }

    async fn publish(&self, msg: ServerMessage) -> DeliveryResult<()> {
        let mut state = self.lock();
        match msg {
            ServerMessage::GameInfo(info) => {
                if state.flags.is_empty() || state.current.is_none() || state.flags.all_delivered()
                {
                    state.current = Some(info);
                    state.flags.reset_all();
                } else {
                    state.queued.push_back(info);
                }
            }
            ServerMessage::Chat(_) => {}
            other => {
                for outbox in state.outboxes.values_mut() {
                    outbox.push(other.clone());
                }
            }
        }
        Ok(())
    }

    async fn close_all(&self, notice: ServerMessage) {
        let mut state = self.lock();
        if let ServerMessage::SessionLost { reason } = &notice {
            state.closed = Some(reason.clone());
        }
        for outbox in state.outboxes.values_mut() {
            outbox.push(notice.clone());
        }
    }
}
