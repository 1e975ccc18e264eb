//! 玩家席位管理

use serde::{Deserialize, Serialize};

use protocol::{Color, SlotId};

use crate::delivery::ClientHandle;

/// 玩家席位
#[derive(Debug, Clone)]
pub struct PlayerSlot {
    pub id: SlotId,
    pub username: String,
    pub color: Color,
    /// 当前绑定的传输连接；快照恢复后、重新认领前为 None
    pub binding: Option<ClientHandle>,
}

/// 快照中保存的席位身份
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub slot: SlotId,
    pub username: String,
    pub color: Color,
}

/// 加入冲突
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinConflict {
    NameTaken,
    ColorTaken,
}

/// 席位表：席位 ID 即下标，按加入顺序分配
#[derive(Debug, Default)]
pub struct PlayerRegistry {
    slots: Vec<PlayerSlot>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// 从快照恢复（全部未绑定）
    pub fn from_records(records: &[PlayerRecord]) -> Self {
        let mut slots: Vec<PlayerSlot> = records
            .iter()
            .map(|r| PlayerSlot {
                id: r.slot,
                username: r.username.clone(),
                color: r.color,
                binding: None,
            })
            .collect();
        slots.sort_by_key(|s| s.id);
        Self { slots }
    }

    /// 检查用户名与颜色是否可用（用户名比较忽略大小写）
    pub fn check_available(&self, username: &str, color: Color) -> Result<(), JoinConflict> {
        let username = username.trim();
        if self
            .slots
            .iter()
            .any(|s| s.username.eq_ignore_ascii_case(username))
        {
            return Err(JoinConflict::NameTaken);
        }
        if self.slots.iter().any(|s| s.color == color) {
            return Err(JoinConflict::ColorTaken);
        }
        Ok(())
    }

    /// 分配下一个席位
    pub fn admit(&mut self, username: &str, color: Color, binding: ClientHandle) -> SlotId {
        let id = self.slots.len() as SlotId;
        self.slots.push(PlayerSlot {
            id,
            username: username.trim().to_string(),
            color,
            binding: Some(binding),
        });
        id
    }

    /// 重新绑定连接（重连认领）
    pub fn rebind(&mut self, slot: SlotId, binding: ClientHandle) -> bool {
        match self.slots.get_mut(slot as usize) {
            Some(player) => {
                player.binding = Some(binding);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, slot: SlotId) -> Option<&PlayerSlot> {
        self.slots.get(slot as usize)
    }

    /// 按用户名查找
    pub fn find_by_username(&self, username: &str) -> Option<&PlayerSlot> {
        self.slots
            .iter()
            .find(|s| s.username.eq_ignore_ascii_case(username.trim()))
    }

    /// 查找绑定到指定连接的席位
    pub fn slot_for(&self, handle: ClientHandle) -> Option<SlotId> {
        self.slots
            .iter()
            .find(|s| s.binding == Some(handle))
            .map(|s| s.id)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PlayerSlot> {
        self.slots.iter()
    }

    pub fn taken_names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.username.clone()).collect()
    }

    pub fn remaining_colors(&self) -> Vec<Color> {
        Color::ALL
            .into_iter()
            .filter(|c| self.slots.iter().all(|s| s.color != *c))
            .collect()
    }

    pub fn records(&self) -> Vec<PlayerRecord> {
        self.slots
            .iter()
            .map(|s| PlayerRecord {
                slot: s.id,
                username: s.username.clone(),
                color: s.color,
            })
            .collect()
    }
}
