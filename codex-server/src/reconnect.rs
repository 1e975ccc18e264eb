//! 重连认领
//!
//! 快照重载后，新连接按下标认领原来的身份。一个身份在同一轮重载里只能被认领一次。

use std::collections::BTreeSet;

use protocol::{RejoinCandidate, SlotId};

/// 认领结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed { slot: SlotId, username: String },
    /// 已被认领或下标越界；附带仍可认领的身份
    Rejected { available: Vec<RejoinCandidate> },
}

/// 重连登记表
#[derive(Debug, Clone)]
pub struct ReconnectionRegistry {
    /// 快照中的身份，下标即席位
    identities: Vec<String>,
    rejoined: BTreeSet<SlotId>,
}

impl ReconnectionRegistry {
    pub fn new(identities: Vec<String>) -> Self {
        Self {
            identities,
            rejoined: BTreeSet::new(),
        }
    }

    /// 认领第 `pick` 个身份
    pub fn claim(&mut self, pick: usize) -> ClaimOutcome {
        let slot = pick as SlotId;
        match self.identities.get(pick) {
            Some(username) if !self.rejoined.contains(&slot) => {
                self.rejoined.insert(slot);
                ClaimOutcome::Claimed {
                    slot,
                    username: username.clone(),
                }
            }
            _ => ClaimOutcome::Rejected {
                available: self.available(),
            },
        }
    }

    /// 尚未认领的身份
    pub fn available(&self) -> Vec<RejoinCandidate> {
        self.identities
            .iter()
            .enumerate()
            .filter(|(pick, _)| !self.rejoined.contains(&(*pick as SlotId)))
            .map(|(pick, username)| RejoinCandidate {
                pick,
                username: username.clone(),
            })
            .collect()
    }

    pub fn rejoined_count(&self) -> usize {
        self.rejoined.len()
    }

    pub fn is_complete(&self) -> bool {
        self.rejoined.len() == self.identities.len()
    }
}
