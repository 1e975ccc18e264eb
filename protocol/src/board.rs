//! 玩家版图
//!
//! 版图只记录已部署卡牌及其角的覆盖情况，几何位置由 `attached_to` 链推出。

use serde::{Deserialize, Serialize};

use crate::card::{Card, CardKind, Corner, CornerMask, Resource, Side};
use crate::error::MatchError;

/// 已部署在版图上的卡牌
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedCard {
    pub card: Card,
    #[serde(default)]
    pub side: Side,
    /// 已被覆盖（或已用于连接）的角
    pub covered: CornerMask,
    /// 贴附的目标：(已部署卡牌索引, 目标卡的角)，起始卡为 None
    pub attached_to: Option<(usize, Corner)>,
}

impl DeployedCard {
    /// 仍可放置新卡的角
    pub fn available(&self) -> CornerMask {
        self.side.visible_corners(&self.card).minus(self.covered)
    }
}

/// 单个玩家的版图
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerBoard {
    deployed: Vec<DeployedCard>,
}

impl PlayerBoard {
    /// 以起始卡创建版图
    pub fn with_starter(starter: Card) -> Self {
        Self {
            deployed: vec![DeployedCard {
                card: starter,
                side: Side::Front,
                covered: CornerMask::NONE,
                attached_to: None,
            }],
        }
    }

    /// 已部署卡牌（按部署顺序）
    pub fn deployed(&self) -> &[DeployedCard] {
        &self.deployed
    }

    /// 已部署卡牌数量
    pub fn len(&self) -> usize {
        self.deployed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deployed.is_empty()
    }

    /// 指定已部署卡牌上可用的角
    pub fn available_corners(&self, index: usize) -> Result<CornerMask, MatchError> {
        self.deployed
            .get(index)
            .map(DeployedCard::available)
            .ok_or(MatchError::InvalidDeployedIndex { index })
    }

    /// 版图上某种资源的卡牌数量
    pub fn resource_count(&self, resource: Resource) -> u32 {
        self.deployed
            .iter()
            .filter(|d| d.card.resource == Some(resource))
            .count() as u32
    }

    /// 全部资源的数量，顺序同 `Resource::ALL`
    pub fn resource_counts(&self) -> [u32; 4] {
        let mut counts = [0u32; 4];
        for deployed in &self.deployed {
            if let Some(resource) = deployed.card.resource {
                counts[resource.index()] += 1;
            }
        }
        counts
    }

    /// 检查金卡的放置条件
    pub fn check_requirement(&self, card: &Card) -> Result<(), MatchError> {
        if let (CardKind::Gold { requirement }, Some(resource)) = (card.kind, card.resource) {
            let available = self.resource_count(resource);
            if available < u32::from(requirement) {
                return Err(MatchError::RequirementUnmet {
                    resource,
                    required: requirement,
                    available,
                });
            }
        }
        Ok(())
    }

    /// 将卡牌以 `side` 朝向贴在第 `target` 张已部署卡牌的 `corner` 角上，返回新卡的索引
    pub fn place(
        &mut self,
        card: Card,
        side: Side,
        target: usize,
        corner: Corner,
    ) -> Result<usize, MatchError> {
        let available = self.available_corners(target)?;
        if !available.contains(corner) {
            return Err(MatchError::CornerUnavailable {
                index: target,
                corner,
            });
        }
        if side == Side::Front {
            self.check_requirement(&card)?;
        }

        self.deployed[target].covered = self.deployed[target].covered.with(corner);
        self.deployed.push(DeployedCard {
            card,
            side,
            covered: CornerMask::NONE.with(corner.opposite()),
            attached_to: Some((target, corner)),
        });
        Ok(self.deployed.len() - 1)
    }
}
