//! 卡牌与目标定义

use serde::{Deserialize, Serialize};

/// 卡牌 ID
pub type CardId = u32;

/// 资源（王国）类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resource {
    /// 真菌
    Fungi,
    /// 植物
    Plant,
    /// 动物
    Animal,
    /// 昆虫
    Insect,
}

impl Resource {
    /// 全部资源类型（固定顺序）
    pub const ALL: [Resource; 4] = [
        Resource::Fungi,
        Resource::Plant,
        Resource::Animal,
        Resource::Insect,
    ];

    /// 在 `ALL` 中的下标
    pub fn index(self) -> usize {
        match self {
            Resource::Fungi => 0,
            Resource::Plant => 1,
            Resource::Animal => 2,
            Resource::Insect => 3,
        }
    }
}

/// 卡牌的四个角
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Corner {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl Corner {
    /// 全部角（与掩码位序一致）
    pub const ALL: [Corner; 4] = [
        Corner::TopLeft,
        Corner::TopRight,
        Corner::BottomLeft,
        Corner::BottomRight,
    ];

    /// 对应的掩码位
    pub fn bit(self) -> u8 {
        match self {
            Corner::TopLeft => 0b0001,
            Corner::TopRight => 0b0010,
            Corner::BottomLeft => 0b0100,
            Corner::BottomRight => 0b1000,
        }
    }

    /// 对角（新卡贴在目标卡的某个角上时，新卡被占用的角）
    pub fn opposite(self) -> Corner {
        match self {
            Corner::TopLeft => Corner::BottomRight,
            Corner::TopRight => Corner::BottomLeft,
            Corner::BottomLeft => Corner::TopRight,
            Corner::BottomRight => Corner::TopLeft,
        }
    }
}

/// 角掩码（每个角一位）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CornerMask(pub u8);

impl CornerMask {
    /// 无可用角
    pub const NONE: CornerMask = CornerMask(0);

    /// 四个角全部可用
    pub const ALL: CornerMask = CornerMask(0b1111);

    /// 由若干角构造
    pub fn of(corners: &[Corner]) -> Self {
        CornerMask(corners.iter().fold(0, |acc, c| acc | c.bit()))
    }

    pub fn contains(self, corner: Corner) -> bool {
        self.0 & corner.bit() != 0
    }

    pub fn with(self, corner: Corner) -> Self {
        CornerMask(self.0 | corner.bit())
    }

    /// 去掉 `other` 中的所有角
    pub fn minus(self, other: CornerMask) -> Self {
        CornerMask(self.0 & !other.0 & Self::ALL.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 & Self::ALL.0 == 0
    }

    /// 按固定顺序列出包含的角
    pub fn corners(self) -> Vec<Corner> {
        Corner::ALL.into_iter().filter(|c| self.contains(*c)).collect()
    }
}

/// 卡牌类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CardKind {
    /// 起始卡（每位玩家一张，开局即放在版图上）
    Starter,
    /// 资源卡
    Resource,
    /// 金卡：版图上至少需要 `requirement` 张同资源卡才能放置
    Gold { requirement: u8 },
}

/// 卡牌
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    pub id: CardId,
    pub kind: CardKind,
    /// 资源类型（起始卡没有）
    pub resource: Option<Resource>,
    /// 放置后获得的分数
    pub points: u32,
    /// 可见的角
    pub corners: CornerMask,
}

impl Card {
    pub fn is_gold(&self) -> bool {
        matches!(self.kind, CardKind::Gold { .. })
    }
}

/// 放置朝向
///
/// 背面朝上的卡不计分、不检查金卡条件，四个角都可见。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[default]
    Front,
    Back,
}

impl Side {
    /// 该朝向下可见的角
    pub fn visible_corners(self, card: &Card) -> CornerMask {
        match self {
            Side::Front => card.corners,
            Side::Back => CornerMask::ALL,
        }
    }

    /// 该朝向下放置所得的分数
    pub fn points(self, card: &Card) -> u32 {
        match self {
            Side::Front => card.points,
            Side::Back => 0,
        }
    }
}

/// 目标卡：版图上每凑齐 `required` 张 `resource` 卡得 `points` 分
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Objective {
    pub id: u32,
    pub resource: Resource,
    pub required: u8,
    pub points: u32,
}

impl Objective {
    /// 给定资源数量时该目标被满足的次数
    pub fn times_satisfied(&self, count: u32) -> u32 {
        if self.required == 0 {
            return 0;
        }
        count / u32::from(self.required)
    }

    /// 目标奖励分
    pub fn bonus(&self, count: u32) -> u32 {
        self.times_satisfied(count) * self.points
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corner_mask() {
        let mask = CornerMask::of(&[Corner::TopLeft, Corner::BottomRight]);
        assert!(mask.contains(Corner::TopLeft));
        assert!(!mask.contains(Corner::TopRight));
        assert_eq!(mask.corners(), vec![Corner::TopLeft, Corner::BottomRight]);

        let rest = CornerMask::ALL.minus(mask);
        assert_eq!(rest.corners(), vec![Corner::TopRight, Corner::BottomLeft]);
        assert!(mask.minus(CornerMask::ALL).is_empty());
    }

    #[test]
    fn test_opposite_corner() {
        for corner in Corner::ALL {
            assert_eq!(corner.opposite().opposite(), corner);
            assert_ne!(corner.opposite(), corner);
        }
    }

    #[test]
    fn test_objective_bonus() {
        let objective = Objective {
            id: 1,
            resource: Resource::Plant,
            required: 3,
            points: 2,
        };
        assert_eq!(objective.bonus(2), 0);
        assert_eq!(objective.bonus(3), 2);
        assert_eq!(objective.bonus(7), 4);
        assert_eq!(objective.times_satisfied(7), 2);
    }
}
