//! 牌堆、公共翻开区与内置卡牌内容

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::card::{Card, CardKind, Corner, CornerMask, Objective, Resource};
use crate::constants::MARKET_SIZE;
use crate::error::MatchError;

/// 牌堆（最后一张为堆顶）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deck {
    cards: Vec<Card>,
}

impl Deck {
    pub fn new(cards: Vec<Card>) -> Self {
        Self { cards }
    }

    /// 洗牌
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.cards.shuffle(rng);
    }

    /// 抽取堆顶
    pub fn draw(&mut self) -> Option<Card> {
        self.cards.pop()
    }

    /// 查看堆顶
    pub fn top(&self) -> Option<&Card> {
        self.cards.last()
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

/// 抽牌来源：牌堆 + 翻开的公共卡
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrawPile {
    deck: Deck,
    market: Vec<Option<Card>>,
}

impl DrawPile {
    /// 创建并翻开公共卡
    pub fn new(mut deck: Deck) -> Self {
        let market = (0..MARKET_SIZE).map(|_| deck.draw()).collect();
        Self { deck, market }
    }

    /// 从牌堆抽一张
    pub fn draw_top(&mut self) -> Option<Card> {
        self.deck.draw()
    }

    /// 拿走一张公共卡，并由牌堆补充
    pub fn take_market(&mut self, slot: usize) -> Option<Card> {
        let taken = self.market.get_mut(slot)?.take()?;
        self.market[slot] = self.deck.draw();
        Some(taken)
    }

    /// 牌堆是否已抽空
    pub fn deck_is_empty(&self) -> bool {
        self.deck.is_empty()
    }

    /// 牌堆与公共区是否都已空
    pub fn is_exhausted(&self) -> bool {
        self.deck.is_empty() && self.market.iter().all(Option::is_none)
    }

    /// 堆顶卡牌的资源类型（背面可见信息）
    pub fn top_resource(&self) -> Option<Resource> {
        self.deck.top().and_then(|c| c.resource)
    }

    pub fn market(&self) -> &[Option<Card>] {
        &self.market
    }
}

/// 抽牌位置（线上以 0..=5 编码）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrawSource {
    ResourceDeck,
    ResourceMarket(usize),
    GoldDeck,
    GoldMarket(usize),
}

impl DrawSource {
    /// 从线上编码解析
    pub fn from_index(index: usize) -> Result<Self, MatchError> {
        match index {
            0 => Ok(DrawSource::ResourceDeck),
            1 | 2 => Ok(DrawSource::ResourceMarket(index - 1)),
            3 => Ok(DrawSource::GoldDeck),
            4 | 5 => Ok(DrawSource::GoldMarket(index - 4)),
            _ => Err(MatchError::InvalidDrawIndex { index }),
        }
    }

    /// 线上编码
    pub fn index(self) -> usize {
        match self {
            DrawSource::ResourceDeck => 0,
            DrawSource::ResourceMarket(i) => 1 + i,
            DrawSource::GoldDeck => 3,
            DrawSource::GoldMarket(i) => 4 + i,
        }
    }
}

/// 广播中携带的公共抽牌区视图
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeckTops {
    pub resource_top: Option<Resource>,
    pub gold_top: Option<Resource>,
    pub resource_market: Vec<Option<Card>>,
    pub gold_market: Vec<Option<Card>>,
}

/// 内置卡牌内容
#[derive(Debug, Clone)]
pub struct Catalog {
    pub resource_cards: Vec<Card>,
    pub gold_cards: Vec<Card>,
    pub starters: Vec<Card>,
    pub objectives: Vec<Objective>,
}

impl Catalog {
    /// 标准卡牌内容：40 张资源卡、40 张金卡、4 张起始卡、16 张目标卡
    pub fn standard() -> Self {
        let mut resource_cards = Vec::with_capacity(40);
        let mut gold_cards = Vec::with_capacity(40);
        let mut next_id = 1;

        for resource in Resource::ALL {
            for i in 0..10u32 {
                // 每隔一张缺一个角
                let corners = if i % 2 == 0 {
                    CornerMask::ALL
                } else {
                    CornerMask::ALL.minus(CornerMask::of(&[Corner::ALL[(i as usize / 2) % 4]]))
                };
                resource_cards.push(Card {
                    id: next_id,
                    kind: CardKind::Resource,
                    resource: Some(resource),
                    points: u32::from(i % 5 == 4),
                    corners,
                });
                next_id += 1;
            }
        }

        for resource in Resource::ALL {
            for i in 0..10u32 {
                let requirement = 1 + (i % 3) as u8;
                gold_cards.push(Card {
                    id: next_id,
                    kind: CardKind::Gold { requirement },
                    resource: Some(resource),
                    points: u32::from(requirement) + 1,
                    corners: if i % 4 == 3 {
                        CornerMask::of(&[Corner::TopLeft, Corner::BottomRight])
                    } else {
                        CornerMask::ALL
                    },
                });
                next_id += 1;
            }
        }

        let starters = (0..4)
            .map(|i| Card {
                id: next_id + i,
                kind: CardKind::Starter,
                resource: None,
                points: 0,
                corners: CornerMask::ALL,
            })
            .collect();

        let mut objectives = Vec::with_capacity(16);
        let mut objective_id = 1;
        for resource in Resource::ALL {
            for (required, points) in [(2u8, 1u32), (3, 2), (3, 3), (4, 4)] {
                objectives.push(Objective {
                    id: objective_id,
                    resource,
                    required,
                    points,
                });
                objective_id += 1;
            }
        }

        Self {
            resource_cards,
            gold_cards,
            starters,
            objectives,
        }
    }
}
