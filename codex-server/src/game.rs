//! 对局聚合
//!
//! 对局状态的唯一可变来源：手牌、版图、牌堆、目标与回合指针。
//! 会话层只通过这里的查询与 `apply_turn` 操作它。

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use protocol::{
    BoardChange, Card, CardKind, Catalog, Corner, CornerMask, Deck, DeckTops, DrawPile, DrawSource,
    GameInfo, MatchError, Objective, ObjectiveChoices, PlayerBoard, RankEntry, Side, SlotId,
    HAND_SIZE, MATCH_OVER, PERSONAL_OBJECTIVE_OPTIONS, SHARED_OBJECTIVES, WINNING_SCORE,
};

/// 单个玩家的对局状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerState {
    pub board: PlayerBoard,
    pub hand: Vec<Card>,
    /// 累计回合得分（不含目标奖励）
    pub score: u32,
    pub objective_options: Vec<Objective>,
    pub objective: Option<Objective>,
}

/// 回合状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnState {
    /// 当前行动玩家
    pub mover: SlotId,
    /// 是否已进入最后一轮
    pub final_lap: bool,
    /// 最后一轮结束于该玩家再次完成回合
    pub last_playing: SlotId,
    /// 已完成回合数；结束后为 `MATCH_OVER`
    pub last_change_index: i64,
}

/// 一次回合的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub drawn: Option<Card>,
    /// 本回合触发了最后一轮
    pub final_lap_armed: bool,
    /// 本回合结束了对局
    pub ended: bool,
}

/// 终局结算前的单人统计
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Standing {
    pub slot: SlotId,
    pub score: u32,
    pub objectives: u8,
}

/// 对局
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Match {
    players: Vec<PlayerState>,
    resource_pile: DrawPile,
    gold_pile: DrawPile,
    shared_objectives: Vec<Objective>,
    turn: TurnState,
    last_board_change: Option<BoardChange>,
}

impl Match {
    /// 发牌：起始卡、两张资源卡 + 一张金卡、两个个人目标选项、两个公共目标，
    /// 随机先手，`last_playing` 为先手的前一位
    pub fn deal<R: Rng + ?Sized>(player_count: usize, catalog: Catalog, rng: &mut R) -> Self {
        let mut resource_deck = Deck::new(catalog.resource_cards);
        let mut gold_deck = Deck::new(catalog.gold_cards);
        resource_deck.shuffle(rng);
        gold_deck.shuffle(rng);

        let mut starters = Deck::new(catalog.starters);
        starters.shuffle(rng);
        let mut objective_pool = catalog.objectives;
        objective_pool.shuffle(rng);

        let mut resource_pile = DrawPile::new(resource_deck);
        let mut gold_pile = DrawPile::new(gold_deck);

        let shared = SHARED_OBJECTIVES.min(objective_pool.len());
        let shared_objectives: Vec<Objective> = objective_pool.drain(..shared).collect();

        let players = (0..player_count)
            .map(|_| {
                let starter = starters.draw().unwrap_or(Card {
                    id: 0,
                    kind: CardKind::Starter,
                    resource: None,
                    points: 0,
                    corners: CornerMask::ALL,
                });
                let mut hand = Vec::with_capacity(HAND_SIZE);
                hand.extend(resource_pile.draw_top());
                hand.extend(resource_pile.draw_top());
                hand.extend(gold_pile.draw_top());
                let take = PERSONAL_OBJECTIVE_OPTIONS.min(objective_pool.len());
                PlayerState {
                    board: PlayerBoard::with_starter(starter),
                    hand,
                    score: 0,
                    objective_options: objective_pool.drain(..take).collect(),
                    objective: None,
                }
            })
            .collect();

        let first = rng.gen_range(0..player_count.max(1)) as SlotId;
        let count = player_count.max(1) as SlotId;
        Self {
            players,
            resource_pile,
            gold_pile,
            shared_objectives,
            turn: TurnState {
                mover: first,
                final_lap: false,
                last_playing: (first + count - 1) % count,
                last_change_index: 0,
            },
            last_board_change: None,
        }
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn turn(&self) -> &TurnState {
        &self.turn
    }

    pub fn current_mover(&self) -> SlotId {
        self.turn.mover
    }

    pub fn player(&self, slot: SlotId) -> Result<&PlayerState, MatchError> {
        self.players
            .get(slot as usize)
            .ok_or(MatchError::UnknownSlot { slot })
    }

    fn player_mut(&mut self, slot: SlotId) -> Result<&mut PlayerState, MatchError> {
        self.players
            .get_mut(slot as usize)
            .ok_or(MatchError::UnknownSlot { slot })
    }

    pub fn shared_objectives(&self) -> &[Objective] {
        &self.shared_objectives
    }

    /// 个人目标选项
    pub fn objective_choices(&self, slot: SlotId) -> Result<ObjectiveChoices, MatchError> {
        let player = self.player(slot)?;
        Ok(ObjectiveChoices {
            options: player.objective_options.clone(),
            shared: self.shared_objectives.clone(),
        })
    }

    /// 选择个人目标
    pub fn choose_objective(&mut self, slot: SlotId, index: usize) -> Result<(), MatchError> {
        let player = self.player_mut(slot)?;
        if player.objective.is_some() {
            return Err(MatchError::ObjectiveAlreadyChosen);
        }
        let chosen = *player
            .objective_options
            .get(index)
            .ok_or(MatchError::InvalidObjective { index })?;
        player.objective = Some(chosen);
        Ok(())
    }

    pub fn all_objectives_chosen(&self) -> bool {
        self.players.iter().all(|p| p.objective.is_some())
    }

    /// 某张已部署卡牌上可放置的角
    pub fn compute_available_placements(
        &self,
        slot: SlotId,
        target_index: usize,
    ) -> Result<CornerMask, MatchError> {
        self.player(slot)?.board.available_corners(target_index)
    }

    /// 执行一个完整回合：出牌、计分、抽牌、推进回合指针与终局状态
    pub fn apply_turn(
        &mut self,
        slot: SlotId,
        hand_index: usize,
        side: Side,
        deployed_index: usize,
        corner: Corner,
        draw_index: usize,
    ) -> Result<TurnOutcome, MatchError> {
        if self.is_over() {
            return Err(MatchError::MatchOver);
        }
        if slot != self.turn.mover {
            return Err(MatchError::NotYourTurn);
        }

        let source = DrawSource::from_index(draw_index)?;
        let must_draw = !self.all_sources_empty();
        if must_draw && !self.source_has_card(source) {
            return Err(MatchError::EmptyDrawSource { index: draw_index });
        }

        let player = self.player_mut(slot)?;
        let card = *player
            .hand
            .get(hand_index)
            .ok_or(MatchError::InvalidHandIndex { index: hand_index })?;
        let new_index = player.board.place(card, side, deployed_index, corner)?;
        player.hand.remove(hand_index);
        player.score += side.points(&card);
        let score = player.score;

        let drawn = if must_draw { self.draw(source) } else { None };
        if let Some(card) = drawn {
            self.player_mut(slot)?.hand.push(card);
        }

        self.last_board_change = Some(BoardChange {
            slot,
            card,
            side,
            deployed_index: new_index,
            corner,
        });

        let mut final_lap_armed = false;
        let mut ended = false;
        if self.turn.final_lap {
            ended = slot == self.turn.last_playing;
        } else if score >= WINNING_SCORE
            || (self.resource_pile.deck_is_empty() && self.gold_pile.deck_is_empty())
        {
            self.turn.final_lap = true;
            self.turn.last_playing = slot;
            final_lap_armed = true;
        }

        if ended {
            self.turn.last_change_index = MATCH_OVER;
        } else {
            self.turn.last_change_index += 1;
            self.turn.mover = (slot + 1) % self.players.len() as SlotId;
        }

        Ok(TurnOutcome {
            drawn,
            final_lap_armed,
            ended,
        })
    }

    fn source_has_card(&self, source: DrawSource) -> bool {
        match source {
            DrawSource::ResourceDeck => !self.resource_pile.deck_is_empty(),
            DrawSource::ResourceMarket(i) => self.resource_pile.market().get(i).is_some_and(Option::is_some),
            DrawSource::GoldDeck => !self.gold_pile.deck_is_empty(),
            DrawSource::GoldMarket(i) => self.gold_pile.market().get(i).is_some_and(Option::is_some),
        }
    }

    fn all_sources_empty(&self) -> bool {
        self.resource_pile.is_exhausted() && self.gold_pile.is_exhausted()
    }

    fn draw(&mut self, source: DrawSource) -> Option<Card> {
        match source {
            DrawSource::ResourceDeck => self.resource_pile.draw_top(),
            DrawSource::ResourceMarket(i) => self.resource_pile.take_market(i),
            DrawSource::GoldDeck => self.gold_pile.draw_top(),
            DrawSource::GoldMarket(i) => self.gold_pile.take_market(i),
        }
    }

    /// 按席位排列的累计分数
    pub fn current_scores(&self) -> Vec<u32> {
        self.players.iter().map(|p| p.score).collect()
    }

    pub fn is_final_lap_armed(&self) -> bool {
        self.turn.final_lap
    }

    pub fn last_change_index(&self) -> i64 {
        self.turn.last_change_index
    }

    pub fn is_over(&self) -> bool {
        self.turn.last_change_index == MATCH_OVER
    }

    pub fn deck_tops(&self) -> DeckTops {
        DeckTops {
            resource_top: self.resource_pile.top_resource(),
            gold_top: self.gold_pile.top_resource(),
            resource_market: self.resource_pile.market().to_vec(),
            gold_market: self.gold_pile.market().to_vec(),
        }
    }

    /// 当前广播快照
    pub fn game_info(&self) -> GameInfo {
        GameInfo {
            mover: self.turn.mover,
            scores: self.current_scores(),
            last_board_change: self.last_board_change.clone(),
            last_change_index: self.turn.last_change_index,
            deck_tops: self.deck_tops(),
            final_lap: self.turn.final_lap,
        }
    }

    /// 终局分数：回合得分 + 个人目标与两个公共目标的奖励；同时统计满足的目标数
    pub fn final_standings(&self) -> Vec<Standing> {
        self.players
            .iter()
            .enumerate()
            .map(|(slot, player)| {
                let counts = player.board.resource_counts();
                let mut score = player.score;
                let mut objectives = 0u8;
                for objective in player.objective.iter().chain(&self.shared_objectives) {
                    let count = counts[objective.resource.index()];
                    score += objective.bonus(count);
                    if objective.times_satisfied(count) > 0 {
                        objectives += 1;
                    }
                }
                Standing {
                    slot: slot as SlotId,
                    score,
                    objectives,
                }
            })
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn set_score(&mut self, slot: SlotId, score: u32) {
        self.players[slot as usize].score = score;
    }

    #[cfg(test)]
    pub(crate) fn set_mover(&mut self, slot: SlotId) {
        let count = self.players.len() as SlotId;
        self.turn.mover = slot;
        self.turn.last_playing = (slot + count - 1) % count;
    }
}

/// 排名：分数降序，同分按满足目标数降序；仍相同则保持席位顺序
pub fn rank(standings: &[Standing], usernames: &[String]) -> Vec<RankEntry> {
    let mut ranking: Vec<RankEntry> = standings
        .iter()
        .map(|s| RankEntry {
            slot: s.slot,
            username: usernames
                .get(s.slot as usize)
                .cloned()
                .unwrap_or_default(),
            score: s.score,
            objectives: s.objectives,
        })
        .collect();
    ranking.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| b.objectives.cmp(&a.objectives))
    });
    ranking
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn dealt(players: usize) -> Match {
        Match::deal(players, Catalog::standard(), &mut StdRng::seed_from_u64(42))
    }

    fn one_point_card(id: u32) -> Card {
        Card {
            id,
            kind: CardKind::Resource,
            resource: Some(protocol::Resource::Fungi),
            points: 1,
            corners: CornerMask::ALL,
        }
    }

    #[test]
    fn test_deal() {
        let game = dealt(3);
        assert_eq!(game.player_count(), 3);
        for slot in 0..3 {
            let player = game.player(slot).unwrap();
            assert_eq!(player.hand.len(), HAND_SIZE);
            assert_eq!(player.hand.iter().filter(|c| c.is_gold()).count(), 1);
            assert_eq!(player.objective_options.len(), PERSONAL_OBJECTIVE_OPTIONS);
            assert_eq!(player.board.len(), 1);
        }
        assert_eq!(game.shared_objectives().len(), SHARED_OBJECTIVES);

        let turn = game.turn();
        assert_eq!((turn.last_playing + 1) % 3, turn.mover);
        assert_eq!(turn.last_change_index, 0);
        assert!(!turn.final_lap);
    }

    #[test]
    fn test_choose_objective() {
        let mut game = dealt(2);
        assert!(!game.all_objectives_chosen());
        assert_eq!(
            game.choose_objective(0, 2),
            Err(MatchError::InvalidObjective { index: 2 })
        );
        game.choose_objective(0, 1).unwrap();
        assert_eq!(
            game.choose_objective(0, 0),
            Err(MatchError::ObjectiveAlreadyChosen)
        );
        game.choose_objective(1, 0).unwrap();
        assert!(game.all_objectives_chosen());
    }

    #[test]
    fn test_out_of_turn_rejected() {
        let mut game = dealt(2);
        game.set_mover(0);
        let before = game.clone();
        assert_eq!(
            game.apply_turn(1, 0, Side::Front, 0, Corner::TopLeft, 0),
            Err(MatchError::NotYourTurn)
        );
        assert_eq!(game, before);
    }

    #[test]
    fn test_invalid_turn_leaves_state_untouched() {
        let mut game = dealt(2);
        game.set_mover(0);
        let before = game.clone();

        assert!(matches!(
            game.apply_turn(0, 9, Side::Front, 0, Corner::TopLeft, 0),
            Err(MatchError::InvalidHandIndex { index: 9 })
        ));
        assert!(matches!(
            game.apply_turn(0, 0, Side::Front, 4, Corner::TopLeft, 0),
            Err(MatchError::InvalidDeployedIndex { index: 4 })
        ));
        assert!(matches!(
            game.apply_turn(0, 0, Side::Front, 0, Corner::TopLeft, 7),
            Err(MatchError::InvalidDrawIndex { index: 7 })
        ));
        assert_eq!(game, before);
    }

    #[test]
    fn test_turn_advances() {
        let mut game = dealt(2);
        game.set_mover(1);
        game.players[1].hand[0] = one_point_card(500);

        let outcome = game.apply_turn(1, 0, Side::Front, 0, Corner::BottomLeft, 0).unwrap();
        assert!(outcome.drawn.is_some());
        assert!(!outcome.ended);
        assert_eq!(game.current_mover(), 0);
        assert_eq!(game.last_change_index(), 1);
        assert_eq!(game.current_scores(), vec![0, 1]);
        assert_eq!(game.player(1).unwrap().hand.len(), HAND_SIZE);
        assert_eq!(game.player(1).unwrap().board.len(), 2);

        let info = game.game_info();
        assert_eq!(info.mover, 0);
        assert_eq!(info.last_board_change.unwrap().deployed_index, 1);
    }

    #[test]
    fn test_final_lap_and_end() {
        let mut game = dealt(2);
        game.set_mover(0);
        game.set_score(0, WINNING_SCORE - 1);
        for slot in 0..2 {
            for (i, card) in game.players[slot].hand.iter_mut().enumerate() {
                *card = one_point_card(600 + (slot * 10 + i) as u32);
            }
        }

        // 玩家 0 越过阈值，最后一轮开始
        let outcome = game.apply_turn(0, 0, Side::Front, 0, Corner::TopLeft, 0).unwrap();
        assert!(outcome.final_lap_armed);
        assert!(game.is_final_lap_armed());
        assert_eq!(game.turn().last_playing, 0);

        let outcome = game.apply_turn(1, 0, Side::Front, 0, Corner::TopLeft, 0).unwrap();
        assert!(!outcome.ended && !outcome.final_lap_armed);
        assert_ne!(game.last_change_index(), MATCH_OVER);

        let outcome = game.apply_turn(0, 0, Side::Front, 0, Corner::TopRight, 0).unwrap();
        assert!(outcome.ended);
        assert_eq!(game.last_change_index(), MATCH_OVER);
        assert!(game.is_over());

        assert_eq!(
            game.apply_turn(1, 0, Side::Front, 0, Corner::TopRight, 0),
            Err(MatchError::MatchOver)
        );
    }

    fn gold_card(id: u32, requirement: u8) -> Card {
        Card {
            id,
            kind: CardKind::Gold { requirement },
            resource: Some(protocol::Resource::Animal),
            points: 3,
            corners: CornerMask::ALL,
        }
    }

    /// 版图上第一个还能放卡的角
    fn first_open_corner(game: &Match, slot: SlotId) -> (usize, Corner) {
        let board = &game.player(slot).unwrap().board;
        (0..board.len())
            .find_map(|i| {
                let open = board.available_corners(i).unwrap();
                open.corners().first().map(|corner| (i, *corner))
            })
            .expect("board has no open corner")
    }

    /// 按偏好顺序挑一个还有牌的抽牌位置；全部抽空时随便给一个
    fn pick_draw(game: &Match, preference: &[usize]) -> usize {
        preference
            .iter()
            .copied()
            .find(|&i| game.source_has_card(DrawSource::from_index(i).unwrap()))
            .unwrap_or(0)
    }

    #[test]
    fn test_unaffordable_gold_played_face_down() {
        let mut game = dealt(2);
        game.set_mover(0);
        game.players[0].hand = (0..HAND_SIZE as u32).map(|i| gold_card(800 + i, 3)).collect();

        for hand_index in 0..HAND_SIZE {
            assert!(matches!(
                game.apply_turn(0, hand_index, Side::Front, 0, Corner::TopLeft, 0),
                Err(MatchError::RequirementUnmet { .. })
            ));
        }

        let outcome = game.apply_turn(0, 0, Side::Back, 0, Corner::TopLeft, 0).unwrap();
        assert!(outcome.drawn.is_some());
        assert_eq!(game.current_scores(), vec![0, 0]);
        assert_eq!(game.current_mover(), 1);

        let change = game.game_info().last_board_change.unwrap();
        assert_eq!(change.side, Side::Back);
        assert_eq!(change.card.id, 800);
    }

    #[test]
    fn test_gold_only_draws_play_to_the_end() {
        let mut game = Match::deal(2, Catalog::standard(), &mut StdRng::seed_from_u64(0));
        for slot in 0..2 {
            game.players[slot].hand = (0..HAND_SIZE as u32)
                .map(|i| gold_card(900 + (slot * 10) as u32 + i, 3))
                .collect();
        }

        let mut face_down = 0;
        let mut turns = 0;
        while !game.is_over() {
            assert!(turns < 1000, "match did not finish");
            let slot = game.current_mover();
            let (target, corner) = first_open_corner(&game, slot);
            let draw = pick_draw(&game, &[3, 4, 5, 0, 1, 2]);

            let hand_size = game.player(slot).unwrap().hand.len();
            assert!(hand_size > 0, "slot {} ran out of cards", slot);
            let affordable = (0..hand_size).find(|&i| {
                let card = &game.player(slot).unwrap().hand[i];
                game.player(slot).unwrap().board.check_requirement(card).is_ok()
            });
            let (hand_index, side) = match affordable {
                Some(i) => (i, Side::Front),
                None => {
                    face_down += 1;
                    (0, Side::Back)
                }
            };

            game.apply_turn(slot, hand_index, side, target, corner, draw)
                .unwrap();
            turns += 1;
        }

        assert!(face_down > 0);
        assert!(game.is_final_lap_armed());
        assert_eq!(game.last_change_index(), MATCH_OVER);
    }

    #[test]
    fn test_deck_exhaustion_arms_final_lap() {
        let mut game = dealt(2);
        game.set_mover(0);

        // 只背面出牌，分数保持为 0，只有牌堆抽空能触发最后一轮
        let play = |game: &mut Match| {
            let slot = game.current_mover();
            let (target, corner) = first_open_corner(game, slot);
            let draw = pick_draw(game, &[0, 3, 1, 2, 4, 5]);
            let outcome = game
                .apply_turn(slot, 0, Side::Back, target, corner, draw)
                .unwrap();
            (slot, outcome)
        };

        let armed_by = loop {
            let decks_had_cards =
                !game.resource_pile.deck_is_empty() || !game.gold_pile.deck_is_empty();
            assert!(decks_had_cards, "final lap never armed");
            let (slot, outcome) = play(&mut game);
            assert!(!outcome.ended);
            if outcome.final_lap_armed {
                assert!(game.resource_pile.deck_is_empty());
                assert!(game.gold_pile.deck_is_empty());
                assert_eq!(game.turn().last_playing, slot);
                break slot;
            }
        };
        assert_eq!(game.current_scores(), vec![0, 0]);

        let (slot, outcome) = play(&mut game);
        assert_ne!(slot, armed_by);
        assert!(!outcome.ended && !outcome.final_lap_armed);

        let (slot, outcome) = play(&mut game);
        assert_eq!(slot, armed_by);
        assert!(outcome.ended);
        assert!(game.is_over());
    }

    #[test]
    fn test_final_standings_include_objectives() {
        let mut game = dealt(2);
        game.set_score(0, 5);
        let objective = Objective {
            id: 99,
            resource: protocol::Resource::Fungi,
            required: 1,
            points: 2,
        };
        game.players[0].objective = Some(objective);
        game.shared_objectives.clear();
        game.players[0]
            .board
            .place(one_point_card(700), Side::Front, 0, Corner::TopLeft)
            .unwrap();

        let standings = game.final_standings();
        assert_eq!(standings[0], Standing { slot: 0, score: 7, objectives: 1 });
        assert_eq!(standings[1], Standing { slot: 1, score: 0, objectives: 0 });
    }

    #[test]
    fn test_ranking_order() {
        let standings = vec![
            Standing { slot: 0, score: 10, objectives: 1 },
            Standing { slot: 1, score: 10, objectives: 2 },
            Standing { slot: 2, score: 15, objectives: 1 },
        ];
        let names = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let ranking = rank(&standings, &names);

        let summary: Vec<(&str, u32, u8)> = ranking
            .iter()
            .map(|r| (r.username.as_str(), r.score, r.objectives))
            .collect();
        assert_eq!(summary, vec![("C", 15, 1), ("B", 10, 2), ("A", 10, 1)]);
    }
}
