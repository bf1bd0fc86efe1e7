// Duel sessions: challenge → accept → alternating stat picks → payout.
//
// Every participant maps to at most one engagement (a pending challenge or an
// active session). The participant map is locked only to look up or swap
// engagements; round bookkeeping runs under the session's own lock, and no
// lock is held while the store or the creature data service is called.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;

use crate::error::{CreatureDataError, EngineError, EngineResult, PersistenceError};
use crate::metrics;
use crate::retry::{retry_transient, RetryPolicy};

use super::notify::{Notification, Notifier};
use super::rewards::{self, RewardPair};
use super::timeout::{ChallengeTimeoutScheduler, ChallengeToken};
use super::{lock, CreatureDataProvider, PersistenceStore, Stat, UserId};

/// Creatures each side brings into a battle.
pub const TEAM_SIZE: usize = 5;

// ── Session model ────────────────────────────────────────────────────

/// An open challenge waiting for the opponent's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeRequest {
    pub challenger_id: UserId,
    pub opponent_id: UserId,
    pub created_at: DateTime<Utc>,
    pub expires_in: Duration,
    pub token: ChallengeToken,
}

/// Where a player stands with respect to battles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantState {
    Idle,
    ChallengePending,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Complete,
}

/// One side of a battle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Participant {
    pub user_id: UserId,
    /// Remaining creatures, in the order they will fight.
    pub queue: VecDeque<String>,
    pub score: u32,
    /// Stat picked for the current round, if any.
    pub pending_stat: Option<Stat>,
}

impl Participant {
    fn new(user_id: UserId, team: Vec<String>) -> Self {
        Self {
            user_id,
            queue: team.into(),
            score: 0,
            pending_stat: None,
        }
    }
}

/// One creature's showing in a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundSide {
    pub user_id: UserId,
    pub creature: String,
    pub stat: Stat,
    pub value: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RoundResult {
    Winner { user_id: UserId },
    Tie,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoundOutcome {
    pub round: u32,
    pub challenger: RoundSide,
    pub opponent: RoundSide,
    pub result: RoundResult,
}

/// Compare two sides on their own chosen stats. Strictly higher wins.
pub fn judge_round(round: u32, challenger: RoundSide, opponent: RoundSide) -> RoundOutcome {
    let result = match challenger.value.cmp(&opponent.value) {
        Ordering::Greater => RoundResult::Winner {
            user_id: challenger.user_id,
        },
        Ordering::Less => RoundResult::Winner {
            user_id: opponent.user_id,
        },
        Ordering::Equal => RoundResult::Tie,
    };
    RoundOutcome {
        round,
        challenger,
        opponent,
        result,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Challenger,
    Opponent,
}

impl Side {
    fn other(self) -> Self {
        match self {
            Side::Challenger => Side::Opponent,
            Side::Opponent => Side::Challenger,
        }
    }
}

/// Both picks are in; the round's creatures and stats, ready to be valued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundDraw {
    pub round: u32,
    pub challenger: (String, Stat),
    pub opponent: (String, Stat),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PickProgress {
    WaitingOn(UserId),
    Ready(RoundDraw),
}

/// A running duel between two players.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BattleSession {
    pub challenger: Participant,
    pub opponent: Participant,
    pub state: SessionState,
    /// Who is prompted to pick first this round.
    pub first_picker: UserId,
    /// Who actually picked first this round.
    first_pick_by: Option<UserId>,
    /// Set while a round's stats are being fetched; blocks further picks.
    resolving: bool,
    pub history: Vec<RoundOutcome>,
    pub started_at: DateTime<Utc>,
}

impl BattleSession {
    pub fn new(
        challenger_id: UserId,
        challenger_team: Vec<String>,
        opponent_id: UserId,
        opponent_team: Vec<String>,
        first_picker: UserId,
    ) -> Self {
        Self {
            challenger: Participant::new(challenger_id, challenger_team),
            opponent: Participant::new(opponent_id, opponent_team),
            state: SessionState::Active,
            first_picker,
            first_pick_by: None,
            resolving: false,
            history: Vec::new(),
            started_at: Utc::now(),
        }
    }

    fn side_of(&self, user_id: UserId) -> Option<Side> {
        if self.challenger.user_id == user_id {
            Some(Side::Challenger)
        } else if self.opponent.user_id == user_id {
            Some(Side::Opponent)
        } else {
            None
        }
    }

    fn participant(&self, side: Side) -> &Participant {
        match side {
            Side::Challenger => &self.challenger,
            Side::Opponent => &self.opponent,
        }
    }

    fn participant_mut(&mut self, side: Side) -> &mut Participant {
        match side {
            Side::Challenger => &mut self.challenger,
            Side::Opponent => &mut self.opponent,
        }
    }

    pub fn round_number(&self) -> u32 {
        self.history.len() as u32 + 1
    }

    /// Rounds the battle will run in total.
    pub fn total_rounds(&self) -> usize {
        self.history.len() + self.challenger.queue.len().min(self.opponent.queue.len())
    }

    /// True once either side has no creatures left.
    pub fn is_exhausted(&self) -> bool {
        self.challenger.queue.is_empty() || self.opponent.queue.is_empty()
    }

    pub fn opponent_of(&self, user_id: UserId) -> Option<UserId> {
        self.side_of(user_id)
            .map(|side| self.participant(side.other()).user_id)
    }

    /// Record a stat pick. Once both sides have picked, the round is drawn
    /// and further picks are refused until it is resolved or aborted.
    fn record_pick(&mut self, user_id: UserId, stat: Stat) -> EngineResult<PickProgress> {
        if self.state != SessionState::Active {
            return Err(EngineError::NoActiveSession(user_id));
        }
        let side = self
            .side_of(user_id)
            .ok_or(EngineError::NoActiveSession(user_id))?;
        if self.resolving || self.participant(side).pending_stat.is_some() {
            return Err(EngineError::AlreadyChosen(user_id));
        }

        self.participant_mut(side).pending_stat = Some(stat);
        self.first_pick_by.get_or_insert(user_id);

        let other = self.participant(side.other());
        if other.pending_stat.is_none() {
            return Ok(PickProgress::WaitingOn(other.user_id));
        }

        let draw = match (
            self.challenger.queue.front(),
            self.challenger.pending_stat,
            self.opponent.queue.front(),
            self.opponent.pending_stat,
        ) {
            (Some(c), Some(cs), Some(o), Some(os)) => Some(RoundDraw {
                round: self.round_number(),
                challenger: (c.clone(), cs),
                opponent: (o.clone(), os),
            }),
            _ => None,
        };
        // An active session always has creatures on both sides.
        let Some(draw) = draw else {
            self.participant_mut(side).pending_stat = None;
            return Err(EngineError::NoActiveSession(user_id));
        };
        self.resolving = true;
        Ok(PickProgress::Ready(draw))
    }

    /// Undo the pick that drew the round, leaving the earlier pick in place.
    fn abort_round(&mut self, user_id: UserId) {
        self.resolving = false;
        if let Some(side) = self.side_of(user_id) {
            self.participant_mut(side).pending_stat = None;
        }
        if self.first_pick_by == Some(user_id) {
            self.first_pick_by = None;
        }
    }

    /// Apply valued picks: consume both head creatures, score, record history,
    /// and choose who picks first next round.
    ///
    /// The loser of a round picks first in the next one. After a tie the
    /// player who picked second this round goes first.
    fn apply_round(
        &mut self,
        draw: RoundDraw,
        challenger_value: i32,
        opponent_value: i32,
    ) -> RoundOutcome {
        self.challenger.queue.pop_front();
        self.opponent.queue.pop_front();

        let outcome = judge_round(
            draw.round,
            RoundSide {
                user_id: self.challenger.user_id,
                creature: draw.challenger.0,
                stat: draw.challenger.1,
                value: challenger_value,
            },
            RoundSide {
                user_id: self.opponent.user_id,
                creature: draw.opponent.0,
                stat: draw.opponent.1,
                value: opponent_value,
            },
        );

        self.first_picker = match outcome.result {
            RoundResult::Winner { user_id } => {
                let winner = if user_id == self.challenger.user_id {
                    Side::Challenger
                } else {
                    Side::Opponent
                };
                self.participant_mut(winner).score += 1;
                self.participant(winner.other()).user_id
            }
            RoundResult::Tie => {
                let first = self.first_pick_by.unwrap_or(self.first_picker);
                self.opponent_of(first).unwrap_or(self.first_picker)
            }
        };

        self.challenger.pending_stat = None;
        self.opponent.pending_stat = None;
        self.first_pick_by = None;
        self.resolving = false;
        self.history.push(outcome.clone());

        if self.is_exhausted() {
            self.state = SessionState::Complete;
        }
        outcome
    }
}

/// Final standing of one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FinalScore {
    pub user_id: UserId,
    pub score: u32,
    pub reward: i64,
}

/// Everything worth telling players once a battle ends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BattleSummary {
    pub challenger: FinalScore,
    pub opponent: FinalScore,
    /// `None` on a tie.
    pub winner: Option<UserId>,
    /// False when the payout could not be written.
    pub paid: bool,
    pub rounds: Vec<RoundOutcome>,
}

/// Result of a successful stat pick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatChoice {
    /// Recorded; the opponent has not picked yet.
    Waiting,
    RoundResolved(RoundOutcome),
    BattleFinished(BattleSummary),
}

/// What an accepted challenge started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BattleStart {
    pub first_picker: UserId,
    pub challenger_team: Vec<String>,
    pub opponent_team: Vec<String>,
}

/// Draw up to `TEAM_SIZE` entries without replacement. With fewer owned,
/// everything owned is used.
pub fn sample_team<R: Rng + ?Sized>(rng: &mut R, collection: &[String]) -> Vec<String> {
    collection
        .choose_multiple(rng, TEAM_SIZE.min(collection.len()))
        .cloned()
        .collect()
}

// ── Manager ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Engagement {
    Challenge(ChallengeRequest),
    Battle(Arc<Mutex<BattleSession>>),
}

struct Inner {
    participants: Mutex<HashMap<UserId, Engagement>>,
    scheduler: ChallengeTimeoutScheduler,
    store: Arc<dyn PersistenceStore>,
    creatures: Arc<dyn CreatureDataProvider>,
    notifier: Notifier,
    retry: RetryPolicy,
}

/// Runs every challenge and battle. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct BattleSessionManager {
    inner: Arc<Inner>,
}

impl BattleSessionManager {
    pub fn new(
        scheduler: ChallengeTimeoutScheduler,
        store: Arc<dyn PersistenceStore>,
        creatures: Arc<dyn CreatureDataProvider>,
        notifier: Notifier,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                participants: Mutex::new(HashMap::new()),
                scheduler,
                store,
                creatures,
                notifier,
                retry,
            }),
        }
    }

    pub fn participant_state(&self, user_id: UserId) -> ParticipantState {
        match lock(&self.inner.participants).get(&user_id) {
            None => ParticipantState::Idle,
            Some(Engagement::Challenge(_)) => ParticipantState::ChallengePending,
            Some(Engagement::Battle(_)) => ParticipantState::Active,
        }
    }

    pub fn pending_challenge(&self, user_id: UserId) -> Option<ChallengeRequest> {
        match lock(&self.inner.participants).get(&user_id) {
            Some(Engagement::Challenge(request)) => Some(request.clone()),
            _ => None,
        }
    }

    /// Copy of the player's running battle.
    pub fn session(&self, user_id: UserId) -> Option<BattleSession> {
        self.session_handle(user_id).map(|s| lock(&s).clone())
    }

    fn session_handle(&self, user_id: UserId) -> Option<Arc<Mutex<BattleSession>>> {
        match lock(&self.inner.participants).get(&user_id) {
            Some(Engagement::Battle(session)) => Some(session.clone()),
            _ => None,
        }
    }

    fn ensure_idle(&self, ids: [UserId; 2]) -> EngineResult<()> {
        let participants = lock(&self.inner.participants);
        match ids.into_iter().find(|id| participants.contains_key(id)) {
            Some(busy) => Err(EngineError::AlreadyBusy(busy)),
            None => Ok(()),
        }
    }

    async fn read_collection(&self, user_id: UserId) -> EngineResult<Vec<String>> {
        let store = self.inner.store.clone();
        let collection = retry_transient(
            "persistence",
            self.inner.retry,
            PersistenceError::is_transient,
            move || {
                let store = store.clone();
                async move { store.get_collection(user_id).await }
            },
        )
        .await?;
        Ok(collection)
    }

    /// Remove a challenge's entries, provided they still belong to it.
    fn release_challenge(&self, token: ChallengeToken, ids: [UserId; 2]) -> bool {
        let mut participants = lock(&self.inner.participants);
        let mut released = false;
        for id in ids {
            if matches!(participants.get(&id), Some(Engagement::Challenge(r)) if r.token == token) {
                participants.remove(&id);
                released = true;
            }
        }
        released
    }

    /// Issue a challenge from `challenger_id` to `opponent_id`.
    pub async fn create_challenge(
        &self,
        challenger_id: UserId,
        opponent_id: UserId,
    ) -> EngineResult<ChallengeRequest> {
        if challenger_id == opponent_id {
            return Err(EngineError::SelfChallenge);
        }
        self.ensure_idle([challenger_id, opponent_id])?;

        for id in [challenger_id, opponent_id] {
            if self.read_collection(id).await?.is_empty() {
                return Err(EngineError::EmptyCollection(id));
            }
        }

        let request = {
            let mut participants = lock(&self.inner.participants);
            // Someone may have engaged either player while collections were read.
            if let Some(busy) = [challenger_id, opponent_id]
                .into_iter()
                .find(|id| participants.contains_key(id))
            {
                return Err(EngineError::AlreadyBusy(busy));
            }

            let manager = self.clone();
            let token = self.inner.scheduler.schedule(challenger_id, opponent_id, move |token| {
                manager.expire_challenge(token, challenger_id, opponent_id);
            });
            let request = ChallengeRequest {
                challenger_id,
                opponent_id,
                created_at: Utc::now(),
                expires_in: self.inner.scheduler.timeout(),
                token,
            };
            participants.insert(challenger_id, Engagement::Challenge(request.clone()));
            participants.insert(opponent_id, Engagement::Challenge(request.clone()));
            request
        };

        metrics::PENDING_CHALLENGES.inc();
        metrics::CHALLENGES_TOTAL.with_label_values(&["issued"]).inc();
        tracing::info!(challenger_id, opponent_id, token = %request.token, "Challenge issued");
        self.inner.notifier.send(Notification::ChallengeIssued {
            challenger_id,
            opponent_id,
            expires_in_secs: request.expires_in.as_secs(),
        });
        Ok(request)
    }

    /// Timer callback: drop the pending request and tell both players once.
    fn expire_challenge(&self, token: ChallengeToken, challenger_id: UserId, opponent_id: UserId) {
        if !self.release_challenge(token, [challenger_id, opponent_id]) {
            return;
        }
        metrics::PENDING_CHALLENGES.dec();
        metrics::CHALLENGES_TOTAL.with_label_values(&["expired"]).inc();
        self.inner.notifier.send(Notification::ChallengeExpired {
            challenger_id,
            opponent_id,
        });
    }

    /// Find the open challenge between exactly these two players.
    fn pending_between(
        &self,
        challenger_id: UserId,
        opponent_id: UserId,
    ) -> EngineResult<ChallengeRequest> {
        match self.pending_challenge(opponent_id) {
            Some(request)
                if request.challenger_id == challenger_id && request.opponent_id == opponent_id =>
            {
                Ok(request)
            }
            _ => Err(EngineError::NoPendingChallenge {
                challenger: challenger_id,
                opponent: opponent_id,
            }),
        }
    }

    /// Take ownership of an open challenge by stopping its timer. Fails when
    /// the request has expired or another accept/decline settled it first.
    fn claim_challenge(&self, request: &ChallengeRequest) -> EngineResult<()> {
        if !self.inner.scheduler.cancel(request.token) {
            return Err(EngineError::NoPendingChallenge {
                challenger: request.challenger_id,
                opponent: request.opponent_id,
            });
        }
        metrics::PENDING_CHALLENGES.dec();
        Ok(())
    }

    fn cancel_claimed(&self, request: &ChallengeRequest, reason: String) {
        self.release_challenge(request.token, [request.challenger_id, request.opponent_id]);
        metrics::CHALLENGES_TOTAL.with_label_values(&["canceled"]).inc();
        tracing::info!(
            challenger_id = request.challenger_id,
            opponent_id = request.opponent_id,
            %reason,
            "Battle canceled"
        );
        self.inner.notifier.send(Notification::BattleCanceled {
            challenger_id: request.challenger_id,
            opponent_id: request.opponent_id,
            reason,
        });
    }

    /// Accept an open challenge and start the battle.
    pub async fn accept_challenge(
        &self,
        challenger_id: UserId,
        opponent_id: UserId,
    ) -> EngineResult<BattleStart> {
        let request = self.pending_between(challenger_id, opponent_id)?;

        // Read while the challenge is still open so a failed read leaves it
        // pending and the accept can be retried.
        let mut collections = Vec::with_capacity(2);
        for id in [challenger_id, opponent_id] {
            let collection = self.read_collection(id).await?;
            if collection.is_empty() {
                self.claim_challenge(&request)?;
                self.cancel_claimed(
                    &request,
                    "One or both players have no creatures.".to_string(),
                );
                return Err(EngineError::EmptyCollection(id));
            }
            collections.push(collection);
        }
        self.claim_challenge(&request)?;

        let start = {
            let mut rng = rand::thread_rng();
            BattleStart {
                challenger_team: sample_team(&mut rng, &collections[0]),
                opponent_team: sample_team(&mut rng, &collections[1]),
                first_picker: if rng.gen_bool(0.5) {
                    challenger_id
                } else {
                    opponent_id
                },
            }
        };

        let session = BattleSession::new(
            challenger_id,
            start.challenger_team.clone(),
            opponent_id,
            start.opponent_team.clone(),
            start.first_picker,
        );
        let rounds = session.total_rounds();
        let session = Arc::new(Mutex::new(session));
        {
            let mut participants = lock(&self.inner.participants);
            participants.insert(challenger_id, Engagement::Battle(session.clone()));
            participants.insert(opponent_id, Engagement::Battle(session));
        }

        metrics::ACTIVE_BATTLES.inc();
        metrics::CHALLENGES_TOTAL.with_label_values(&["accepted"]).inc();
        tracing::info!(
            challenger_id,
            opponent_id,
            first_picker = start.first_picker,
            rounds,
            "Battle started"
        );
        self.inner.notifier.send(Notification::BattleStarted {
            challenger_id,
            opponent_id,
            first_picker: start.first_picker,
            rounds,
        });
        self.inner.notifier.send(Notification::StatPrompt {
            user_id: start.first_picker,
            round: 1,
            opponent_chose: false,
        });
        Ok(start)
    }

    /// Turn an open challenge down.
    pub fn decline_challenge(
        &self,
        challenger_id: UserId,
        opponent_id: UserId,
    ) -> EngineResult<()> {
        let request = self.pending_between(challenger_id, opponent_id)?;
        self.claim_challenge(&request)?;
        self.release_challenge(request.token, [challenger_id, opponent_id]);

        metrics::CHALLENGES_TOTAL.with_label_values(&["declined"]).inc();
        tracing::info!(challenger_id, opponent_id, "Challenge declined");
        self.inner.notifier.send(Notification::ChallengeDeclined {
            challenger_id,
            opponent_id,
        });
        Ok(())
    }

    /// Record a player's stat for the current round, resolving the round once
    /// both sides have picked.
    pub async fn choose_stat(&self, user_id: UserId, stat: &str) -> EngineResult<StatChoice> {
        let session = self
            .session_handle(user_id)
            .ok_or(EngineError::NoActiveSession(user_id))?;
        let stat =
            Stat::from_str_name(stat).ok_or_else(|| EngineError::InvalidStat(stat.to_string()))?;

        let progress = lock(&session).record_pick(user_id, stat)?;
        match progress {
            PickProgress::WaitingOn(opponent_id) => {
                let round = lock(&session).round_number();
                tracing::debug!(user_id, %stat, round, "Stat chosen, waiting on opponent");
                self.inner.notifier.send(Notification::StatPrompt {
                    user_id: opponent_id,
                    round,
                    opponent_chose: true,
                });
                Ok(StatChoice::Waiting)
            }
            PickProgress::Ready(draw) => self.resolve_round(session, user_id, draw).await,
        }
    }

    async fn creature_value(&self, creature: &str, stat: Stat) -> EngineResult<i32> {
        match self.inner.creatures.fetch_stats(creature).await {
            Ok(stats) => Ok(stats.get(stat)),
            Err(CreatureDataError::NotFound(name)) => {
                // Nothing to compare; the creature fights with zero.
                tracing::warn!(creature = %name, "Stats not found, counting as 0");
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_round(
        &self,
        session: Arc<Mutex<BattleSession>>,
        user_id: UserId,
        draw: RoundDraw,
    ) -> EngineResult<StatChoice> {
        let (challenger_value, opponent_value) = tokio::join!(
            self.creature_value(&draw.challenger.0, draw.challenger.1),
            self.creature_value(&draw.opponent.0, draw.opponent.1),
        );
        let values = challenger_value.and_then(|c| opponent_value.map(|o| (c, o)));
        let (challenger_value, opponent_value) = match values {
            Ok(values) => values,
            Err(e) => {
                lock(&session).abort_round(user_id);
                tracing::warn!(user_id, round = draw.round, "Round aborted: {e}");
                return Err(e);
            }
        };

        let (outcome, finished, next_picker, next_round) = {
            let mut s = lock(&session);
            let outcome = s.apply_round(draw, challenger_value, opponent_value);
            let finished = (s.state == SessionState::Complete).then(|| (*s).clone());
            (outcome, finished, s.first_picker, s.round_number())
        };

        metrics::ROUNDS_RESOLVED_TOTAL.inc();
        tracing::info!(
            challenger_id = outcome.challenger.user_id,
            opponent_id = outcome.opponent.user_id,
            round = outcome.round,
            result = ?outcome.result,
            "Round resolved"
        );
        self.inner.notifier.send(Notification::RoundResolved {
            challenger_id: outcome.challenger.user_id,
            opponent_id: outcome.opponent.user_id,
            outcome: outcome.clone(),
        });

        if let Some(finished) = finished {
            return self
                .declare_winner(&session, finished)
                .await
                .map(StatChoice::BattleFinished);
        }

        self.inner.notifier.send(Notification::StatPrompt {
            user_id: next_picker,
            round: next_round,
            opponent_chose: false,
        });
        Ok(StatChoice::RoundResolved(outcome))
    }

    /// Settle a completed battle: free both players, pay out once, report.
    async fn declare_winner(
        &self,
        handle: &Arc<Mutex<BattleSession>>,
        session: BattleSession,
    ) -> EngineResult<BattleSummary> {
        let challenger_id = session.challenger.user_id;
        let opponent_id = session.opponent.user_id;
        {
            let mut participants = lock(&self.inner.participants);
            for id in [challenger_id, opponent_id] {
                if matches!(
                    participants.get(&id),
                    Some(Engagement::Battle(s)) if Arc::ptr_eq(s, handle)
                ) {
                    participants.remove(&id);
                }
            }
        }
        metrics::ACTIVE_BATTLES.dec();

        let challenger_score = session.challenger.score;
        let opponent_score = session.opponent.score;
        let winner = match challenger_score.cmp(&opponent_score) {
            Ordering::Greater => Some(challenger_id),
            Ordering::Less => Some(opponent_id),
            Ordering::Equal => None,
        };
        // A tie still pays out; the challenger takes the winner slot.
        let challenger_in_winner_slot = winner != Some(opponent_id);
        let (slot_winner, slot_loser, winner_score, loser_score) = if challenger_in_winner_slot {
            (challenger_id, opponent_id, challenger_score, opponent_score)
        } else {
            (opponent_id, challenger_id, opponent_score, challenger_score)
        };

        let payout = rewards::distribute_rewards(
            self.inner.store.as_ref(),
            slot_winner,
            slot_loser,
            winner_score,
            loser_score,
        )
        .await;

        let planned = rewards::calculate_rewards(winner_score, loser_score);
        let paid = payout.is_ok();
        let RewardPair {
            winner: winner_reward,
            loser: loser_reward,
        } = planned;
        let (challenger_reward, opponent_reward) = if challenger_in_winner_slot {
            (winner_reward, loser_reward)
        } else {
            (loser_reward, winner_reward)
        };

        let summary = BattleSummary {
            challenger: FinalScore {
                user_id: challenger_id,
                score: challenger_score,
                reward: if paid { challenger_reward } else { 0 },
            },
            opponent: FinalScore {
                user_id: opponent_id,
                score: opponent_score,
                reward: if paid { opponent_reward } else { 0 },
            },
            winner,
            paid,
            rounds: session.history,
        };

        let result_label = match (winner, planned.is_sweep()) {
            (None, _) => "tie",
            (Some(_), true) => "sweep",
            (Some(_), false) => "win",
        };
        metrics::BATTLES_COMPLETED_TOTAL
            .with_label_values(&[result_label])
            .inc();
        tracing::info!(
            challenger_id,
            opponent_id,
            challenger_score,
            opponent_score,
            winner = ?winner,
            paid,
            "Battle finished"
        );
        self.inner.notifier.send(Notification::BattleFinished {
            summary: summary.clone(),
        });

        match payout {
            Ok(_) => Ok(summary),
            Err(e) => {
                tracing::error!(challenger_id, opponent_id, "Failed to pay out battle: {e}");
                Err(e.into())
            }
        }
    }
}
