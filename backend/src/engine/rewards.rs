// Battle payouts.
//
// A clean sweep pays the winner 50 and the loser nothing. Every other final
// score, ties included, pays 30 / 20.

use serde::Serialize;

use crate::error::PersistenceError;

use super::{PersistenceStore, UserId};

pub const REWARD_FOR_SWEEP: i64 = 50;
pub const REWARD_FOR_CLOSE_WIN: i64 = 30;
pub const REWARD_FOR_CLOSE_LOSS: i64 = 20;

/// Final score of a full five-round battle won every round.
const SWEEP_WINNER_SCORE: u32 = 5;
const SWEEP_LOSER_SCORE: u32 = 0;

/// Coins paid to the winner slot and the loser slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RewardPair {
    pub winner: i64,
    pub loser: i64,
}

impl RewardPair {
    pub fn is_sweep(&self) -> bool {
        self.winner == REWARD_FOR_SWEEP && self.loser == 0
    }
}

/// Map a final score pair to a payout pair.
pub fn calculate_rewards(winner_score: u32, loser_score: u32) -> RewardPair {
    if winner_score == SWEEP_WINNER_SCORE && loser_score == SWEEP_LOSER_SCORE {
        RewardPair {
            winner: REWARD_FOR_SWEEP,
            loser: 0,
        }
    } else {
        RewardPair {
            winner: REWARD_FOR_CLOSE_WIN,
            loser: REWARD_FOR_CLOSE_LOSS,
        }
    }
}

/// Pay out a finished battle: one win for the winner slot, coins for both.
///
/// Each write happens once. A failure part-way through is surfaced and not
/// retried, since the earlier writes already landed.
pub async fn distribute_rewards(
    store: &dyn PersistenceStore,
    winner_id: UserId,
    loser_id: UserId,
    winner_score: u32,
    loser_score: u32,
) -> Result<RewardPair, PersistenceError> {
    let rewards = calculate_rewards(winner_score, loser_score);

    store.increment_win_count(winner_id).await?;
    store.adjust_currency(winner_id, rewards.winner).await?;
    store.adjust_currency(loser_id, rewards.loser).await?;

    tracing::info!(
        winner_id,
        loser_id,
        winner_score,
        loser_score,
        winner_reward = rewards.winner,
        loser_reward = rewards.loser,
        "Rewards distributed"
    );
    Ok(rewards)
}
