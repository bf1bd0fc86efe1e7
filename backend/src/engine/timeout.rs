// Challenge expiry timers.
//
// Each scheduled challenge gets its own sleeping task. Firing and cancelling
// both race for the same atomic flag, so exactly one of them wins per token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{lock, UserId};

/// Handle for one scheduled expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ChallengeToken(Uuid);

impl ChallengeToken {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ChallengeToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

struct TimerSlot {
    settled: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Claim the terminal action for a timer. Only the first caller gets `true`.
fn settle(flag: &AtomicBool) -> bool {
    flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

#[derive(Clone)]
pub struct ChallengeTimeoutScheduler {
    timeout: Duration,
    timers: Arc<Mutex<HashMap<ChallengeToken, TimerSlot>>>,
}

impl ChallengeTimeoutScheduler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start the expiry timer for a challenge. `on_expire` runs at most once,
    /// and never if `cancel` wins first.
    pub fn schedule<F>(
        &self,
        challenger_id: UserId,
        opponent_id: UserId,
        on_expire: F,
    ) -> ChallengeToken
    where
        F: FnOnce(ChallengeToken) + Send + 'static,
    {
        let token = ChallengeToken::new();
        let settled = Arc::new(AtomicBool::new(false));

        let flag = settled.clone();
        let timers = self.timers.clone();
        let timeout = self.timeout;

        // Insert under the lock the task needs, so the slot exists before the task can look for it.
        let mut slots = lock(&self.timers);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if !settle(&flag) {
                return;
            }
            lock(&timers).remove(&token);
            tracing::info!(challenger_id, opponent_id, %token, "Challenge timed out");
            on_expire(token);
        });
        slots.insert(token, TimerSlot { settled, handle });

        tracing::debug!(challenger_id, opponent_id, %token, ?timeout, "Challenge timer scheduled");
        token
    }

    /// Stop a timer that has not fired yet. Returns true if this call
    /// prevented the expiry, false if it already fired or was cancelled.
    pub fn cancel(&self, token: ChallengeToken) -> bool {
        let slot = lock(&self.timers).remove(&token);
        match slot {
            Some(slot) if settle(&slot.settled) => {
                slot.handle.abort();
                tracing::debug!(%token, "Challenge timer cancelled");
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self, token: ChallengeToken) -> bool {
        lock(&self.timers)
            .get(&token)
            .is_some_and(|slot| !slot.settled.load(Ordering::Acquire))
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.timers).len()
    }
}
