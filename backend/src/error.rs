// Error types shared by the engine, the persistence layer and the creature-data client.

use crate::engine::UserId;

/// Failures raised by a `CreatureDataProvider`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CreatureDataError {
    #[error("creature '{0}' not found")]
    NotFound(String),

    #[error("creature data unavailable: {0}")]
    Unavailable(String),
}

impl CreatureDataError {
    /// Whether a retry might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, CreatureDataError::Unavailable(_))
    }
}

impl From<reqwest::Error> for CreatureDataError {
    fn from(e: reqwest::Error) -> Self {
        CreatureDataError::Unavailable(e.to_string())
    }
}

/// Failures raised by a `PersistenceStore`.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid drop threshold {0}, must be at least 1")]
    InvalidThreshold(i64),
}

impl PersistenceError {
    /// Pool exhaustion and I/O hiccups are worth retrying for reads.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PersistenceError::Database(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_))
        )
    }
}

/// Every way an engine operation can fail.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("you can't battle yourself")]
    SelfChallenge,

    #[error("player {0} is already in a battle or has a pending challenge")]
    AlreadyBusy(UserId),

    #[error("player {0} needs at least one creature to battle")]
    EmptyCollection(UserId),

    #[error("no pending challenge from {challenger} to {opponent}")]
    NoPendingChallenge { challenger: UserId, opponent: UserId },

    #[error("player {0} is not in an active battle")]
    NoActiveSession(UserId),

    #[error("invalid stat '{0}'")]
    InvalidStat(String),

    #[error("player {0} already chose a stat this round")]
    AlreadyChosen(UserId),

    #[error(transparent)]
    CreatureData(#[from] CreatureDataError),

    #[error("persistence failure: {0}")]
    Persistence(#[from] PersistenceError),
}

impl EngineError {
    /// Rejections caused by the caller asking for something the current state forbids.
    /// These never mutate state and carry a reason fit to show the user.
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            EngineError::SelfChallenge
                | EngineError::AlreadyBusy(_)
                | EngineError::EmptyCollection(_)
                | EngineError::NoPendingChallenge { .. }
                | EngineError::NoActiveSession(_)
                | EngineError::InvalidStat(_)
                | EngineError::AlreadyChosen(_)
        )
    }

    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::SelfChallenge => "self_challenge",
            EngineError::AlreadyBusy(_) => "already_busy",
            EngineError::EmptyCollection(_) => "empty_collection",
            EngineError::NoPendingChallenge { .. } => "no_pending_challenge",
            EngineError::NoActiveSession(_) => "no_active_session",
            EngineError::InvalidStat(_) => "invalid_stat",
            EngineError::AlreadyChosen(_) => "already_chosen",
            EngineError::CreatureData(CreatureDataError::NotFound(_)) => "not_found",
            EngineError::CreatureData(CreatureDataError::Unavailable(_)) => "unavailable",
            EngineError::Persistence(_) => "persistence",
        }
    }

    /// Failures that may succeed if the same operation is issued again later.
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::CreatureData(e) => e.is_transient(),
            EngineError::Persistence(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_classification() {
        assert!(EngineError::SelfChallenge.is_invalid_state());
        assert!(EngineError::AlreadyChosen(7).is_invalid_state());
        assert!(EngineError::InvalidStat("luck".into()).is_invalid_state());
        assert!(!EngineError::CreatureData(CreatureDataError::NotFound("x".into()))
            .is_invalid_state());
    }

    #[test]
    fn test_transient_classification() {
        let unavailable = EngineError::CreatureData(CreatureDataError::Unavailable("down".into()));
        assert!(unavailable.is_transient());

        let missing = EngineError::CreatureData(CreatureDataError::NotFound("missingno".into()));
        assert!(!missing.is_transient());

        let pool = EngineError::Persistence(PersistenceError::Database(sqlx::Error::PoolTimedOut));
        assert!(pool.is_transient());

        assert!(!EngineError::NoActiveSession(1).is_transient());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            EngineError::SelfChallenge.to_string(),
            "you can't battle yourself"
        );
        assert_eq!(
            EngineError::NoPendingChallenge {
                challenger: 1,
                opponent: 2
            }
            .to_string(),
            "no pending challenge from 1 to 2"
        );
        assert_eq!(
            CreatureDataError::NotFound("missingno".into()).to_string(),
            "creature 'missingno' not found"
        );
    }
}
