use core::fmt;
use thiserror::Error;

/// Why a transaction attempt was rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    /// The application called [`Transaction::abort`](crate::Transaction::abort).
    Explicit,
    /// A load found the lock owned by another transaction.
    ReadLocked,
    /// A store found the lock owned by another transaction.
    WriteLocked,
    /// A load saw a newer version and the snapshot could not be extended.
    ReadValidation,
    /// A store saw a newer version on a lock this transaction had already read.
    WriteValidation,
    /// The read set was no longer valid at commit time.
    CommitValidation,
    /// A higher priority transaction asked this one to step aside.
    Killed,
    /// The write set ran out of room while lock words referenced its entries.
    WriteSetGrowth,
    /// A store was attempted under the read-only hint.
    ReadOnlyWrite,
}

impl AbortReason {
    /// Every reason, in the order used by statistics.
    pub const ALL: [AbortReason; 9] = [
        AbortReason::Explicit,
        AbortReason::ReadLocked,
        AbortReason::WriteLocked,
        AbortReason::ReadValidation,
        AbortReason::WriteValidation,
        AbortReason::CommitValidation,
        AbortReason::Killed,
        AbortReason::WriteSetGrowth,
        AbortReason::ReadOnlyWrite,
    ];

    /// Short snake-case name, used for statistics keys.
    pub const fn name(self) -> &'static str {
        match self {
            AbortReason::Explicit => "explicit",
            AbortReason::ReadLocked => "read_locked",
            AbortReason::WriteLocked => "write_locked",
            AbortReason::ReadValidation => "read_validation",
            AbortReason::WriteValidation => "write_validation",
            AbortReason::CommitValidation => "commit_validation",
            AbortReason::Killed => "killed",
            AbortReason::WriteSetGrowth => "write_set_growth",
            AbortReason::ReadOnlyWrite => "read_only_write",
        }
    }

    #[inline]
    pub(crate) const fn index(self) -> usize {
        self as usize
    }

    /// Conflicts with another writer, as opposed to stale snapshots.
    pub const fn is_conflict(self) -> bool {
        matches!(self, AbortReason::ReadLocked | AbortReason::WriteLocked)
    }

    /// Aborts caused by a failed snapshot validation.
    pub const fn is_validation(self) -> bool {
        matches!(
            self,
            AbortReason::ReadValidation
                | AbortReason::WriteValidation
                | AbortReason::CommitValidation
        )
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors surfaced by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StmError {
    /// The transaction was rolled back; retry from its start.
    #[error("transaction aborted: {0}")]
    Aborted(AbortReason),
    /// A transactional operation was issued with no active transaction.
    #[error("no active transaction on this descriptor")]
    NotActive,
    /// The configuration was rejected by [`Config::validate`](crate::Config::validate).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// All descriptor ids are in use.
    #[error("exceeded maximum descriptor count ({max})")]
    TooManyThreads { max: usize },
    /// All specific-data slots have been handed out.
    #[error("exceeded maximum specific-data slot count ({max})")]
    TooManySlots { max: usize },
    /// The global engine was already initialised.
    #[error("global engine already initialized")]
    AlreadyInitialized,
    /// Parameter name not known to the engine.
    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),
}

impl StmError {
    /// `true` when retrying the transaction can make progress.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StmError::Aborted(_))
    }

    /// The abort reason, if this error is an abort.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            StmError::Aborted(reason) => Some(*reason),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_indices_match_table() {
        for (i, reason) in AbortReason::ALL.iter().enumerate() {
            assert_eq!(reason.index(), i);
        }
    }

    #[test]
    fn classification() {
        assert!(AbortReason::ReadLocked.is_conflict());
        assert!(!AbortReason::ReadLocked.is_validation());
        assert!(AbortReason::CommitValidation.is_validation());
        assert!(!AbortReason::Explicit.is_conflict());
    }

    #[test]
    fn display() {
        let err = StmError::Aborted(AbortReason::WriteSetGrowth);
        assert_eq!(err.to_string(), "transaction aborted: write_set_growth");
        assert!(err.is_retryable());
        assert_eq!(err.abort_reason(), Some(AbortReason::WriteSetGrowth));
        assert!(!StmError::NotActive.is_retryable());
    }
}
