//! Row-level lock modes and options.

use std::fmt;

/// Requested locking strength for a load.
///
/// Modes are ordered by strength; [`LockMode::level`] gives the ordering
/// used for upgrade decisions. Several modes share a level (e.g. `Write`
/// and `UpgradeNoWait`), which makes neither stronger than the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LockMode {
    /// No lock; the entity may come from any cache tier.
    #[default]
    None,
    /// Read from the database, bypassing the second-level cache.
    Read,
    /// Verify the version at transaction end.
    Optimistic,
    /// Increment the version at transaction end.
    OptimisticForceIncrement,
    /// Obtained implicitly when a row is written.
    Write,
    /// `FOR UPDATE NOWAIT`
    UpgradeNoWait,
    /// `FOR UPDATE SKIP LOCKED`
    UpgradeSkipLocked,
    /// Shared row lock (`FOR SHARE` where supported).
    PessimisticRead,
    /// Exclusive row lock (`FOR UPDATE`).
    PessimisticWrite,
    /// Exclusive row lock plus an immediate version increment.
    PessimisticForceIncrement,
}

impl LockMode {
    /// Relative strength of this mode.
    pub const fn level(self) -> u8 {
        match self {
            LockMode::None => 0,
            LockMode::Read => 5,
            LockMode::Optimistic => 6,
            LockMode::OptimisticForceIncrement => 7,
            LockMode::Write | LockMode::UpgradeNoWait | LockMode::UpgradeSkipLocked => 10,
            LockMode::PessimisticRead => 12,
            LockMode::PessimisticWrite => 13,
            LockMode::PessimisticForceIncrement => 17,
        }
    }

    /// Is this mode strictly stronger than `other`?
    pub const fn greater_than(self, other: LockMode) -> bool {
        self.level() > other.level()
    }

    /// Is this mode strictly weaker than `other`?
    pub const fn less_than(self, other: LockMode) -> bool {
        self.level() < other.level()
    }

    /// Does acquiring this mode require a database row lock?
    pub const fn is_pessimistic(self) -> bool {
        matches!(
            self,
            LockMode::Write
                | LockMode::UpgradeNoWait
                | LockMode::UpgradeSkipLocked
                | LockMode::PessimisticRead
                | LockMode::PessimisticWrite
                | LockMode::PessimisticForceIncrement
        )
    }

    /// Name used in logs and configuration.
    pub const fn as_str(self) -> &'static str {
        match self {
            LockMode::None => "none",
            LockMode::Read => "read",
            LockMode::Optimistic => "optimistic",
            LockMode::OptimisticForceIncrement => "optimistic_force_increment",
            LockMode::Write => "write",
            LockMode::UpgradeNoWait => "upgrade_nowait",
            LockMode::UpgradeSkipLocked => "upgrade_skiplocked",
            LockMode::PessimisticRead => "pessimistic_read",
            LockMode::PessimisticWrite => "pessimistic_write",
            LockMode::PessimisticForceIncrement => "pessimistic_force_increment",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How long a pessimistic lock request may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LockTimeout {
    /// Wait as long as the database allows.
    #[default]
    Wait,
    /// Fail immediately when the row is locked.
    NoWait,
    /// Skip rows that are locked.
    SkipLocked,
    /// Wait at most this many milliseconds.
    Millis(u64),
}

/// Lock mode plus timeout for a single load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LockOptions {
    pub lock_mode: LockMode,
    pub timeout: LockTimeout,
}

impl LockOptions {
    /// Options with no lock.
    pub const NONE: LockOptions = LockOptions {
        lock_mode: LockMode::None,
        timeout: LockTimeout::Wait,
    };

    /// Options for the given mode with the default timeout.
    #[must_use]
    pub const fn new(lock_mode: LockMode) -> Self {
        let timeout = match lock_mode {
            LockMode::UpgradeNoWait => LockTimeout::NoWait,
            LockMode::UpgradeSkipLocked => LockTimeout::SkipLocked,
            _ => LockTimeout::Wait,
        };
        Self { lock_mode, timeout }
    }

    /// Set the timeout (builder pattern).
    #[must_use]
    pub const fn timeout(mut self, timeout: LockTimeout) -> Self {
        self.timeout = timeout;
        self
    }
}

impl From<LockMode> for LockOptions {
    fn from(mode: LockMode) -> Self {
        LockOptions::new(mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_levels() {
        assert!(LockMode::Write.greater_than(LockMode::Read));
        assert!(LockMode::PessimisticWrite.greater_than(LockMode::PessimisticRead));
        assert!(LockMode::None.less_than(LockMode::Read));
        assert!(!LockMode::Read.greater_than(LockMode::Read));
        assert!(!LockMode::Write.greater_than(LockMode::UpgradeNoWait));
    }

    #[test]
    fn pessimistic_modes() {
        assert!(LockMode::PessimisticWrite.is_pessimistic());
        assert!(!LockMode::Optimistic.is_pessimistic());
        assert!(!LockMode::Read.is_pessimistic());
    }

    #[test]
    fn options_pick_timeout_from_mode() {
        assert_eq!(
            LockOptions::new(LockMode::UpgradeNoWait).timeout,
            LockTimeout::NoWait
        );
        assert_eq!(LockOptions::from(LockMode::Read).timeout, LockTimeout::Wait);
        assert_eq!(LockOptions::default(), LockOptions::NONE);
    }
}
