use crate::err::ConfigError;
use core::fmt::{Display, Formatter};

/// How writers coordinate with each other.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Mode {
    /// Writers lock individual objects optimistically and retry on contention. Up to
    /// `max_write_sets` committed write-sets may be outstanding before they are written back.
    FineGrained { max_write_sets: usize },
    /// Writers serialize on named writer locks and every commit is written back immediately.
    CoarseGrained,
}

impl Mode {
    pub(crate) fn max_write_sets(&self) -> usize {
        match self {
            Mode::FineGrained { max_write_sets } => *max_write_sets,
            Mode::CoarseGrained => 1,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            Mode::FineGrained { .. } => "fine-grained",
            Mode::CoarseGrained => "coarse-grained",
        }
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Mode::FineGrained { max_write_sets } => {
                write!(f, "fine-grained [max_write_sets = {max_write_sets}]")
            }
            Mode::CoarseGrained => write!(f, "coarse-grained"),
        }
    }
}

/// Tunables of an [crate::Rlu] instance. Every registered thread allocates
/// `write_set_ring_len * write_set_capacity` bytes of log up front.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Config {
    pub mode: Mode,
    /// Number of write-set slots in each thread's ring.
    pub write_set_ring_len: usize,
    /// Size in bytes of one write-set slot.
    pub write_set_capacity: usize,
    /// Number of objects a thread may free between two write-backs.
    pub max_free_nodes: usize,
    /// A writer waiting for quiescence logs a diagnostic every time it has spun this many times.
    pub quiescence_spin_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::FineGrained { max_write_sets: 1 },
            write_set_ring_len: 4,
            write_set_capacity: 16 * 1024,
            max_free_nodes: 128,
            quiescence_spin_limit: 100_000_000,
        }
    }
}

impl Config {
    pub fn fine_grained(max_write_sets: usize) -> Self {
        Self {
            mode: Mode::FineGrained { max_write_sets },
            write_set_ring_len: core::cmp::max(4, max_write_sets.saturating_mul(2)),
            ..Self::default()
        }
    }

    pub fn coarse_grained() -> Self {
        Self {
            mode: Mode::CoarseGrained,
            ..Self::default()
        }
    }

    pub fn with_write_set_ring_len(mut self, write_set_ring_len: usize) -> Self {
        self.write_set_ring_len = write_set_ring_len;
        self
    }

    pub fn with_write_set_capacity(mut self, write_set_capacity: usize) -> Self {
        self.write_set_capacity = write_set_capacity;
        self
    }

    pub fn with_max_free_nodes(mut self, max_free_nodes: usize) -> Self {
        self.max_free_nodes = max_free_nodes;
        self
    }

    pub fn with_quiescence_spin_limit(mut self, quiescence_spin_limit: usize) -> Self {
        self.quiescence_spin_limit = quiescence_spin_limit;
        self
    }

    pub(crate) fn max_write_sets(&self) -> usize {
        self.mode.max_write_sets()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let max_write_sets: usize = self.max_write_sets();
        if max_write_sets == 0 {
            return Err(ConfigError::ZeroMaxWriteSets);
        }
        if self.write_set_ring_len < 2 {
            return Err(ConfigError::RingTooShort(self.write_set_ring_len));
        }
        if max_write_sets.saturating_mul(2) > self.write_set_ring_len {
            return Err(ConfigError::RingTooShortForMaxWriteSets {
                ring_len: self.write_set_ring_len,
                max_write_sets,
            });
        }
        // smaller slots cannot hold the bookkeeping of a single entry
        if self.write_set_capacity < 64 {
            return Err(ConfigError::WriteSetCapacityTooSmall(self.write_set_capacity));
        }
        if self.max_free_nodes == 0 {
            return Err(ConfigError::ZeroMaxFreeNodes);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
        assert_eq!(Config::coarse_grained().validate(), Ok(()));
        assert_eq!(Config::fine_grained(8).validate(), Ok(()));
    }

    #[test]
    fn test_coarse_grained_writes_back_every_commit() {
        assert_eq!(Config::coarse_grained().max_write_sets(), 1);
    }

    #[test]
    fn test_ring_must_hold_twice_the_outstanding_write_sets() {
        let config: Config = Config::fine_grained(3).with_write_set_ring_len(5);
        assert_eq!(
            config.validate(),
            Err(ConfigError::RingTooShortForMaxWriteSets {
                ring_len: 5,
                max_write_sets: 3
            })
        );
    }

    #[test]
    fn test_degenerate_values_are_rejected() {
        assert_eq!(
            Config::fine_grained(0).validate(),
            Err(ConfigError::ZeroMaxWriteSets)
        );
        assert_eq!(
            Config::default().with_write_set_ring_len(1).validate(),
            Err(ConfigError::RingTooShort(1))
        );
        assert_eq!(
            Config::default().with_write_set_capacity(8).validate(),
            Err(ConfigError::WriteSetCapacityTooSmall(8))
        );
        assert_eq!(
            Config::default().with_max_free_nodes(0).validate(),
            Err(ConfigError::ZeroMaxFreeNodes)
        );
    }
}
