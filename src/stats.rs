use crate::sync::{AtomicUsize, Ordering};
use core::fmt::{Display, Formatter};

const NUM_COUNTERS: usize = 12;

/// Protocol counters of one thread, or of every thread which has finished with an [crate::Rlu].
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct Stats {
    /// Sections entered.
    pub starts: usize,
    /// Sections left, committing or not.
    pub finishes: usize,
    /// Sections which locked at least one object and committed.
    pub writer_sections: usize,
    pub aborts: usize,
    /// Requests sent to other threads to write back a write-set we contended on.
    pub sync_requests_sent: usize,
    /// Write-backs performed at section entry or exit because a request was pending.
    pub checkpoints: usize,
    pub sync_and_writebacks: usize,
    pub write_sets_written_back: usize,
    pub objects_written_back: usize,
    /// Dereferences which returned another thread's in-flight copy.
    pub steals: usize,
    pub frees: usize,
    /// Iterations spent waiting for other threads to quiesce.
    pub quiescence_spins: usize,
}

impl Stats {
    /// Add `other` into `self`.
    pub fn merge(&mut self, other: &Stats) {
        let mut counters: [usize; NUM_COUNTERS] = self.to_counters();
        let other_counters: [usize; NUM_COUNTERS] = other.to_counters();
        for (counter, other_counter) in counters.iter_mut().zip(other_counters.iter()) {
            *counter += *other_counter;
        }
        *self = Self::from_counters(counters);
    }

    fn to_counters(self) -> [usize; NUM_COUNTERS] {
        [
            self.starts,
            self.finishes,
            self.writer_sections,
            self.aborts,
            self.sync_requests_sent,
            self.checkpoints,
            self.sync_and_writebacks,
            self.write_sets_written_back,
            self.objects_written_back,
            self.steals,
            self.frees,
            self.quiescence_spins,
        ]
    }

    fn from_counters(counters: [usize; NUM_COUNTERS]) -> Self {
        let [starts, finishes, writer_sections, aborts, sync_requests_sent, checkpoints, sync_and_writebacks, write_sets_written_back, objects_written_back, steals, frees, quiescence_spins] =
            counters;
        Self {
            starts,
            finishes,
            writer_sections,
            aborts,
            sync_requests_sent,
            checkpoints,
            sync_and_writebacks,
            write_sets_written_back,
            objects_written_back,
            steals,
            frees,
            quiescence_spins,
        }
    }
}

impl Display for Stats {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "starts={} finishes={} writers={} aborts={} sync_requests={} checkpoints={} \
             sync_and_writebacks={} write_sets_written_back={} objects_written_back={} steals={} \
             frees={} quiescence_spins={}",
            self.starts,
            self.finishes,
            self.writer_sections,
            self.aborts,
            self.sync_requests_sent,
            self.checkpoints,
            self.sync_and_writebacks,
            self.write_sets_written_back,
            self.objects_written_back,
            self.steals,
            self.frees,
            self.quiescence_spins,
        )
    }
}

/// Statistics merged in from threads as they finish.
#[derive(Debug)]
pub(crate) struct GlobalStats {
    counters: [AtomicUsize; NUM_COUNTERS],
}

impl GlobalStats {
    pub(crate) fn new() -> Self {
        Self {
            counters: core::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }

    pub(crate) fn add(&self, stats: &Stats) {
        for (counter, value) in self.counters.iter().zip(stats.to_counters().iter()) {
            counter.fetch_add(*value, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(&self) -> Stats {
        Stats::from_counters(core::array::from_fn(|i| {
            self.counters[i].load(Ordering::Relaxed)
        }))
    }
}
