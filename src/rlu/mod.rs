use crate::config::Config;
use crate::err::{violation, Error, NoThreadSlotAvailableError, ProtocolViolation};
use crate::handle::{RefThreadHandle, ThreadHandle};
use crate::stats::{GlobalStats, Stats};
use crate::sync::{AtomicBool, AtomicUsize, Ordering};
use crate::types::{
    convert_thread_index_to_thread_id, ThreadId, ThreadIndex, Version, WriterLockId,
    NOT_COMMITTING,
};
use tracing::{debug, info, instrument, trace, warn};

/// Number of entries in the coarse-grained writer lock table.
pub const MAX_WRITER_LOCKS: usize = 20;

/// Maximum number of writer locks one section may hold at once.
pub const MAX_NESTED_WRITER_LOCKS: usize = 20;

/// The value of an unheld entry in the writer lock table.
const NO_WRITER: ThreadId = 0;

/// The part of a thread's execution context which other threads read.
///
/// Only the owning thread writes `run_counter`, `local_version` and `writer_version`;
/// `sync_requests` is incremented by any thread which contends on one of the owner's locks.
#[derive(Debug)]
pub(crate) struct ThreadState {
    /// Whether a [crate::ThreadHandle] currently owns this slot.
    pub(crate) in_use: AtomicBool,
    pub(crate) run_counter: AtomicUsize,
    /// The global writer version observed at the start of the current or last section.
    pub(crate) local_version: AtomicUsize,
    /// The version this thread is committing under, or [NOT_COMMITTING].
    pub(crate) writer_version: AtomicUsize,
    pub(crate) sync_requests: AtomicUsize,
}

impl ThreadState {
    fn new() -> Self {
        Self {
            in_use: AtomicBool::new(false),
            run_counter: AtomicUsize::new(0),
            local_version: AtomicUsize::new(0),
            writer_version: AtomicUsize::new(NOT_COMMITTING),
            sync_requests: AtomicUsize::new(0),
        }
    }
}

/// Holds RLU state shared between all threads: the global version counters, the registry of
/// thread slots, and the coarse-grained writer lock table.
///
/// `NUM_THREADS` is the maximum number of threads registered at any given point in time. Shared
/// memory grows linearly with it; each registered thread additionally allocates its own write-set
/// ring.
#[derive(Debug)]
pub struct Rlu<const NUM_THREADS: usize> {
    config: Config,

    /// Incremented by every writer claiming a commit timestamp.
    pub(crate) writer_version: AtomicUsize,

    /// Incremented by every writer once its write-back is complete.
    pub(crate) commit_version: AtomicUsize,

    pub(crate) num_threads_in_use: AtomicUsize,

    pub(crate) threads: [ThreadState; NUM_THREADS],

    /// Each entry holds the [ThreadId] of the holder, or 0.
    writer_locks: [AtomicUsize; MAX_WRITER_LOCKS],

    stats: GlobalStats,
}

impl<const NUM_THREADS: usize> Rlu<NUM_THREADS> {
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self::with_valid_config(config))
    }

    fn with_valid_config(config: Config) -> Self {
        info!("initializing RLU for {NUM_THREADS} threads in {} mode", config.mode);
        Self {
            config,
            writer_version: AtomicUsize::new(0),
            commit_version: AtomicUsize::new(0),
            num_threads_in_use: AtomicUsize::new(0),
            threads: core::array::from_fn(|_| ThreadState::new()),
            writer_locks: core::array::from_fn(|_| AtomicUsize::new(NO_WRITER)),
            stats: GlobalStats::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The latest commit timestamp claimed by any writer.
    pub fn writer_version(&self) -> usize {
        self.writer_version.load(Ordering::SeqCst)
    }

    /// The number of commits whose write-back has completed.
    pub fn commit_version(&self) -> usize {
        self.commit_version.load(Ordering::SeqCst)
    }

    pub fn num_threads_in_use(&self) -> usize {
        self.num_threads_in_use.load(Ordering::SeqCst)
    }

    /// Statistics of every thread which has finished so far.
    pub fn stats(&self) -> Stats {
        self.stats.snapshot()
    }

    /// Report the statistics of every thread which has finished. Threads still registered are
    /// not included and are reported with a warning.
    pub fn finish(&self) -> Stats {
        let num_threads_in_use: usize = self.num_threads_in_use();
        if num_threads_in_use != 0 {
            warn!("RLU finished with {num_threads_in_use} threads still registered");
        }
        let stats: Stats = self.stats.snapshot();
        info!("RLU finished: {stats}");
        stats
    }

    /// Register the calling thread, borrowing this instance. See [crate::ArcThreadHandle::register]
    /// for a handle which owns a reference count instead.
    pub fn register(&self) -> Result<RefThreadHandle<'_, NUM_THREADS>, Error> {
        ThreadHandle::register(self)
    }

    pub(crate) fn thread(&self, thread_index: ThreadIndex) -> &ThreadState {
        &self.threads[thread_index]
    }

    pub(crate) fn merge_stats(&self, stats: &Stats) {
        self.stats.add(stats);
    }

    #[instrument(skip(self))]
    pub(crate) fn claim_thread_slot(&self) -> Result<ThreadIndex, NoThreadSlotAvailableError> {
        for thread_index in 0..NUM_THREADS {
            let cas_result: Result<bool, bool> = self.threads[thread_index].in_use.compare_exchange(
                false,
                true,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            if cas_result.is_ok() {
                self.num_threads_in_use.fetch_add(1, Ordering::SeqCst);
                debug!("claimed thread slot {thread_index}");
                return Ok(thread_index);
            }
        }
        Err(NoThreadSlotAvailableError(NUM_THREADS))
    }

    pub(crate) fn release_thread_slot(&self, thread_index: ThreadIndex) {
        let thread: &ThreadState = self.thread(thread_index);
        thread.writer_version.store(NOT_COMMITTING, Ordering::SeqCst);
        thread.sync_requests.store(0, Ordering::SeqCst);
        thread.in_use.store(false, Ordering::SeqCst);
        self.num_threads_in_use.fetch_sub(1, Ordering::SeqCst);
        debug!("released thread slot {thread_index}");
    }

    /// The owner's commit timestamp, used by readers deciding whether they may steal its copies.
    pub(crate) fn writer_version_of(&self, thread_index: ThreadIndex) -> Version {
        self.thread(thread_index).writer_version.load(Ordering::SeqCst)
    }

    pub(crate) fn try_acquire_writer_lock(
        &self,
        writer_lock_id: WriterLockId,
        thread_index: ThreadIndex,
    ) -> bool {
        let entry: &AtomicUsize = self.writer_lock(writer_lock_id);
        let thread_id: ThreadId = convert_thread_index_to_thread_id(thread_index);
        let acquired: bool = entry
            .compare_exchange(NO_WRITER, thread_id, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        trace!("thread_index {thread_index}: writer lock {writer_lock_id} acquired: {acquired}");
        acquired
    }

    pub(crate) fn release_writer_lock(&self, writer_lock_id: WriterLockId, thread_index: ThreadIndex) {
        let entry: &AtomicUsize = self.writer_lock(writer_lock_id);
        let thread_id: ThreadId = convert_thread_index_to_thread_id(thread_index);
        if entry
            .compare_exchange(thread_id, NO_WRITER, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            violation(ProtocolViolation::WriterLockNotHeld {
                lock_id: writer_lock_id,
                thread_index,
            });
        }
        trace!("thread_index {thread_index}: writer lock {writer_lock_id} released");
    }

    fn writer_lock(&self, writer_lock_id: WriterLockId) -> &AtomicUsize {
        match self.writer_locks.get(writer_lock_id) {
            Some(entry) => entry,
            None => violation(ProtocolViolation::WriterLockOutOfRange(writer_lock_id)),
        }
    }
}

impl<const NUM_THREADS: usize> Default for Rlu<NUM_THREADS> {
    fn default() -> Self {
        Self::with_valid_config(Config::default())
    }
}

#[cfg(all(test, feature = "std", not(feature = "shuttle"), not(loom)))]
mod tests {
    use super::*;
    use crate::config::Mode;
    use crate::err::ConfigError;
    use test_log::test;

    #[test]
    fn test_thread_slots_are_claimed_and_reused() {
        let rlu: Rlu<2> = Rlu::default();
        assert_eq!(rlu.claim_thread_slot(), Ok(0));
        assert_eq!(rlu.claim_thread_slot(), Ok(1));
        assert_eq!(rlu.claim_thread_slot(), Err(NoThreadSlotAvailableError(2)));
        assert_eq!(rlu.num_threads_in_use(), 2);

        rlu.release_thread_slot(0);
        assert_eq!(rlu.num_threads_in_use(), 1);
        assert_eq!(rlu.claim_thread_slot(), Ok(0));
    }

    #[test]
    fn test_finish_with_registered_threads_reports_only_finished_ones() {
        let rlu: Rlu<2> = Rlu::default();
        let finished: Stats = Stats {
            starts: 2,
            ..Stats::default()
        };
        rlu.merge_stats(&finished);
        assert_eq!(rlu.claim_thread_slot(), Ok(0));

        assert_eq!(rlu.finish(), finished);
        assert_eq!(rlu.num_threads_in_use(), 1);
        rlu.release_thread_slot(0);
        assert_eq!(rlu.finish(), finished);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config: Config = Config {
            mode: Mode::FineGrained { max_write_sets: 0 },
            ..Config::default()
        };
        assert!(matches!(
            Rlu::<2>::new(config),
            Err(Error::InvalidConfig(ConfigError::ZeroMaxWriteSets))
        ));
    }

    #[test]
    fn test_writer_lock_is_exclusive() {
        let rlu: Rlu<2> = Rlu::new(Config::coarse_grained()).unwrap();
        assert!(rlu.try_acquire_writer_lock(3, 0));
        assert!(!rlu.try_acquire_writer_lock(3, 1));
        assert!(rlu.try_acquire_writer_lock(4, 1));

        rlu.release_writer_lock(3, 0);
        assert!(rlu.try_acquire_writer_lock(3, 1));
    }

    #[test]
    #[should_panic(expected = "Writer lock 5 was released by thread 1")]
    fn test_releasing_someone_elses_writer_lock_is_fatal() {
        let rlu: Rlu<2> = Rlu::new(Config::coarse_grained()).unwrap();
        assert!(rlu.try_acquire_writer_lock(5, 0));
        rlu.release_writer_lock(5, 1);
    }

    #[test]
    #[should_panic(expected = "Writer lock 20 does not exist")]
    fn test_writer_lock_ids_are_bounds_checked() {
        let rlu: Rlu<1> = Rlu::default();
        rlu.try_acquire_writer_lock(MAX_WRITER_LOCKS, 0);
    }
}
