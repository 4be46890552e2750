//! The private half of a registered thread: its section state, write-set log and pending frees.
//!
//! The protocol is split by concern: [reader] enters and leaves sections and redirects
//! dereferences, [writer] locks objects and rolls back, and [quiescence] commits write-sets once
//! every concurrent reader is done with them.

use crate::config::{Config, Mode};
use crate::err::{violation, Error, ProtocolViolation};
use crate::object::Retired;
use crate::rlu::Rlu;
use crate::stats::Stats;
use crate::sync::Ordering;
use crate::types::{is_in_section, RunCounter, ThreadIndex, Version};
use crate::write_set::WriteLog;
use alloc::vec::Vec;

mod quiescence;
mod reader;
mod writer;

pub(crate) struct ThreadContext {
    pub(crate) thread_index: ThreadIndex,

    /// Mirrors the shared run counter, which only this thread writes.
    run_counter: RunCounter,

    /// Snapshot of the global writer version taken at section entry.
    local_version: Version,

    /// Snapshot of the global commit version taken at section entry.
    local_commit_version: Version,

    log: WriteLog,

    free_nodes: Vec<Retired>,

    /// Length of `free_nodes` when the current section started, so an abort can forget the
    /// section's frees.
    section_free_start: usize,

    mode: Mode,
    max_write_sets: usize,
    max_free_nodes: usize,
    quiescence_spin_limit: usize,

    /// The current section locked at least one object.
    is_write_detected: bool,

    /// Another writer may be committing, so copies locked by it may be observable.
    is_steal: bool,

    /// Headers must be inspected on dereference.
    is_check_locks: bool,

    pub(crate) stats: Stats,
}

impl ThreadContext {
    pub(crate) fn new(thread_index: ThreadIndex, config: &Config) -> Result<Self, Error> {
        Ok(Self {
            thread_index,
            run_counter: 0,
            local_version: 0,
            local_commit_version: 0,
            log: WriteLog::new(config.write_set_ring_len, config.write_set_capacity)?,
            free_nodes: Vec::with_capacity(config.max_free_nodes),
            section_free_start: 0,
            mode: config.mode,
            max_write_sets: config.max_write_sets(),
            max_free_nodes: config.max_free_nodes,
            quiescence_spin_limit: config.quiescence_spin_limit,
            is_write_detected: false,
            is_steal: false,
            is_check_locks: true,
            stats: Stats::default(),
        })
    }

    /// Pick up the run counter a previous owner of this slot left behind.
    pub(crate) fn attach<const NUM_THREADS: usize>(&mut self, rlu: &Rlu<NUM_THREADS>) {
        let run_counter: RunCounter = rlu
            .thread(self.thread_index)
            .run_counter
            .load(Ordering::SeqCst);
        if is_in_section(run_counter) {
            violation(ProtocolViolation::AlreadyInSection("register"));
        }
        self.run_counter = run_counter;
    }

    pub(crate) fn is_in_section(&self) -> bool {
        is_in_section(self.run_counter)
    }

    fn assert_in_section(&self, operation: &'static str) {
        if !self.is_in_section() {
            violation(ProtocolViolation::NotInSection(operation));
        }
    }

    fn assert_not_in_section(&self, operation: &'static str) {
        if self.is_in_section() {
            violation(ProtocolViolation::AlreadyInSection(operation));
        }
    }

    fn assert_coarse_grained(&self, operation: &'static str) {
        if self.mode != Mode::CoarseGrained {
            violation(ProtocolViolation::WrongMode(operation, self.mode.name()));
        }
    }

    /// Ask `owner` to write back its outstanding write-sets at its next checkpoint.
    fn send_sync_request<const NUM_THREADS: usize>(
        &mut self,
        rlu: &Rlu<NUM_THREADS>,
        owner: ThreadIndex,
    ) {
        rlu.thread(owner).sync_requests.fetch_add(1, Ordering::SeqCst);
        if owner != self.thread_index {
            self.stats.sync_requests_sent += 1;
        }
    }

    fn has_sync_request<const NUM_THREADS: usize>(&self, rlu: &Rlu<NUM_THREADS>) -> bool {
        rlu.thread(self.thread_index)
            .sync_requests
            .load(Ordering::SeqCst)
            != 0
    }

    /// Release the coarse-grained writer locks recorded in the write-set at `counter`.
    fn release_writer_locks<const NUM_THREADS: usize>(
        &mut self,
        rlu: &Rlu<NUM_THREADS>,
        counter: usize,
    ) {
        let thread_index: ThreadIndex = self.thread_index;
        for writer_lock_id in self.log.slot_mut(counter).writer_locks.drain(..) {
            rlu.release_writer_lock(writer_lock_id, thread_index);
        }
    }
}

#[cfg(all(test, feature = "std", not(feature = "shuttle"), not(loom)))]
mod tests {
    use super::*;
    use crate::object::{alloc, free_unprotected, LockState, RluPtr};
    use test_log::test;

    fn registered<const NUM_THREADS: usize>(rlu: &Rlu<NUM_THREADS>) -> ThreadContext {
        let thread_index: ThreadIndex = rlu.claim_thread_slot().unwrap();
        let mut context: ThreadContext = ThreadContext::new(thread_index, rlu.config()).unwrap();
        context.attach(rlu);
        context
    }

    #[test]
    fn test_section_parity() {
        let rlu: Rlu<1> = Rlu::default();
        let mut context: ThreadContext = registered(&rlu);

        assert!(!context.is_in_section());
        context.reader_lock(&rlu);
        assert!(context.is_in_section());
        assert_eq!(rlu.thread(0).run_counter.load(Ordering::SeqCst), 1);
        context.reader_unlock(&rlu);
        assert!(!context.is_in_section());
        assert_eq!(rlu.thread(0).run_counter.load(Ordering::SeqCst), 2);
        assert_eq!(context.stats.starts, 1);
        assert_eq!(context.stats.finishes, 1);
    }

    #[test]
    fn test_idle_snapshot_skips_header_checks() {
        let rlu: Rlu<1> = Rlu::default();
        let mut context: ThreadContext = registered(&rlu);

        context.reader_lock(&rlu);
        assert!(!context.is_steal);
        assert!(!context.is_check_locks);
        context.reader_unlock(&rlu);
    }

    #[test]
    fn test_in_flight_commit_enables_stealing() {
        let rlu: Rlu<1> = Rlu::default();
        let mut context: ThreadContext = registered(&rlu);
        rlu.writer_version.fetch_add(1, Ordering::SeqCst);

        context.reader_lock(&rlu);
        assert!(context.is_steal);
        assert!(context.is_check_locks);
        context.reader_unlock(&rlu);
    }

    #[test]
    fn test_commit_writes_back_and_advances_versions() {
        let rlu: Rlu<1> = Rlu::default();
        let mut context: ThreadContext = registered(&rlu);
        let object: RluPtr<u64> = alloc(10).unwrap();

        context.reader_lock(&rlu);
        let mut ptr: RluPtr<u64> = object;
        assert!(context.try_lock(&rlu, &mut ptr));
        assert!(unsafe { ptr.is_copy() });
        *unsafe { ptr.as_mut() } = 11;
        assert_eq!(unsafe { *object.as_ref() }, 10);
        context.reader_unlock(&rlu);

        assert_eq!(object.lock_state(), LockState::Unlocked);
        assert_eq!(unsafe { *object.as_ref() }, 11);
        assert_eq!(rlu.writer_version(), 1);
        assert_eq!(rlu.commit_version(), 1);
        assert_eq!((context.log.head, context.log.wb, context.log.tail), (0, 1, 1));
        assert_eq!(context.stats.writer_sections, 1);
        assert_eq!(context.stats.objects_written_back, 1);

        unsafe { free_unprotected(object) };
    }

    #[test]
    fn test_locking_twice_in_one_section_returns_the_same_copy() {
        let rlu: Rlu<1> = Rlu::default();
        let mut context: ThreadContext = registered(&rlu);
        let object: RluPtr<u64> = alloc(1).unwrap();

        context.reader_lock(&rlu);
        let mut first: RluPtr<u64> = object;
        let mut second: RluPtr<u64> = object;
        assert!(context.try_lock(&rlu, &mut first));
        assert!(context.try_lock(&rlu, &mut second));
        assert_eq!(first, second);
        assert_eq!(context.log.current_mut().len(), 1);
        assert_eq!(context.deref(&rlu, object), first);
        context.reader_unlock(&rlu);

        unsafe { free_unprotected(object) };
    }

    #[test]
    fn test_abort_unlocks_and_forgets_frees() {
        let rlu: Rlu<1> = Rlu::default();
        let mut context: ThreadContext = registered(&rlu);
        let object: RluPtr<u64> = alloc(1).unwrap();

        context.reader_lock(&rlu);
        let mut ptr: RluPtr<u64> = object;
        assert!(context.try_lock(&rlu, &mut ptr));
        *unsafe { ptr.as_mut() } = 2;
        context.free(ptr);
        context.abort(&rlu);

        assert!(!context.is_in_section());
        assert_eq!(object.lock_state(), LockState::Unlocked);
        assert_eq!(unsafe { *object.as_ref() }, 1);
        assert!(context.free_nodes.is_empty());
        assert!(context.log.is_empty());
        assert_eq!(context.stats.aborts, 1);

        unsafe { free_unprotected(object) };
    }

    #[test]
    fn test_outstanding_write_sets_are_bounded() {
        let rlu: Rlu<1> = Rlu::new(Config::fine_grained(2)).unwrap();
        let mut context: ThreadContext = registered(&rlu);
        let objects: [RluPtr<u64>; 3] = [alloc(0).unwrap(), alloc(0).unwrap(), alloc(0).unwrap()];

        for (i, object) in objects.iter().enumerate() {
            context.reader_lock(&rlu);
            let mut ptr: RluPtr<u64> = *object;
            assert!(context.try_lock(&rlu, &mut ptr));
            *unsafe { ptr.as_mut() } = i as u64 + 1;
            context.reader_unlock(&rlu);
        }

        // the second commit reached the bound and wrote both back; the third is outstanding
        assert_eq!(context.stats.sync_and_writebacks, 1);
        assert_eq!((context.log.head, context.log.wb, context.log.tail), (0, 2, 3));
        assert_eq!(objects[0].lock_state(), LockState::Unlocked);
        assert!(matches!(objects[2].lock_state(), LockState::LockedBy(_)));
        assert_eq!(unsafe { *objects[2].as_ref() }, 0);

        context.sync_and_writeback(&rlu);
        assert_eq!(unsafe { *objects[2].as_ref() }, 3);
        assert_eq!((context.log.head, context.log.wb, context.log.tail), (2, 3, 3));

        for object in objects {
            unsafe { free_unprotected(object) };
        }
    }

    #[test]
    fn test_relocking_an_outstanding_object_requests_a_checkpoint() {
        let rlu: Rlu<1> = Rlu::new(Config::fine_grained(2)).unwrap();
        let mut context: ThreadContext = registered(&rlu);
        let object: RluPtr<u64> = alloc(0).unwrap();

        context.reader_lock(&rlu);
        let mut ptr: RluPtr<u64> = object;
        assert!(context.try_lock(&rlu, &mut ptr));
        context.reader_unlock(&rlu);

        context.reader_lock(&rlu);
        let mut ptr: RluPtr<u64> = object;
        assert!(!context.try_lock(&rlu, &mut ptr));
        assert!(context.has_sync_request(&rlu));
        context.abort(&rlu);

        // the abort's checkpoint wrote the earlier commit back
        assert_eq!(context.stats.checkpoints, 1);
        assert_eq!(object.lock_state(), LockState::Unlocked);
        assert!(!context.has_sync_request(&rlu));

        unsafe { free_unprotected(object) };
    }

    #[test]
    #[should_panic(expected = "`deref` must be called inside a section")]
    fn test_deref_outside_a_section_is_fatal() {
        let rlu: Rlu<1> = Rlu::default();
        let mut context: ThreadContext = registered(&rlu);
        let object: RluPtr<u64> = alloc(0).unwrap();
        context.deref(&rlu, object);
    }

    #[test]
    #[should_panic(expected = "`try_writer_lock` is not available in fine-grained mode")]
    fn test_writer_locks_require_coarse_grained_mode() {
        let rlu: Rlu<1> = Rlu::default();
        let mut context: ThreadContext = registered(&rlu);
        context.reader_lock(&rlu);
        context.try_writer_lock(&rlu, 0);
    }
}
