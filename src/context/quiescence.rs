use crate::context::ThreadContext;
use crate::err::{violation, ProtocolViolation};
use crate::object::LockState;
use crate::rlu::{Rlu, ThreadState};
use crate::sync::{fence, relax, Ordering};
use crate::types::{is_in_section, RunCounter, Version, NOT_COMMITTING};
use tracing::{debug, error, instrument, warn};

impl ThreadContext {
    /// Write back now if another thread contended on one of our locks.
    pub(super) fn sync_checkpoint<const NUM_THREADS: usize>(&mut self, rlu: &Rlu<NUM_THREADS>) {
        if !self.has_sync_request(rlu) {
            return;
        }
        self.stats.checkpoints += 1;
        self.sync_and_writeback(rlu);
    }

    /// Close the write-set the section just filled, writing everything back if the ring or the
    /// outstanding bound is exhausted.
    pub(super) fn commit_write_set<const NUM_THREADS: usize>(&mut self, rlu: &Rlu<NUM_THREADS>) {
        self.log.advance_tail();
        if self.log.is_full() || self.log.outstanding() >= self.max_write_sets {
            self.sync_and_writeback(rlu);
        }
        if !self.log.cursors_are_consistent() {
            violation(ProtocolViolation::CursorsInconsistent {
                head: self.log.head,
                wb: self.log.wb,
                tail: self.log.tail,
            });
        }
    }

    /// Wait for a grace period, then publish every committed write-set and release the objects
    /// freed since the last write-back.
    #[instrument(skip_all, fields(thread_index = self.thread_index))]
    pub(crate) fn sync_and_writeback<const NUM_THREADS: usize>(
        &mut self,
        rlu: &Rlu<NUM_THREADS>,
    ) {
        self.assert_not_in_section("sync_and_writeback");
        let thread: &ThreadState = rlu.thread(self.thread_index);
        if self.log.is_empty() && self.free_nodes.is_empty() {
            thread.sync_requests.store(0, Ordering::SeqCst);
            return;
        }
        self.stats.sync_and_writebacks += 1;
        let outstanding: usize = self.log.outstanding();

        // readers steal our copies only once this is at most their snapshot
        let announced: Version = rlu.writer_version.load(Ordering::SeqCst) + 1;
        thread.writer_version.store(announced, Ordering::SeqCst);
        let claimed: Version = rlu.writer_version.fetch_add(1, Ordering::SeqCst) + 1;

        self.synchronize(rlu, claimed);

        self.log.reclaim_written_back();
        let (write_sets, objects) = self.log.write_back_outstanding(self.thread_index);
        if write_sets != outstanding {
            violation(ProtocolViolation::WritebackCountMismatch {
                expected: outstanding,
                actual: write_sets,
            });
        }
        self.stats.write_sets_written_back += write_sets;
        self.stats.objects_written_back += objects;

        thread.writer_version.store(NOT_COMMITTING, Ordering::SeqCst);
        rlu.commit_version.fetch_add(1, Ordering::SeqCst);
        thread.sync_requests.store(0, Ordering::SeqCst);

        let freed: usize = self.process_free();
        debug!("version {claimed}: wrote back {write_sets} write-sets, {objects} objects, freed {freed}");
    }

    /// Wait until every thread which was inside a section has either left it or started it at
    /// `version_limit` or later.
    #[instrument(skip(self, rlu))]
    fn synchronize<const NUM_THREADS: usize>(
        &mut self,
        rlu: &Rlu<NUM_THREADS>,
        version_limit: Version,
    ) {
        fence(Ordering::SeqCst);
        let observed: [Option<RunCounter>; NUM_THREADS] = core::array::from_fn(|thread_index| {
            let thread: &ThreadState = rlu.thread(thread_index);
            if thread_index == self.thread_index || !thread.in_use.load(Ordering::SeqCst) {
                return None;
            }
            let run_counter: RunCounter = thread.run_counter.load(Ordering::SeqCst);
            if is_in_section(run_counter) {
                Some(run_counter)
            } else {
                None
            }
        });

        let mut spins: usize = 0;
        for (thread_index, observed_run_counter) in observed.iter().enumerate() {
            let observed_run_counter: RunCounter = match observed_run_counter {
                Some(run_counter) => *run_counter,
                None => continue,
            };
            let thread: &ThreadState = rlu.thread(thread_index);
            loop {
                if thread.run_counter.load(Ordering::SeqCst) != observed_run_counter {
                    break;
                }
                if thread.local_version.load(Ordering::SeqCst) >= version_limit {
                    break;
                }
                spins += 1;
                if spins.checked_rem(self.quiescence_spin_limit) == Some(0) {
                    warn!(
                        "thread_index {}: still waiting for thread_index {thread_index} with local_version {} and run_counter {observed_run_counter}",
                        self.thread_index,
                        thread.local_version.load(Ordering::SeqCst)
                    );
                }
                relax();
            }
        }
        self.stats.quiescence_spins += spins;
    }

    fn process_free(&mut self) -> usize {
        let freed: usize = self.free_nodes.len();
        for retired in self.free_nodes.drain(..) {
            let lock_state: LockState = retired.lock_state();
            if lock_state != LockState::Unlocked {
                violation(ProtocolViolation::FreedObjectStillLocked(lock_state.name()));
            }
            unsafe { retired.release() };
        }
        self.section_free_start = 0;
        freed
    }

    /// Write back everything this thread still owns and wait until no reader can hold one of
    /// its copies, so the log can be dropped.
    ///
    /// Also runs while unwinding from a panic. A section still running is rolled back. If the
    /// panic interrupted a write-back, the log is leaked instead, because other threads may still
    /// follow object headers into it.
    #[instrument(skip_all, fields(thread_index = self.thread_index))]
    pub(crate) fn thread_finish<const NUM_THREADS: usize>(&mut self, rlu: &Rlu<NUM_THREADS>) {
        if self.is_in_section() {
            self.rollback_section(rlu);
        }
        let is_mid_commit: bool =
            rlu.thread(self.thread_index).writer_version.load(Ordering::SeqCst) != NOT_COMMITTING;
        if is_mid_commit || !self.log.cursors_are_consistent() {
            error!(
                "interrupted write-back: leaking the write-set log, {} write-sets stay locked",
                self.log.outstanding()
            );
            self.log.leak();
            self.free_nodes.clear();
            return;
        }
        self.sync_and_writeback(rlu);
        if !self.log.is_empty() {
            // the write-sets just written back may still be read by stealing readers
            self.sync_and_writeback(rlu);
        }
        debug!("finished: {}", self.stats);
    }
}
