use crate::context::ThreadContext;
use crate::err::{violation, ProtocolViolation};
use crate::object::{LockState, Retired, RluPtr};
use crate::rlu::{Rlu, MAX_NESTED_WRITER_LOCKS};
use crate::types::{RunCounter, ThreadIndex, WriterLockId};
use crate::write_set::{EntryMeta, PreparedEntry, WriteSet};
use alloc::vec::Vec;
use tracing::trace;

impl ThreadContext {
    /// Lock the object `ptr` refers to for writing. On success `ptr` is rewritten to this
    /// section's private copy. On failure the section must be aborted and retried.
    pub(crate) fn try_lock<T: Copy, const NUM_THREADS: usize>(
        &mut self,
        rlu: &Rlu<NUM_THREADS>,
        ptr: &mut RluPtr<T>,
    ) -> bool {
        self.assert_in_section("try_lock");
        let thread_index: ThreadIndex = self.thread_index;
        let actual: RluPtr<T> = ptr.force_actual();

        match actual.lock_state() {
            LockState::LockedBy(entry) => {
                let meta: &EntryMeta = unsafe { entry.meta() };
                if meta.thread_index == thread_index {
                    if meta.run_counter == self.run_counter {
                        *ptr = unsafe { entry.copy::<T>() };
                        return true;
                    }
                    // locked by one of our own write-sets which is not written back yet
                    trace!("thread_index {thread_index}: object locked by an earlier section");
                    self.send_sync_request(rlu, thread_index);
                    return false;
                }
                trace!(
                    "thread_index {thread_index}: object locked by thread_index {}",
                    meta.thread_index
                );
                self.send_sync_request(rlu, meta.thread_index);
                self.send_sync_request(rlu, thread_index);
                false
            }
            LockState::IsCopy(_) => violation(ProtocolViolation::CopyHeaderCorrupted),
            LockState::Unlocked => {
                self.is_write_detected = true;
                self.is_check_locks = true;

                let run_counter: RunCounter = self.run_counter;
                let write_set: &mut WriteSet = self.log.current_mut();
                let prepared: PreparedEntry<T> = write_set.prepare(actual, thread_index, run_counter);
                if !actual.header().try_lock(prepared.entry_ref()) {
                    trace!("thread_index {thread_index}: lost the race for an unlocked object");
                    return false;
                }
                *ptr = write_set.commit(prepared);
                trace!("thread_index {thread_index}: locked object");
                true
            }
        }
    }

    /// [ThreadContext::try_lock] for coarse-grained mode, where the writer locks rule out
    /// contention on objects.
    pub(crate) fn lock<T: Copy, const NUM_THREADS: usize>(
        &mut self,
        rlu: &Rlu<NUM_THREADS>,
        ptr: &mut RluPtr<T>,
    ) {
        self.assert_coarse_grained("lock");
        if !self.try_lock(rlu, ptr) {
            violation(ProtocolViolation::CoarseGrainedLockFailed {
                run_counter: self.run_counter,
            });
        }
    }

    /// Leave the section without publishing anything it did.
    pub(crate) fn abort<const NUM_THREADS: usize>(&mut self, rlu: &Rlu<NUM_THREADS>) {
        self.assert_in_section("abort");
        self.rollback_section(rlu);
        self.sync_checkpoint(rlu);
    }

    /// Unregister and undo the current section's locks and frees, without writing anything back.
    pub(super) fn rollback_section<const NUM_THREADS: usize>(&mut self, rlu: &Rlu<NUM_THREADS>) {
        self.unregister(rlu);
        self.stats.aborts += 1;

        if self.is_write_detected {
            self.is_write_detected = false;
            self.log.current_mut().unlock_all(self.thread_index);
        }
        let current: usize = self.log.tail;
        self.release_writer_locks(rlu, current);
        self.log.reset_current();
        self.free_nodes.truncate(self.section_free_start);
    }

    /// Defer releasing the object `ptr` refers to until no section can still reach it.
    pub(crate) fn free<T: Copy>(&mut self, ptr: RluPtr<T>) {
        self.assert_in_section("free");
        if self.free_nodes.len() >= self.max_free_nodes {
            violation(ProtocolViolation::FreeBufferOverflow(self.max_free_nodes));
        }
        self.free_nodes.push(Retired::new(ptr.force_actual()));
        self.stats.frees += 1;
    }

    pub(crate) fn try_writer_lock<const NUM_THREADS: usize>(
        &mut self,
        rlu: &Rlu<NUM_THREADS>,
        writer_lock_id: WriterLockId,
    ) -> bool {
        self.assert_coarse_grained("try_writer_lock");
        self.assert_in_section("try_writer_lock");

        let thread_index: ThreadIndex = self.thread_index;
        let held: &mut Vec<WriterLockId> = &mut self.log.current_mut().writer_locks;
        if held.contains(&writer_lock_id) {
            violation(ProtocolViolation::WriterLockAlreadyHeld(writer_lock_id));
        }
        if held.len() >= MAX_NESTED_WRITER_LOCKS {
            violation(ProtocolViolation::TooManyWriterLocks(MAX_NESTED_WRITER_LOCKS));
        }
        if !rlu.try_acquire_writer_lock(writer_lock_id, thread_index) {
            return false;
        }
        held.push(writer_lock_id);
        true
    }

    /// Release one writer lock before the section ends.
    pub(crate) fn release_writer_lock<const NUM_THREADS: usize>(
        &mut self,
        rlu: &Rlu<NUM_THREADS>,
        writer_lock_id: WriterLockId,
    ) {
        self.assert_coarse_grained("release_writer_lock");
        self.assert_in_section("release_writer_lock");

        let thread_index: ThreadIndex = self.thread_index;
        let held: &mut Vec<WriterLockId> = &mut self.log.current_mut().writer_locks;
        match held.iter().position(|held_id| *held_id == writer_lock_id) {
            Some(position) => {
                held.swap_remove(position);
            }
            None => violation(ProtocolViolation::WriterLockNotHeld {
                lock_id: writer_lock_id,
                thread_index,
            }),
        }
        rlu.release_writer_lock(writer_lock_id, thread_index);
    }
}
