use crate::context::ThreadContext;
use crate::object::{EntryRef, LockState, RluPtr};
use crate::rlu::{Rlu, ThreadState};
use crate::sync::Ordering;
use crate::types::{ThreadIndex, Version};
use tracing::trace;

impl ThreadContext {
    /// Enter a section, first writing back if another thread asked us to.
    pub(crate) fn reader_lock<const NUM_THREADS: usize>(&mut self, rlu: &Rlu<NUM_THREADS>) {
        self.assert_not_in_section("reader_lock");
        self.sync_checkpoint(rlu);

        self.is_write_detected = false;
        self.section_free_start = self.free_nodes.len();
        self.register(rlu);
        self.stats.starts += 1;

        let is_commit_in_flight: bool = self.local_version != self.local_commit_version;
        self.is_steal = is_commit_in_flight;
        self.is_check_locks = is_commit_in_flight || self.log.outstanding() != 0;
    }

    /// Leave the section, committing its write-set if it locked anything.
    pub(crate) fn reader_unlock<const NUM_THREADS: usize>(&mut self, rlu: &Rlu<NUM_THREADS>) {
        self.assert_in_section("reader_unlock");
        self.unregister(rlu);
        self.stats.finishes += 1;

        if self.is_write_detected {
            self.is_write_detected = false;
            self.stats.writer_sections += 1;
            let committed: usize = self.log.tail;
            self.commit_write_set(rlu);
            self.release_writer_locks(rlu, committed);
        } else {
            let current: usize = self.log.tail;
            self.release_writer_locks(rlu, current);
        }

        self.sync_checkpoint(rlu);
    }

    /// Make the run counter odd and take the version snapshot. The commit version is read first,
    /// so equal snapshots mean no commit was in flight in between.
    fn register<const NUM_THREADS: usize>(&mut self, rlu: &Rlu<NUM_THREADS>) {
        let thread: &ThreadState = rlu.thread(self.thread_index);
        self.run_counter = thread.run_counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.local_commit_version = rlu.commit_version.load(Ordering::SeqCst);
        self.local_version = rlu.writer_version.load(Ordering::SeqCst);
        thread.local_version.store(self.local_version, Ordering::SeqCst);
    }

    pub(super) fn unregister<const NUM_THREADS: usize>(&mut self, rlu: &Rlu<NUM_THREADS>) {
        let thread: &ThreadState = rlu.thread(self.thread_index);
        self.run_counter = thread.run_counter.fetch_add(1, Ordering::SeqCst) + 1;
    }

    /// Resolve `ptr` to the version of the object this section should observe.
    pub(crate) fn deref<T: Copy, const NUM_THREADS: usize>(
        &mut self,
        rlu: &Rlu<NUM_THREADS>,
        ptr: RluPtr<T>,
    ) -> RluPtr<T> {
        self.assert_in_section("deref");
        if !self.is_check_locks {
            return ptr;
        }
        match ptr.lock_state() {
            LockState::Unlocked | LockState::IsCopy(_) => ptr,
            LockState::LockedBy(entry) => self.deref_locked(rlu, ptr, entry),
        }
    }

    fn deref_locked<T: Copy, const NUM_THREADS: usize>(
        &mut self,
        rlu: &Rlu<NUM_THREADS>,
        ptr: RluPtr<T>,
        entry: EntryRef,
    ) -> RluPtr<T> {
        let owner: ThreadIndex = unsafe { entry.meta() }.thread_index;
        if owner == self.thread_index {
            return unsafe { entry.copy::<T>() };
        }
        if !self.is_steal {
            return ptr;
        }

        // the owner started committing before our snapshot, so it waits for us before reusing
        // the copy's write-set
        let owner_version: Version = rlu.writer_version_of(owner);
        if owner_version <= self.local_version {
            trace!(
                "thread_index {}: stealing copy from thread_index {owner} at version {owner_version}",
                self.thread_index
            );
            self.stats.steals += 1;
            return unsafe { entry.copy::<T>() };
        }
        ptr
    }
}
