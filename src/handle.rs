use crate::context::ThreadContext;
use crate::err::{Contention, Error};
use crate::object::RluPtr;
use crate::rlu::Rlu;
use crate::stats::Stats;
use crate::sync::Arc;
use crate::types::{convert_thread_index_to_thread_id, ThreadId, ThreadIndex, WriterLockId};
use core::ops::Deref;
use tracing::{debug, instrument, trace};

/// A thread's registration with an [Rlu] instance.
///
/// A handle owns one of the instance's `NUM_THREADS` slots and the thread's write-set log. It is
/// meant to be used by one thread at a time; move it to the thread which will use it. Dropping the
/// handle (or calling [ThreadHandle::finish]) writes back everything the thread committed, waits
/// until no other thread can still observe its copies, and frees the slot for reuse. This also
/// happens when the handle is dropped while unwinding from a panic; a section which was running
/// is rolled back first.
///
/// `R` is how the handle reaches the instance: see [ArcThreadHandle] and [RefThreadHandle].
pub struct ThreadHandle<R, const NUM_THREADS: usize>
where
    R: Deref<Target = Rlu<NUM_THREADS>>,
{
    rlu: R,
    context: ThreadContext,
    finished: bool,
}

/// A [ThreadHandle] which keeps its [Rlu] alive through an [Arc], for threads which are spawned
/// with `'static` closures.
pub type ArcThreadHandle<const NUM_THREADS: usize> = ThreadHandle<Arc<Rlu<NUM_THREADS>>, NUM_THREADS>;

/// A [ThreadHandle] which borrows its [Rlu], for scoped threads or a single thread.
pub type RefThreadHandle<'a, const NUM_THREADS: usize> = ThreadHandle<&'a Rlu<NUM_THREADS>, NUM_THREADS>;

// the context's raw pointers only refer to memory the handle owns or to shared objects, which are
// synchronized through their headers
unsafe impl<R, const NUM_THREADS: usize> Send for ThreadHandle<R, NUM_THREADS> where
    R: Deref<Target = Rlu<NUM_THREADS>> + Send
{
}

impl<R, const NUM_THREADS: usize> ThreadHandle<R, NUM_THREADS>
where
    R: Deref<Target = Rlu<NUM_THREADS>>,
{
    /// Claim a thread slot of `rlu` and allocate this thread's write-set log.
    #[instrument(skip_all)]
    pub fn register(rlu: R) -> Result<Self, Error> {
        let thread_index: ThreadIndex = rlu.claim_thread_slot()?;
        let mut context: ThreadContext = match ThreadContext::new(thread_index, rlu.config()) {
            Ok(context) => context,
            Err(error) => {
                rlu.release_thread_slot(thread_index);
                return Err(error);
            }
        };
        context.attach(&*rlu);
        debug!("registered thread_index {thread_index}");
        Ok(Self {
            rlu,
            context,
            finished: false,
        })
    }

    /// This thread's identifier, stable until the handle is dropped. Identifiers start at 1.
    pub fn thread_id(&self) -> ThreadId {
        convert_thread_index_to_thread_id(self.context.thread_index)
    }

    pub fn rlu(&self) -> &Rlu<NUM_THREADS> {
        &self.rlu
    }

    /// Counters of this thread so far. They are merged into [Rlu::stats] when the handle finishes.
    pub fn stats(&self) -> Stats {
        self.context.stats
    }

    pub fn is_in_section(&self) -> bool {
        self.context.is_in_section()
    }

    /// Run `operation` as one atomic section, retrying it from the top for as long as it reports
    /// [Contention]. Objects locked by a successful run are published together when it returns.
    ///
    /// The closure may run many times, so it must not have effects outside the section which it
    /// cannot repeat.
    pub fn execute<T, F>(&mut self, mut operation: F) -> T
    where
        F: FnMut(&mut Section<'_, R, NUM_THREADS>) -> Result<T, Contention>,
    {
        loop {
            self.reader_lock();
            let result: Result<T, Contention> = operation(&mut Section { handle: &mut *self });
            match result {
                Ok(value) => {
                    self.reader_unlock();
                    return value;
                }
                Err(Contention) => {
                    trace!("thread_index {}: contention, retrying", self.context.thread_index);
                    self.abort();
                }
            }
        }
    }

    /// Run `operation` as a section which cannot be retried.
    pub fn read<T, F>(&mut self, operation: F) -> T
    where
        F: FnOnce(&mut Section<'_, R, NUM_THREADS>) -> T,
    {
        self.reader_lock();
        let value: T = operation(&mut Section { handle: &mut *self });
        self.reader_unlock();
        value
    }

    pub fn reader_lock(&mut self) {
        self.context.reader_lock(&*self.rlu);
    }

    pub fn reader_unlock(&mut self) {
        self.context.reader_unlock(&*self.rlu);
    }

    /// Resolve `ptr` to the version of the object the current section observes.
    ///
    /// # Safety
    /// `ptr` must have been allocated with [crate::alloc] and must not have been released. Either
    /// it was read from a shared structure inside the current section, or no other thread can
    /// have freed it.
    pub unsafe fn deref<T: Copy>(&mut self, ptr: RluPtr<T>) -> RluPtr<T> {
        self.context.deref(&*self.rlu, ptr)
    }

    /// # Safety
    /// Same as [ThreadHandle::deref].
    pub unsafe fn deref_option<T: Copy>(&mut self, ptr: Option<RluPtr<T>>) -> Option<RluPtr<T>> {
        ptr.map(|ptr| self.deref(ptr))
    }

    /// Lock the object `ptr` refers to. On success `ptr` refers to this thread's private copy,
    /// which becomes visible to everyone when the section commits. On failure the section must
    /// be aborted.
    ///
    /// # Safety
    /// Same as [ThreadHandle::deref].
    pub unsafe fn try_lock<T: Copy>(&mut self, ptr: &mut RluPtr<T>) -> bool {
        self.context.try_lock(&*self.rlu, ptr)
    }

    /// Lock an object in coarse-grained mode, where it cannot be contended.
    ///
    /// # Safety
    /// Same as [ThreadHandle::deref].
    pub unsafe fn lock<T: Copy>(&mut self, ptr: &mut RluPtr<T>) {
        self.context.lock(&*self.rlu, ptr)
    }

    /// Leave the current section, unlocking everything it locked and forgetting its frees.
    pub fn abort(&mut self) {
        self.context.abort(&*self.rlu);
    }

    /// Release the object once every section which could still reach it has ended.
    ///
    /// # Safety
    /// Same as [ThreadHandle::deref]. In addition the object must have been unlinked from every
    /// shared structure by this section, and it must not be freed again.
    pub unsafe fn free<T: Copy>(&mut self, ptr: RluPtr<T>) {
        self.context.free(ptr);
    }

    pub fn try_writer_lock(&mut self, writer_lock_id: WriterLockId) -> bool {
        self.context.try_writer_lock(&*self.rlu, writer_lock_id)
    }

    pub fn release_writer_lock(&mut self, writer_lock_id: WriterLockId) {
        self.context.release_writer_lock(&*self.rlu, writer_lock_id);
    }

    /// Write back every outstanding write-set now instead of waiting for the ring to fill.
    pub fn sync_and_writeback(&mut self) {
        self.context.sync_and_writeback(&*self.rlu);
    }

    /// Unregister, returning this thread's statistics.
    pub fn finish(mut self) -> Stats {
        self.retire();
        self.context.stats
    }

    fn retire(&mut self) {
        self.context.thread_finish(&*self.rlu);
        self.rlu.merge_stats(&self.context.stats);
        self.rlu.release_thread_slot(self.context.thread_index);
        self.finished = true;
    }
}

impl<R, const NUM_THREADS: usize> Drop for ThreadHandle<R, NUM_THREADS>
where
    R: Deref<Target = Rlu<NUM_THREADS>>,
{
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.retire();
    }
}

/// The current section of a [ThreadHandle], handed to [ThreadHandle::execute] and
/// [ThreadHandle::read] closures.
pub struct Section<'h, R, const NUM_THREADS: usize>
where
    R: Deref<Target = Rlu<NUM_THREADS>>,
{
    handle: &'h mut ThreadHandle<R, NUM_THREADS>,
}

impl<'h, R, const NUM_THREADS: usize> Section<'h, R, NUM_THREADS>
where
    R: Deref<Target = Rlu<NUM_THREADS>>,
{
    pub fn thread_id(&self) -> ThreadId {
        self.handle.thread_id()
    }

    /// # Safety
    /// Same as [ThreadHandle::deref].
    pub unsafe fn deref<T: Copy>(&mut self, ptr: RluPtr<T>) -> RluPtr<T> {
        self.handle.deref(ptr)
    }

    /// # Safety
    /// Same as [ThreadHandle::deref].
    pub unsafe fn deref_option<T: Copy>(&mut self, ptr: Option<RluPtr<T>>) -> Option<RluPtr<T>> {
        self.handle.deref_option(ptr)
    }

    /// Read the value of the object `ptr` refers to, as this section observes it.
    ///
    /// # Safety
    /// `ptr` must have been allocated with [crate::alloc] and must not have been released: it was
    /// read from a structure inside this section, or it was freed at most in this section.
    pub unsafe fn get<T: Copy>(&mut self, ptr: RluPtr<T>) -> T {
        *self.handle.deref(ptr).as_ref()
    }

    /// Lock the object `ptr` refers to, rewriting `ptr` to this section's private copy.
    ///
    /// # Safety
    /// Same as [ThreadHandle::deref].
    pub unsafe fn try_lock<T: Copy>(&mut self, ptr: &mut RluPtr<T>) -> Result<(), Contention> {
        if self.handle.try_lock(ptr) {
            Ok(())
        } else {
            Err(Contention)
        }
    }

    /// Lock the object `ptr` refers to and modify this section's copy of it.
    ///
    /// # Safety
    /// Same as [Section::get].
    pub unsafe fn update<T: Copy>(
        &mut self,
        ptr: &mut RluPtr<T>,
        modify: impl FnOnce(&mut T),
    ) -> Result<(), Contention> {
        self.try_lock(ptr)?;
        modify(ptr.as_mut());
        Ok(())
    }

    /// # Safety
    /// Same as [ThreadHandle::deref].
    pub unsafe fn lock<T: Copy>(&mut self, ptr: &mut RluPtr<T>) {
        self.handle.lock(ptr);
    }

    /// Release the object once every section which could still reach it has ended. Forgotten if
    /// the section aborts.
    ///
    /// # Safety
    /// Same as [ThreadHandle::free].
    pub unsafe fn free<T: Copy>(&mut self, ptr: RluPtr<T>) {
        self.handle.free(ptr);
    }

    pub fn try_writer_lock(&mut self, writer_lock_id: WriterLockId) -> Result<(), Contention> {
        if self.handle.try_writer_lock(writer_lock_id) {
            Ok(())
        } else {
            Err(Contention)
        }
    }

    pub fn release_writer_lock(&mut self, writer_lock_id: WriterLockId) {
        self.handle.release_writer_lock(writer_lock_id);
    }
}
