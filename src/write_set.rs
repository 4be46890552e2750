//! Per-thread write-set log: a ring of bounded arenas holding staged copies of locked objects.

use crate::err::{violation, Error, ProtocolViolation};
use crate::object::{EntryRef, Header, LockState, Object, RluPtr};
use crate::types::{RunCounter, ThreadIndex, WriterLockId};
use alloc::alloc::{alloc as allocate, dealloc, Layout};
use alloc::vec::Vec;
use core::ptr::{self, NonNull};
use tracing::trace;

/// Alignment of every write-set arena. Objects with a stricter alignment cannot be staged.
const WRITE_SET_ALIGN: usize = 64;

/// Bookkeeping for one locked object. Other threads read it through the object's lock word, so
/// it is immutable once the lock has been published.
#[repr(C)]
pub(crate) struct EntryMeta {
    pub(crate) thread_index: ThreadIndex,
    /// The run counter of the section which locked the object.
    pub(crate) run_counter: RunCounter,
    pub(crate) actual_header: NonNull<Header>,
    pub(crate) copy_header: NonNull<Header>,
    pub(crate) size: usize,
    write_back: unsafe fn(NonNull<EntryMeta>),
}

/// A typed write-set entry. `meta` comes first so an [EntryRef] can be viewed as an `Entry<T>`.
#[repr(C)]
pub(crate) struct Entry<T> {
    meta: EntryMeta,
    pub(crate) original: RluPtr<T>,
    pub(crate) copy: Object<T>,
}

unsafe fn write_back_entry<T: Copy>(meta: NonNull<EntryMeta>) {
    let entry: *mut Entry<T> = meta.cast::<Entry<T>>().as_ptr();
    let original: RluPtr<T> = (*entry).original;
    let staged: *const T = ptr::addr_of!((*entry).copy.data).cast::<T>();
    ptr::copy_nonoverlapping(staged, original.data_ptr(), 1);
}

/// An entry whose space has been reserved in a [WriteSet] but which is not part of it until
/// [WriteSet::commit] is called.
pub(crate) struct PreparedEntry<T> {
    entry: NonNull<Entry<T>>,
    end: usize,
}

impl<T> PreparedEntry<T> {
    pub(crate) fn entry_ref(&self) -> EntryRef {
        EntryRef::new(self.entry.cast::<EntryMeta>())
    }
}

/// One slot of the ring.
pub(crate) struct WriteSet {
    buffer: NonNull<u8>,
    layout: Layout,
    capacity: usize,
    used: usize,
    entries: Vec<EntryRef>,
    /// Coarse-grained writer locks acquired while this slot was current.
    pub(crate) writer_locks: Vec<WriterLockId>,
}

impl WriteSet {
    fn new(capacity: usize) -> Result<Self, Error> {
        let layout: Layout = Layout::from_size_align(capacity, WRITE_SET_ALIGN)
            .map_err(|_| Error::AllocationFailed { size: capacity })?;
        let buffer: NonNull<u8> = NonNull::new(unsafe { allocate(layout) })
            .ok_or(Error::AllocationFailed { size: capacity })?;
        Ok(Self {
            buffer,
            layout,
            capacity,
            used: 0,
            entries: Vec::new(),
            writer_locks: Vec::new(),
        })
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn reset(&mut self) {
        self.used = 0;
        self.entries.clear();
        self.writer_locks.clear();
    }

    /// Reserve and fill in the bookkeeping of an entry for `original`. The copy's header already
    /// marks it as a copy, but its payload is not filled in until [WriteSet::commit].
    pub(crate) fn prepare<T: Copy>(
        &mut self,
        original: RluPtr<T>,
        thread_index: ThreadIndex,
        run_counter: RunCounter,
    ) -> PreparedEntry<T> {
        let layout: Layout = Layout::new::<Entry<T>>();
        if layout.align() > WRITE_SET_ALIGN {
            violation(ProtocolViolation::AlignmentTooLarge(layout.align()));
        }
        let start: usize = (self.used + layout.align() - 1) & !(layout.align() - 1);
        let end: usize = start + layout.size();
        if end > self.capacity {
            violation(ProtocolViolation::WriteSetOverflow {
                requested: layout.size(),
                used: self.used,
                capacity: self.capacity,
            });
        }

        unsafe {
            let entry: *mut Entry<T> = self.buffer.as_ptr().add(start).cast::<Entry<T>>();
            let entry_ref: EntryRef = EntryRef::new(NonNull::new_unchecked(entry.cast::<EntryMeta>()));
            let copy: *mut Object<T> = ptr::addr_of_mut!((*entry).copy);
            ptr::addr_of_mut!((*copy).header).write(Header::copy_of(entry_ref));
            ptr::addr_of_mut!((*entry).original).write(original);
            ptr::addr_of_mut!((*entry).meta).write(EntryMeta {
                thread_index,
                run_counter,
                actual_header: NonNull::from(original.header()),
                copy_header: NonNull::new_unchecked(ptr::addr_of_mut!((*copy).header)),
                size: core::mem::size_of::<T>(),
                write_back: write_back_entry::<T>,
            });
            PreparedEntry {
                entry: NonNull::new_unchecked(entry),
                end,
            }
        }
    }

    /// Add a prepared entry whose object has been locked, staging the object's current value.
    /// Returns the pointer to the staged copy.
    pub(crate) fn commit<T: Copy>(&mut self, prepared: PreparedEntry<T>) -> RluPtr<T> {
        let entry_ref: EntryRef = prepared.entry_ref();
        unsafe {
            let entry: *mut Entry<T> = prepared.entry.as_ptr();
            let original: RluPtr<T> = (*entry).original;
            let staged: *mut T = ptr::addr_of_mut!((*entry).copy.data).cast::<T>();
            ptr::copy_nonoverlapping(original.data_ptr() as *const T, staged, 1);
        }
        self.used = prepared.end;
        self.entries.push(entry_ref);
        unsafe { entry_ref.copy::<T>() }
    }

    /// Copy every staged object back over its original and unlock the original.
    pub(crate) fn write_back(&self, thread_index: ThreadIndex) -> usize {
        for entry in self.entries.iter() {
            let meta: &EntryMeta = unsafe { entry.meta() };
            let copy_header: &Header = unsafe { meta.copy_header.as_ref() };
            if copy_header.load() != LockState::IsCopy(*entry) {
                violation(ProtocolViolation::CopyHeaderCorrupted);
            }
            let actual_header: &Header = unsafe { meta.actual_header.as_ref() };
            let actual_state: LockState = actual_header.load();
            if actual_state != LockState::LockedBy(*entry) || meta.thread_index != thread_index {
                violation(ProtocolViolation::WritebackOwnerMismatch {
                    thread_index,
                    actual_state: actual_state.name(),
                });
            }
            unsafe { (meta.write_back)(entry.as_ptr()) };
            actual_header.unlock();
            trace!("thread_index {thread_index}: wrote back {} bytes and unlocked", meta.size);
        }
        self.entries.len()
    }

    /// Unlock every object locked through this write-set without writing anything back.
    pub(crate) fn unlock_all(&self, thread_index: ThreadIndex) {
        for entry in self.entries.iter() {
            let meta: &EntryMeta = unsafe { entry.meta() };
            let actual_header: &Header = unsafe { meta.actual_header.as_ref() };
            let actual_state: LockState = actual_header.load();
            if actual_state != LockState::LockedBy(*entry) {
                violation(ProtocolViolation::WritebackOwnerMismatch {
                    thread_index,
                    actual_state: actual_state.name(),
                });
            }
            actual_header.unlock();
        }
        trace!("thread_index {thread_index}: rolled back {} locks", self.entries.len());
    }
}

impl Drop for WriteSet {
    fn drop(&mut self) {
        unsafe { dealloc(self.buffer.as_ptr(), self.layout) };
    }
}

/// The ring of write-sets with its three monotonic cursors.
///
/// Write-sets in `[head, wb)` have been written back but may still be read by threads which
/// stole a copy from them; `[wb, tail)` are committed but not yet written back; `tail` is the one
/// the current section writes into.
pub(crate) struct WriteLog {
    slots: Vec<WriteSet>,
    pub(crate) head: usize,
    pub(crate) wb: usize,
    pub(crate) tail: usize,
}

impl WriteLog {
    pub(crate) fn new(ring_len: usize, capacity: usize) -> Result<Self, Error> {
        let mut slots: Vec<WriteSet> = Vec::with_capacity(ring_len);
        for _ in 0..ring_len {
            slots.push(WriteSet::new(capacity)?);
        }
        Ok(Self {
            slots,
            head: 0,
            wb: 0,
            tail: 0,
        })
    }

    fn index(&self, counter: usize) -> usize {
        counter % self.slots.len()
    }

    pub(crate) fn slot(&self, counter: usize) -> &WriteSet {
        &self.slots[self.index(counter)]
    }

    pub(crate) fn slot_mut(&mut self, counter: usize) -> &mut WriteSet {
        let index: usize = self.index(counter);
        &mut self.slots[index]
    }

    pub(crate) fn current_mut(&mut self) -> &mut WriteSet {
        self.slot_mut(self.tail)
    }

    pub(crate) fn reset_current(&mut self) {
        self.current_mut().reset();
    }

    /// Nothing is committed and nothing awaits reclamation.
    pub(crate) fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// The number of committed write-sets which have not been written back.
    pub(crate) fn outstanding(&self) -> usize {
        self.tail - self.wb
    }

    pub(crate) fn advance_tail(&mut self) {
        self.tail += 1;
    }

    /// The next write-set to be filled is still awaiting reclamation.
    pub(crate) fn is_full(&self) -> bool {
        self.index(self.tail) == self.index(self.head)
    }

    pub(crate) fn cursors_are_consistent(&self) -> bool {
        self.head <= self.wb
            && self.wb <= self.tail
            && self.tail - self.head < self.slots.len()
    }

    /// Reset the write-sets which were written back by an earlier write-back. Only safe after a
    /// grace period which started after that write-back.
    pub(crate) fn reclaim_written_back(&mut self) {
        for counter in self.head..self.wb {
            self.slot_mut(counter).reset();
        }
        self.head = self.wb;
    }

    /// Give up the write-sets without deallocating them, for when object headers may still refer
    /// to their entries.
    pub(crate) fn leak(&mut self) {
        core::mem::forget(core::mem::take(&mut self.slots));
        self.head = 0;
        self.wb = 0;
        self.tail = 0;
    }

    /// Write back every committed write-set, returning how many write-sets and objects that took.
    pub(crate) fn write_back_outstanding(&mut self, thread_index: ThreadIndex) -> (usize, usize) {
        let mut write_sets: usize = 0;
        let mut objects: usize = 0;
        for counter in self.wb..self.tail {
            objects += self.slot(counter).write_back(thread_index);
            write_sets += 1;
        }
        self.wb = self.tail;
        (write_sets, objects)
    }
}
