use crate::err::Error;
use crate::sync::{AtomicUsize, Ordering};
use crate::write_set::{Entry, EntryMeta};
use alloc::alloc::{alloc as allocate, dealloc, Layout};
use core::cell::UnsafeCell;
use core::fmt::{Debug, Formatter};
use core::ptr::{self, NonNull};

/// The lock word of a header which nobody has locked.
const UNLOCKED_WORD: usize = 0;

/// Set in the lock word of a staged copy. Entries are at least word aligned, so the lowest bit of
/// an entry address is always free.
const COPY_TAG: usize = 0b1;

/// A reference to one entry of some thread's write-set.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct EntryRef(NonNull<EntryMeta>);

impl EntryRef {
    pub(crate) fn new(meta: NonNull<EntryMeta>) -> Self {
        Self(meta)
    }

    pub(crate) fn as_ptr(&self) -> NonNull<EntryMeta> {
        self.0
    }

    /// # Safety
    /// The entry must not have been reclaimed by its owner.
    pub(crate) unsafe fn meta<'a>(&self) -> &'a EntryMeta {
        &*self.0.as_ptr()
    }

    /// # Safety
    /// The entry must not have been reclaimed and must have been staged for a `T`.
    pub(crate) unsafe fn original<T>(&self) -> RluPtr<T> {
        (*self.0.cast::<Entry<T>>().as_ptr()).original
    }

    /// # Safety
    /// The entry must not have been reclaimed and must have been staged for a `T`.
    pub(crate) unsafe fn copy<T>(&self) -> RluPtr<T> {
        let entry: *mut Entry<T> = self.0.cast::<Entry<T>>().as_ptr();
        RluPtr::from_object(NonNull::new_unchecked(ptr::addr_of_mut!((*entry).copy)))
    }
}

/// The decoded lock word of an object [Header].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum LockState {
    /// Nobody is writing the object.
    Unlocked,
    /// The object is itself a staged copy living in the given write-set entry.
    IsCopy(EntryRef),
    /// The object is locked and its staged copy lives in the given write-set entry.
    LockedBy(EntryRef),
}

impl LockState {
    pub(crate) fn encode(self) -> usize {
        match self {
            LockState::Unlocked => UNLOCKED_WORD,
            LockState::IsCopy(entry) => entry.as_ptr().as_ptr() as usize | COPY_TAG,
            LockState::LockedBy(entry) => entry.as_ptr().as_ptr() as usize,
        }
    }

    pub(crate) fn decode(word: usize) -> Self {
        if word == UNLOCKED_WORD {
            return LockState::Unlocked;
        }
        let address: *mut EntryMeta = (word & !COPY_TAG) as *mut EntryMeta;
        // the word was produced by encode from a NonNull, so the address cannot be null
        let entry: EntryRef = EntryRef::new(unsafe { NonNull::new_unchecked(address) });
        if word & COPY_TAG == COPY_TAG {
            LockState::IsCopy(entry)
        } else {
            LockState::LockedBy(entry)
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            LockState::Unlocked => "unlocked",
            LockState::IsCopy(_) => "a staged copy",
            LockState::LockedBy(_) => "locked",
        }
    }
}

/// The fixed prefix of every RLU-managed object.
pub(crate) struct Header {
    lock: AtomicUsize,
}

impl Header {
    pub(crate) fn unlocked() -> Self {
        Self {
            lock: AtomicUsize::new(UNLOCKED_WORD),
        }
    }

    pub(crate) fn copy_of(entry: EntryRef) -> Self {
        Self {
            lock: AtomicUsize::new(LockState::IsCopy(entry).encode()),
        }
    }

    pub(crate) fn load(&self) -> LockState {
        LockState::decode(self.lock.load(Ordering::SeqCst))
    }

    /// The only way an object goes from [LockState::Unlocked] to [LockState::LockedBy].
    pub(crate) fn try_lock(&self, entry: EntryRef) -> bool {
        self.lock
            .compare_exchange(
                UNLOCKED_WORD,
                LockState::LockedBy(entry).encode(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Only the owner of the write-set entry the header points to may unlock it.
    pub(crate) fn unlock(&self) {
        self.lock.store(UNLOCKED_WORD, Ordering::SeqCst);
    }
}

impl Debug for Header {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Header").field("lock", &self.load()).finish()
    }
}

/// An RLU-managed allocation: the header followed by the payload.
#[repr(C)]
pub(crate) struct Object<T> {
    pub(crate) header: Header,
    pub(crate) data: UnsafeCell<T>,
}

/// A pointer to an RLU-managed object: either the original object or, after a dereference or a
/// successful lock, a staged copy of it.
///
/// `RluPtr`s are plain copyable pointers. They stay valid until the object is freed with
/// [crate::Section::free] and the freeing thread has written back, so they may only be followed
/// inside a section of a thread registered with the same [crate::Rlu] instance.
///
/// `==` compares raw addresses; use [crate::cmp_ptrs] to compare object identity.
///
/// Nothing ties an `RluPtr` to the lifetime of its object, so every operation which follows one
/// is `unsafe`. The caller guarantees the object has not been released: it was reached from a
/// shared structure inside the current section, or the calling thread still owns it.
pub struct RluPtr<T> {
    object: NonNull<Object<T>>,
}

impl<T> Clone for RluPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for RluPtr<T> {}

impl<T> PartialEq for RluPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.object == other.object
    }
}

impl<T> Eq for RluPtr<T> {}

impl<T> Debug for RluPtr<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "RluPtr({:p})", self.object.as_ptr())
    }
}

unsafe impl<T: Send + Sync> Send for RluPtr<T> {}
unsafe impl<T: Send + Sync> Sync for RluPtr<T> {}

impl<T> RluPtr<T> {
    pub(crate) fn from_object(object: NonNull<Object<T>>) -> Self {
        Self { object }
    }

    pub(crate) fn object_ptr(&self) -> NonNull<Object<T>> {
        self.object
    }

    pub(crate) fn header<'a>(&self) -> &'a Header {
        unsafe { &(*self.object.as_ptr()).header }
    }

    pub(crate) fn data_ptr(&self) -> *mut T {
        unsafe { (*self.object.as_ptr()).data.get() }
    }

    pub(crate) fn lock_state(&self) -> LockState {
        self.header().load()
    }

    /// Whether this pointer refers to a staged copy rather than to the object itself.
    ///
    /// # Safety
    /// The object must not have been released.
    pub unsafe fn is_copy(&self) -> bool {
        matches!(self.lock_state(), LockState::IsCopy(_))
    }

    /// Resolve a staged copy to the object it was copied from.
    pub(crate) fn force_actual(self) -> Self {
        match self.lock_state() {
            LockState::IsCopy(entry) => unsafe { entry.original::<T>() },
            LockState::Unlocked | LockState::LockedBy(_) => self,
        }
    }

    /// Borrow the value this pointer refers to.
    ///
    /// # Safety
    /// The caller must be inside a section, must have obtained the pointer through a dereference
    /// or a lock in that section, and must not keep the borrow past the end of the section.
    pub unsafe fn as_ref<'a>(&self) -> &'a T {
        &*self.data_ptr()
    }

    /// Mutably borrow the value this pointer refers to.
    ///
    /// # Safety
    /// Same as [RluPtr::as_ref]; additionally the pointer must have been returned by a successful
    /// lock in the current section, so that it refers to this thread's private staged copy.
    pub unsafe fn as_mut<'a>(&self) -> &'a mut T {
        &mut *self.data_ptr()
    }
}

/// Allocate a new RLU-managed object holding `value`. The object starts unlocked.
pub fn alloc<T: Copy>(value: T) -> Result<RluPtr<T>, Error> {
    let layout: Layout = Layout::new::<Object<T>>();
    let raw: *mut Object<T> = unsafe { allocate(layout) }.cast::<Object<T>>();
    let object: NonNull<Object<T>> =
        NonNull::new(raw).ok_or(Error::AllocationFailed { size: layout.size() })?;
    unsafe {
        object.as_ptr().write(Object {
            header: Header::unlocked(),
            data: UnsafeCell::new(value),
        });
    }
    Ok(RluPtr::from_object(object))
}

/// Release an object immediately, without waiting for a grace period.
///
/// # Safety
/// No thread may be able to reach the object any more, and it must not be locked or pending in
/// any thread's free buffer. Intended for tearing down a structure once all threads are done.
pub unsafe fn free_unprotected<T: Copy>(ptr: RluPtr<T>) {
    release::<T>(ptr.force_actual().object_ptr().cast::<u8>());
}

unsafe fn release<T>(object: NonNull<u8>) {
    let object: *mut Object<T> = object.cast::<Object<T>>().as_ptr();
    ptr::drop_in_place(object);
    dealloc(object.cast::<u8>(), Layout::new::<Object<T>>());
}

/// An object removed by a section and waiting for the next write-back to be released.
pub(crate) struct Retired {
    object: NonNull<u8>,
    header: NonNull<Header>,
    release: unsafe fn(NonNull<u8>),
}

impl Retired {
    pub(crate) fn new<T: Copy>(actual: RluPtr<T>) -> Self {
        Self {
            object: actual.object_ptr().cast::<u8>(),
            header: NonNull::from(actual.header()),
            release: release::<T>,
        }
    }

    pub(crate) fn lock_state(&self) -> LockState {
        unsafe { self.header.as_ref() }.load()
    }

    /// # Safety
    /// Every thread which could have reached the object must have left its section.
    pub(crate) unsafe fn release(self) {
        (self.release)(self.object)
    }
}

/// Store `obj` into `slot`, resolving a staged copy to the object it was copied from so that
/// published pointers never point into a write-set.
///
/// # Safety
/// `obj` must not have been released, and if it is a staged copy the section which locked it must
/// still be running.
pub unsafe fn assign_pointer<T>(slot: &mut Option<RluPtr<T>>, obj: Option<RluPtr<T>>) {
    *slot = obj.map(RluPtr::force_actual);
}

/// Whether `a` and `b` refer to the same object, treating a staged copy as its original.
///
/// # Safety
/// Same as [assign_pointer], for both arguments.
pub unsafe fn cmp_ptrs<T>(a: Option<RluPtr<T>>, b: Option<RluPtr<T>>) -> bool {
    a.map(RluPtr::force_actual) == b.map(RluPtr::force_actual)
}
