use crate::types::{RunCounter, ThreadIndex, WriterLockId};
use displaydoc::Display;
use tracing::error;

/// Any recoverable error reported by the RLU engine.
#[derive(Debug, Display, Eq, PartialEq)]
pub enum Error {
    /// The allocator could not provide {size} bytes.
    AllocationFailed { size: usize },
    /// Could not register a thread: {0}
    NoThreadSlotAvailable(NoThreadSlotAvailableError),
    /// The configuration was rejected: {0}
    InvalidConfig(ConfigError),
}

impl From<NoThreadSlotAvailableError> for Error {
    fn from(error: NoThreadSlotAvailableError) -> Self {
        Error::NoThreadSlotAvailable(error)
    }
}

impl From<ConfigError> for Error {
    fn from(error: ConfigError) -> Self {
        Error::InvalidConfig(error)
    }
}

/// All {0} thread slots of this RLU instance are already in use.
#[derive(Debug, Display, Eq, PartialEq)]
pub struct NoThreadSlotAvailableError(pub usize);

/// A [crate::Config] which cannot drive the write-set ring.
#[derive(Debug, Display, Eq, PartialEq)]
pub enum ConfigError {
    /// At least one outstanding write-set must be allowed.
    ZeroMaxWriteSets,
    /// The write-set ring needs at least 2 slots but was configured with {0}.
    RingTooShort(usize),
    /** A ring of {ring_len} slots cannot hold {max_write_sets} outstanding write-sets: the ring
        must be at least twice as long.
    */
    RingTooShortForMaxWriteSets {
        ring_len: usize,
        max_write_sets: usize,
    },
    /// A write-set slot of {0} bytes cannot hold any object.
    WriteSetCapacityTooSmall(usize),
    /// The pending-free buffer must hold at least one object.
    ZeroMaxFreeNodes,
}

/// An object needed by the current section is held by another section; abort and retry.
#[derive(Debug, Display, Clone, Copy, Eq, PartialEq)]
pub struct Contention;

/// A bug in the calling code or in the engine. These are never returned; see [violation].
#[derive(Debug, Display, Eq, PartialEq)]
pub enum ProtocolViolation {
    /// `{0}` must be called inside a section.
    NotInSection(&'static str),
    /// `{0}` must be called outside of a section.
    AlreadyInSection(&'static str),
    /// `{0}` is not available in {1} mode.
    WrongMode(&'static str, &'static str),
    /** Write-set overflow: an entry of {requested} bytes does not fit after {used} of
        {capacity} bytes.
    */
    WriteSetOverflow {
        requested: usize,
        used: usize,
        capacity: usize,
    },
    /// An object with alignment {0} cannot be staged in a write-set.
    AlignmentTooLarge(usize),
    /// The pending-free buffer already holds its maximum of {0} objects.
    FreeBufferOverflow(usize),
    /// A staged copy's header no longer marks it as a copy of its write-set entry.
    CopyHeaderCorrupted,
    /** Thread {thread_index} tried to write back an object whose header is {actual_state}
        instead of its own write-set entry.
    */
    WritebackOwnerMismatch {
        thread_index: ThreadIndex,
        actual_state: &'static str,
    },
    /// Wrote back {actual} write-sets but {expected} were outstanding.
    WritebackCountMismatch { expected: usize, actual: usize },
    /// Tried to free an object which is still {0}.
    FreedObjectStillLocked(&'static str),
    /// The write-set ring cursors are inconsistent: head {head}, write-back {wb}, tail {tail}.
    CursorsInconsistent { head: usize, wb: usize, tail: usize },
    /// Writer lock {0} does not exist.
    WriterLockOutOfRange(WriterLockId),
    /// Writer lock {0} is already held by this section.
    WriterLockAlreadyHeld(WriterLockId),
    /// Writer lock {lock_id} was released by thread {thread_index} which does not hold it.
    WriterLockNotHeld {
        lock_id: WriterLockId,
        thread_index: ThreadIndex,
    },
    /// A section may hold at most {0} writer locks.
    TooManyWriterLocks(usize),
    /** `lock` failed in run {run_counter}; under coarse-grained writer locks object locks must
        never be contended.
    */
    CoarseGrainedLockFailed { run_counter: RunCounter },
}

/// Report a [ProtocolViolation] and terminate the offending thread.
#[cold]
#[track_caller]
pub(crate) fn violation(protocol_violation: ProtocolViolation) -> ! {
    error!("RLU protocol violation: {protocol_violation}");
    panic!("RLU protocol violation: {protocol_violation}")
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

#[cfg(feature = "std")]
impl std::error::Error for NoThreadSlotAvailableError {}

#[cfg(feature = "std")]
impl std::error::Error for ConfigError {}

#[cfg(feature = "std")]
impl std::error::Error for Contention {}
