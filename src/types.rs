/// An index into the per-thread state arrays of an [crate::Rlu]. Indexes are 0-based and are
/// handed out at registration.
pub(crate) type ThreadIndex = usize;

/// An identifier for a registered thread, as stored in the coarse-grained writer lock table.
///
/// ThreadIds are 1-based so that 0 can mean "not held by anyone".
pub(crate) type ThreadId = usize;

/// A value of the global writer or commit counter.
pub(crate) type Version = usize;

/// A per-thread counter which is incremented on every section entry and exit. Its parity tells
/// whether the thread is inside a section (odd) or idle (even).
pub(crate) type RunCounter = usize;

/// A small integer naming one coarse-grained writer lock.
pub type WriterLockId = usize;

/// The writer version of a thread which is not currently committing. Every reader snapshot is
/// smaller than this, so no reader ever steals from an idle writer.
pub(crate) const NOT_COMMITTING: Version = usize::MAX;

pub(crate) fn convert_thread_index_to_thread_id(thread_index: ThreadIndex) -> ThreadId {
    thread_index + 1
}

pub(crate) fn is_in_section(run_counter: RunCounter) -> bool {
    run_counter & 0b1 == 1
}
