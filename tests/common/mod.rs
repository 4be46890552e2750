#![allow(dead_code)]

use core::ops::Deref;
use rlu::{assign_pointer, ArcThreadHandle, Config, Rlu, RluPtr, Section, ThreadHandle};
use tracing::{debug, trace};

cfg_if::cfg_if! {
    if #[cfg(loom)] {
        pub(crate) use loom::sync::Arc;
        pub(crate) use loom::thread;
    } else if #[cfg(feature = "shuttle")] {
        pub(crate) use shuttle::sync::Arc;
        pub(crate) use shuttle::thread;
    } else {
        pub(crate) use std::sync::Arc;
        pub(crate) use std::thread;
    }
}

/// One element of a [ListSet]. The sentinel head node has key 0.
#[derive(Debug, Clone, Copy)]
pub struct Node {
    pub key: u64,
    pub next: Option<RluPtr<Node>>,
}

/// A sorted singly linked set of non-zero keys, built on the public API only.
#[derive(Debug, Clone, Copy)]
pub struct ListSet {
    head: RluPtr<Node>,
}

impl ListSet {
    pub fn new() -> Self {
        Self {
            head: rlu::alloc(Node { key: 0, next: None }).unwrap(),
        }
    }

    pub fn head(&self) -> RluPtr<Node> {
        self.head
    }

    /// The last node with a key smaller than `key`, and the node after it.
    unsafe fn find<R, const NUM_THREADS: usize>(
        &self,
        section: &mut Section<'_, R, NUM_THREADS>,
        key: u64,
    ) -> (RluPtr<Node>, Option<RluPtr<Node>>)
    where
        R: Deref<Target = Rlu<NUM_THREADS>>,
    {
        let mut prev: RluPtr<Node> = section.deref(self.head);
        let mut next: Option<RluPtr<Node>> = section.deref_option(prev.as_ref().next);
        while let Some(node) = next {
            if node.as_ref().key >= key {
                break;
            }
            prev = node;
            next = section.deref_option(node.as_ref().next);
        }
        (prev, next)
    }

    pub fn contains<R, const NUM_THREADS: usize>(
        &self,
        handle: &mut ThreadHandle<R, NUM_THREADS>,
        key: u64,
    ) -> bool
    where
        R: Deref<Target = Rlu<NUM_THREADS>>,
    {
        handle.read(|section| unsafe {
            let (_, next) = self.find(section, key);
            matches!(next, Some(node) if node.as_ref().key == key)
        })
    }

    pub fn insert<R, const NUM_THREADS: usize>(
        &self,
        handle: &mut ThreadHandle<R, NUM_THREADS>,
        key: u64,
    ) -> bool
    where
        R: Deref<Target = Rlu<NUM_THREADS>>,
    {
        assert_ne!(key, 0);
        let inserted: bool = handle.execute(|section| unsafe {
            let (mut prev, next) = self.find(section, key);
            if let Some(node) = next {
                if node.as_ref().key == key {
                    return Ok(false);
                }
            }
            section.try_lock(&mut prev)?;

            let node: RluPtr<Node> = rlu::alloc(Node { key, next: None }).unwrap();
            assign_pointer(&mut node.as_mut().next, next);
            assign_pointer(&mut prev.as_mut().next, Some(node));
            Ok(true)
        });
        trace!("insert {key}: {inserted}");
        inserted
    }

    pub fn remove<R, const NUM_THREADS: usize>(
        &self,
        handle: &mut ThreadHandle<R, NUM_THREADS>,
        key: u64,
    ) -> bool
    where
        R: Deref<Target = Rlu<NUM_THREADS>>,
    {
        let removed: bool = handle.execute(|section| unsafe {
            let (mut prev, next) = self.find(section, key);
            let mut node: RluPtr<Node> = match next {
                Some(node) if node.as_ref().key == key => node,
                _ => return Ok(false),
            };
            section.try_lock(&mut prev)?;
            section.try_lock(&mut node)?;

            assign_pointer(&mut prev.as_mut().next, node.as_ref().next);
            section.free(node);
            Ok(true)
        });
        trace!("remove {key}: {removed}");
        removed
    }

    /// Every key in one consistent snapshot.
    pub fn keys<R, const NUM_THREADS: usize>(
        &self,
        handle: &mut ThreadHandle<R, NUM_THREADS>,
    ) -> Vec<u64>
    where
        R: Deref<Target = Rlu<NUM_THREADS>>,
    {
        handle.read(|section| unsafe {
            let mut keys: Vec<u64> = Vec::new();
            let mut next: Option<RluPtr<Node>> = section.deref(self.head).as_ref().next;
            while let Some(node) = section.deref_option(next) {
                keys.push(node.as_ref().key);
                next = node.as_ref().next;
            }
            keys
        })
    }

    /// Release every node. No thread may still be registered.
    pub unsafe fn destroy(self) {
        let mut next: Option<RluPtr<Node>> = Some(self.head);
        while let Some(node) = next {
            next = node.as_ref().next;
            rlu::free_unprotected(node);
        }
    }
}

pub fn assert_sorted_and_unique(keys: &[u64]) {
    assert!(
        keys.windows(2).all(|pair| pair[0] < pair[1]),
        "keys are not strictly increasing: {keys:?}"
    );
}

/// Every thread inserts and then removes its own disjoint keys while all threads also look up
/// and snapshot the whole set. Returns the keys left at the end, which must be exactly those no
/// thread removed.
pub fn concurrency_test<const NUM_THREADS: usize>(
    config: Config,
    keys_per_thread: u64,
) -> Vec<u64> {
    let rlu: Arc<Rlu<NUM_THREADS>> = Arc::new(Rlu::new(config).unwrap());
    let set: ListSet = ListSet::new();

    let join_handles: Vec<thread::JoinHandle<()>> = (0..NUM_THREADS as u64)
        .map(|i| {
            let mut handle: ArcThreadHandle<NUM_THREADS> =
                ThreadHandle::register(rlu.clone()).unwrap();
            thread::spawn(move || {
                // thread i owns keys i+1, i+1+NUM_THREADS, ... and keeps the first one
                let keys: Vec<u64> = (0..keys_per_thread)
                    .map(|k| 1 + i + k * NUM_THREADS as u64)
                    .collect();
                for key in keys.iter() {
                    assert!(set.insert(&mut handle, *key));
                    assert!(set.contains(&mut handle, *key));
                    assert_sorted_and_unique(&set.keys(&mut handle));
                }
                for key in keys.iter().skip(1) {
                    assert!(set.remove(&mut handle, *key));
                    assert!(!set.contains(&mut handle, *key));
                }
                debug!("thread {} finished: {}", handle.thread_id(), handle.stats());
            })
        })
        .collect();

    join_handles
        .into_iter()
        .for_each(|join_handle| join_handle.join().expect("A thread panicked"));

    let mut handle: ArcThreadHandle<NUM_THREADS> = ThreadHandle::register(rlu.clone()).unwrap();
    let keys: Vec<u64> = set.keys(&mut handle);
    drop(handle);
    unsafe { set.destroy() };
    debug!("totals: {}", rlu.finish());
    keys
}

/// `writers` threads each add one to both objects of a pair in `rounds` sections, pausing
/// between the two updates on every other round. The remaining threads read the pair `rounds`
/// times and require both values to match inside each section, and never to go backwards.
/// Returns the final value.
pub fn pair_consistency_test<const NUM_THREADS: usize>(
    config: Config,
    writers: usize,
    rounds: u64,
) -> u64 {
    assert!(writers <= NUM_THREADS);
    let rlu: Arc<Rlu<NUM_THREADS>> = Arc::new(Rlu::new(config).unwrap());
    let pair: [RluPtr<u64>; 2] = [rlu::alloc(0).unwrap(), rlu::alloc(0).unwrap()];

    let join_handles: Vec<thread::JoinHandle<()>> = (0..NUM_THREADS)
        .map(|i| {
            let mut handle: ArcThreadHandle<NUM_THREADS> =
                ThreadHandle::register(rlu.clone()).unwrap();
            thread::spawn(move || {
                if i < writers {
                    for round in 0..rounds {
                        handle.execute(|section| unsafe {
                            let mut first: RluPtr<u64> = pair[0];
                            section.update(&mut first, |value| *value += 1)?;
                            if round % 2 == 0 {
                                thread::yield_now();
                            }
                            let mut second: RluPtr<u64> = pair[1];
                            section.update(&mut second, |value| *value += 1)
                        });
                    }
                } else {
                    let mut last_seen: u64 = 0;
                    for _ in 0..rounds {
                        let (first, second) = handle.read(|section| unsafe {
                            let first: u64 = section.get(pair[0]);
                            thread::yield_now();
                            (first, section.get(pair[1]))
                        });
                        assert_eq!(first, second, "a section saw half of a commit");
                        assert!(first >= last_seen, "saw {first} after {last_seen}");
                        last_seen = first;
                    }
                }
                debug!("thread {} finished: {}", handle.thread_id(), handle.stats());
            })
        })
        .collect();

    join_handles
        .into_iter()
        .for_each(|join_handle| join_handle.join().expect("A thread panicked"));

    let mut handle: ArcThreadHandle<NUM_THREADS> = ThreadHandle::register(rlu.clone()).unwrap();
    let values: [u64; 2] = handle.read(|section| unsafe { pair.map(|ptr| section.get(ptr)) });
    drop(handle);
    assert_eq!(values[0], values[1]);
    for ptr in pair {
        unsafe { rlu::free_unprotected(ptr) };
    }
    debug!("totals: {}", rlu.finish());
    values[0]
}
